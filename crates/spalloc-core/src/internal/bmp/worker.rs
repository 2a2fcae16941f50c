use std::collections::BTreeSet;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::internal::bmp::request::RequestGroup;
use crate::internal::bmp::transport::{BmpConnector, BmpTransport};

/// How many times a group is attempted before it is reported as failed.
pub const REQUEST_ATTEMPTS: u32 = 3;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(15);

enum WorkerMessage {
    Group(RequestGroup),
    Stop,
}

/// Background thread executing request groups for a single BMP.
pub struct BmpWorker {
    hostname: String,
    sender: Sender<WorkerMessage>,
    handler_lock: Arc<Mutex<()>>,
    thread: Option<JoinHandle<()>>,
}

impl BmpWorker {
    pub fn start(
        hostname: &str,
        connector: Arc<dyn BmpConnector>,
        retry_delay: Duration,
    ) -> crate::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let handler_lock = Arc::new(Mutex::new(()));
        let mut executor = Executor {
            hostname: hostname.to_string(),
            connector,
            transport: None,
            retry_delay,
        };
        let thread_lock = handler_lock.clone();
        let thread = std::thread::Builder::new()
            .name(format!("bmp-{hostname}"))
            .spawn(move || executor.run(receiver, thread_lock))?;
        log::debug!("BMP worker for {hostname} started");
        Ok(BmpWorker {
            hostname: hostname.to_string(),
            sender,
            handler_lock,
            thread: Some(thread),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Lock held by the worker while it executes commands.
    /// Holding it from outside pauses the worker.
    pub fn handler_lock(&self) -> Arc<Mutex<()>> {
        self.handler_lock.clone()
    }

    /// Queues a group; never blocks.
    pub fn add_requests(&self, group: RequestGroup) {
        if let Err(mut group) = self.try_add_requests(group) {
            group.complete(Err(format!("BMP worker for {} has exited", self.hostname)));
        }
    }

    /// Like [`BmpWorker::add_requests`], but hands the group back uncompleted
    /// when the worker has exited.
    pub fn try_add_requests(&self, group: RequestGroup) -> Result<(), RequestGroup> {
        match self.sender.send(WorkerMessage::Group(group)) {
            Ok(()) => Ok(()),
            Err(error) => match error.0 {
                WorkerMessage::Group(group) => Err(group),
                WorkerMessage::Stop => Ok(()),
            },
        }
    }

    /// Asks the worker to exit once all queued groups are finished.
    pub fn stop(&self) {
        let _ = self.sender.send(WorkerMessage::Stop);
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("BMP worker for {} panicked", self.hostname);
            }
        }
    }
}

impl Drop for BmpWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Executor {
    hostname: String,
    connector: Arc<dyn BmpConnector>,
    transport: Option<Box<dyn BmpTransport>>,
    retry_delay: Duration,
}

impl Executor {
    fn run(&mut self, receiver: Receiver<WorkerMessage>, handler_lock: Arc<Mutex<()>>) {
        let mut stopping = false;
        while !stopping {
            let first = match receiver.recv() {
                Ok(WorkerMessage::Group(group)) => group,
                Ok(WorkerMessage::Stop) | Err(_) => break,
            };
            let _guard = handler_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut batch = vec![first];
            loop {
                match receiver.try_recv() {
                    Ok(WorkerMessage::Group(group)) => batch.push(group),
                    Ok(WorkerMessage::Stop) => {
                        stopping = true;
                        break;
                    }
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                }
            }
            self.execute_batch(batch);
        }
        // Groups which arrived after the stop request
        while let Ok(message) = receiver.try_recv() {
            if let WorkerMessage::Group(mut group) = message {
                group.complete(Err(format!("BMP worker for {} has exited", self.hostname)));
            }
        }
        log::debug!("BMP worker for {} stopped", self.hostname);
    }

    /// Executes groups in order. Neighbouring groups that only switch power
    /// the same way are sent as a single command.
    fn execute_batch(&mut self, batch: Vec<RequestGroup>) {
        let mut groups = batch.into_iter().peekable();
        while let Some(group) = groups.next() {
            match group.pure_power_state() {
                Some(on) => {
                    let mut merged = vec![group];
                    while let Some(next) = groups.next_if(|g| g.pure_power_state() == Some(on)) {
                        merged.push(next);
                    }
                    let boards: Vec<u32> = merged
                        .iter()
                        .flat_map(|g| if on { g.power_on.iter() } else { g.power_off.iter() })
                        .copied()
                        .collect::<BTreeSet<u32>>()
                        .into_iter()
                        .collect();
                    let result = self.attempt(|transport| transport.set_power(&boards, on));
                    for mut group in merged {
                        group.complete(result.clone());
                    }
                }
                None => {
                    let mut group = group;
                    let result = self.attempt(|transport| execute_group(transport, &group));
                    group.complete(result);
                }
            }
        }
    }

    fn attempt<F>(&mut self, mut command: F) -> Result<(), String>
    where
        F: FnMut(&mut dyn BmpTransport) -> crate::Result<()>,
    {
        for attempt in 1..=REQUEST_ATTEMPTS {
            let outcome = match self.connect() {
                Ok(()) => match self.transport.as_mut() {
                    Some(transport) => command(&mut **transport),
                    None => Ok(()),
                },
                Err(error) => Err(error),
            };
            match outcome {
                Ok(()) => return Ok(()),
                Err(error) if attempt < REQUEST_ATTEMPTS => {
                    log::warn!(
                        "Retrying requests on BMP {} after {:?}: {error}",
                        self.hostname,
                        self.retry_delay
                    );
                    std::thread::sleep(self.retry_delay);
                }
                Err(error) => {
                    log::warn!("Requests failed on BMP {}: {error}", self.hostname);
                }
            }
        }
        Err(format!("Requests failed on BMP {}", self.hostname))
    }

    fn connect(&mut self) -> crate::Result<()> {
        if self.transport.is_none() {
            self.transport = Some(self.connector.connect(&self.hostname)?);
        }
        Ok(())
    }
}

fn execute_group(transport: &mut dyn BmpTransport, group: &RequestGroup) -> crate::Result<()> {
    if !group.power_on.is_empty() {
        let boards: Vec<u32> = group.power_on.iter().copied().collect();
        transport.set_power(&boards, true)?;
    }
    for link in &group.links {
        transport.set_link_enabled(link.board, link.direction, link.enable)?;
    }
    if !group.power_off.is_empty() {
        let boards: Vec<u32> = group.power_off.iter().copied().collect();
        transport.set_power(&boards, false)?;
    }
    Ok(())
}
