use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::internal::bmp::{BmpConnector, BmpWorker, RequestGroup};
use crate::internal::common::Map;
use crate::internal::common::ids::JobId;
use crate::internal::controller::handle::ControllerInner;
use crate::internal::geometry::FrameId;
use crate::internal::machine::Machine;

/// Side effects of controller state transitions.
pub trait Comm {
    fn start_bmp_workers(&mut self, machine: &Machine);
    fn stop_bmp_workers(&mut self, machine_name: &str);
    fn send_bmp_requests(
        &mut self,
        machine_name: &str,
        frame: FrameId,
        job_id: JobId,
        group: RequestGroup,
    );
}

/// BMP workers of every machine.
pub(crate) struct BmpWorkers {
    workers: Map<String, BTreeMap<FrameId, BmpWorker>>,
    connector: Arc<dyn BmpConnector>,
    retry_delay: Duration,
}

impl BmpWorkers {
    pub fn new(connector: Arc<dyn BmpConnector>, retry_delay: Duration) -> Self {
        BmpWorkers {
            workers: Default::default(),
            connector,
            retry_delay,
        }
    }

    pub fn get(&self, machine_name: &str, frame: FrameId) -> Option<&BmpWorker> {
        self.workers.get(machine_name)?.get(&frame)
    }

    /// Stops every worker, returning them so they can be joined.
    pub fn stop_all(&mut self) -> Vec<BmpWorker> {
        let mut stopped = Vec::new();
        for (_, frames) in self.workers.drain() {
            for (_, worker) in frames {
                worker.stop();
                stopped.push(worker);
            }
        }
        stopped
    }
}

/// [`Comm`] used by a running controller.
///
/// Stopped workers and failed submissions are collected and handled once
/// the controller lock is released, because both can invoke completion
/// callbacks which need the lock.
pub(crate) struct ControllerComm<'a> {
    workers: &'a mut BmpWorkers,
    controller: &'a Weak<ControllerInner>,
    stopped: Vec<BmpWorker>,
    failed: Vec<(JobId, String)>,
}

impl<'a> ControllerComm<'a> {
    pub fn new(workers: &'a mut BmpWorkers, controller: &'a Weak<ControllerInner>) -> Self {
        ControllerComm {
            workers,
            controller,
            stopped: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn into_deferred(self) -> (Vec<BmpWorker>, Vec<(JobId, String)>) {
        (self.stopped, self.failed)
    }
}

impl Comm for ControllerComm<'_> {
    fn start_bmp_workers(&mut self, machine: &Machine) {
        let mut frames = BTreeMap::new();
        for (&frame, hostname) in &machine.bmp_ips {
            match BmpWorker::start(
                hostname,
                self.workers.connector.clone(),
                self.workers.retry_delay,
            ) {
                Ok(worker) => {
                    frames.insert(frame, worker);
                }
                Err(error) => {
                    log::error!("Cannot start BMP worker for {hostname}: {error}");
                }
            }
        }
        self.workers.workers.insert(machine.name.clone(), frames);
    }

    fn stop_bmp_workers(&mut self, machine_name: &str) {
        if let Some(frames) = self.workers.workers.remove(machine_name) {
            for (_, worker) in frames {
                worker.stop();
                self.stopped.push(worker);
            }
        }
    }

    fn send_bmp_requests(
        &mut self,
        machine_name: &str,
        frame: FrameId,
        job_id: JobId,
        mut group: RequestGroup,
    ) {
        let Some(worker) = self.workers.get(machine_name, frame) else {
            self.failed.push((
                job_id,
                format!("No BMP for frame {frame:?} of machine {machine_name}"),
            ));
            return;
        };
        let controller = self.controller.clone();
        group.set_on_done(Box::new(move |result| {
            if let Some(controller) = controller.upgrade() {
                controller.on_bmp_request_complete(job_id, result);
            }
        }));
        // The callback takes the controller lock, so it must not run here
        if worker.try_add_requests(group).is_err() {
            self.failed.push((
                job_id,
                format!("BMP worker for {} has exited", worker.hostname()),
            ));
        }
    }
}
