use std::collections::BTreeSet;
use std::sync::mpsc::{Receiver, channel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::internal::bmp::{BmpConnector, BmpTransport, RequestGroup};
use crate::internal::common::error::SpallocError;
use crate::internal::geometry::Direction;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BmpCommand {
    Power { boards: Vec<u32>, on: bool },
    Link { board: u32, direction: Direction, enabled: bool },
}

#[derive(Default)]
struct ScriptState {
    commands: Vec<(String, BmpCommand)>,
    failing: BTreeSet<String>,
    connections: usize,
}

/// Connector whose transports record every command and fail on request.
#[derive(Default)]
pub struct ScriptedConnector {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn commands(&self) -> Vec<(String, BmpCommand)> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn commands_for(&self, hostname: &str) -> Vec<BmpCommand> {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|(host, _)| host == hostname)
            .map(|(_, command)| command.clone())
            .collect()
    }

    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    /// Makes every command sent to `hostname` fail (or succeed again).
    pub fn set_failing(&self, hostname: &str, failing: bool) {
        let mut state = self.state.lock().unwrap();
        if failing {
            state.failing.insert(hostname.to_string());
        } else {
            state.failing.remove(hostname);
        }
    }
}

impl BmpConnector for ScriptedConnector {
    fn connect(&self, hostname: &str) -> crate::Result<Box<dyn BmpTransport>> {
        self.state.lock().unwrap().connections += 1;
        Ok(Box::new(ScriptedTransport {
            hostname: hostname.to_string(),
            state: self.state.clone(),
        }))
    }
}

struct ScriptedTransport {
    hostname: String,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedTransport {
    fn record(&self, command: BmpCommand) -> crate::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(&self.hostname) {
            return Err(SpallocError::GenericError("scripted failure".to_string()));
        }
        state.commands.push((self.hostname.clone(), command));
        Ok(())
    }
}

impl BmpTransport for ScriptedTransport {
    fn set_power(&mut self, boards: &[u32], on: bool) -> crate::Result<()> {
        self.record(BmpCommand::Power {
            boards: boards.to_vec(),
            on,
        })
    }

    fn set_link_enabled(
        &mut self,
        board: u32,
        direction: Direction,
        enabled: bool,
    ) -> crate::Result<()> {
        self.record(BmpCommand::Link {
            board,
            direction,
            enabled,
        })
    }
}

/// A request group reporting its outcome through the returned receiver.
pub fn observed_group() -> (RequestGroup, Receiver<Result<(), String>>) {
    let (sender, receiver) = channel();
    let group = RequestGroup::new(Box::new(move |result| {
        let _ = sender.send(result);
    }));
    (group, receiver)
}

pub fn recv_result(receiver: &Receiver<Result<(), String>>) -> Result<(), String> {
    receiver
        .recv_timeout(Duration::from_secs(10))
        .expect("request group did not complete")
}
