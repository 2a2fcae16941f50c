use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};

use smallvec::SmallVec;

use crate::internal::geometry::Direction;

/// Invoked once a group finishes, with the failure reason on error.
pub type CompletionCallback = Box<dyn FnOnce(Result<(), String>) + Send>;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LinkRequest {
    pub board: u32,
    pub direction: Direction,
    pub enable: bool,
}

/// Commands for one BMP which complete as a unit.
///
/// Executed as: power on, then link changes, then power off.
#[derive(Default)]
pub struct RequestGroup {
    pub power_on: BTreeSet<u32>,
    pub power_off: BTreeSet<u32>,
    pub links: SmallVec<[LinkRequest; 6]>,
    on_done: Option<CompletionCallback>,
}

impl Debug for RequestGroup {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGroup")
            .field("power_on", &self.power_on)
            .field("power_off", &self.power_off)
            .field("links", &self.links)
            .finish()
    }
}

impl RequestGroup {
    pub fn new(on_done: CompletionCallback) -> Self {
        RequestGroup {
            on_done: Some(on_done),
            ..Default::default()
        }
    }

    pub fn power(&mut self, board: u32, on: bool) {
        if on {
            self.power_on.insert(board);
        } else {
            self.power_off.insert(board);
        }
    }

    pub fn link(&mut self, board: u32, direction: Direction, enable: bool) {
        self.links.push(LinkRequest {
            board,
            direction,
            enable,
        });
    }

    pub fn set_on_done(&mut self, on_done: CompletionCallback) {
        self.on_done = Some(on_done);
    }

    /// Power state shared by every command of a group consisting only of
    /// power commands, `None` otherwise.
    pub(crate) fn pure_power_state(&self) -> Option<bool> {
        if !self.links.is_empty() {
            return None;
        }
        match (self.power_on.is_empty(), self.power_off.is_empty()) {
            (false, true) => Some(true),
            (true, false) => Some(false),
            _ => None,
        }
    }

    pub(crate) fn complete(&mut self, result: Result<(), String>) {
        if let Some(on_done) = self.on_done.take() {
            on_done(result);
        }
    }
}
