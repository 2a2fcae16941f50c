use std::collections::BTreeSet;

use spalloc_core::JobId;

use crate::server::protocol::{jobs_changed_message, machines_changed_message};

/// Jobs and machines changed since the previous fan-out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub jobs: BTreeSet<JobId>,
    pub machines: BTreeSet<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty() && self.machines.is_empty()
    }
}

/// Items a client wants to hear about.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchSet<T: Ord> {
    All,
    Only(BTreeSet<T>),
}

impl<T: Ord> Default for WatchSet<T> {
    fn default() -> Self {
        WatchSet::Only(BTreeSet::new())
    }
}

impl<T: Ord + Clone> WatchSet<T> {
    /// `None` watches everything.
    pub fn watch(&mut self, item: Option<T>) {
        match item {
            None => *self = WatchSet::All,
            Some(item) => {
                if let WatchSet::Only(items) = self {
                    items.insert(item);
                }
            }
        }
    }

    /// `None` stops watching everything. Removing a single item has no
    /// effect while everything is watched.
    pub fn unwatch(&mut self, item: Option<T>) {
        match item {
            None => *self = WatchSet::default(),
            Some(item) => {
                if let WatchSet::Only(items) = self {
                    items.remove(&item);
                }
            }
        }
    }

    /// The watched subset of `changed`, in order.
    pub fn filter(&self, changed: &BTreeSet<T>) -> Vec<T> {
        match self {
            WatchSet::All => changed.iter().cloned().collect(),
            WatchSet::Only(items) => changed.intersection(items).cloned().collect(),
        }
    }
}

/// Subscriptions of one client connection.
#[derive(Debug, Default)]
pub struct Watches {
    pub jobs: WatchSet<JobId>,
    pub machines: WatchSet<String>,
}

impl Watches {
    /// Notification lines to send to the client for a set of changes.
    pub fn notifications(&self, changes: &ChangeSet) -> crate::Result<Vec<String>> {
        let mut messages = Vec::new();
        let jobs = self.jobs.filter(&changes.jobs);
        if !jobs.is_empty() {
            messages.push(jobs_changed_message(&jobs)?);
        }
        let machines = self.machines.filter(&changes.machines);
        if !machines.is_empty() {
            messages.push(machines_changed_message(&machines)?);
        }
        Ok(messages)
    }
}
