use std::sync::Arc;

use spalloc_core::Controller;
use tokio::sync::{Notify, broadcast};

use crate::server::notify::ChangeSet;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// State shared by all client connections.
#[derive(Clone)]
pub struct ServerState {
    inner: Arc<ServerStateInner>,
}

struct ServerStateInner {
    controller: Controller,
    change_signal: Arc<Notify>,
    changes: broadcast::Sender<Arc<ChangeSet>>,
}

impl ServerState {
    /// Wraps a controller and registers for its background changes.
    /// [`ServerState::forward_changes`] must be running for clients to
    /// receive notifications.
    pub fn new(controller: Controller) -> Self {
        let change_signal = Arc::new(Notify::new());
        let signal = change_signal.clone();
        controller.set_on_background_state_change(Some(Box::new(move || signal.notify_one())));
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        ServerState {
            inner: Arc::new(ServerStateInner {
                controller,
                change_signal,
                changes,
            }),
        }
    }

    pub fn controller(&self) -> &Controller {
        &self.inner.controller
    }

    /// Asks the forwarder to collect changes from the controller.
    pub fn signal_changes(&self) {
        self.inner.change_signal.notify_one();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ChangeSet>> {
        self.inner.changes.subscribe()
    }

    /// Drains the controller's change sets whenever signalled and
    /// broadcasts them to the connected clients.
    pub async fn forward_changes(self) {
        loop {
            self.inner.change_signal.notified().await;
            let changes = ChangeSet {
                jobs: self.inner.controller.changed_jobs(),
                machines: self.inner.controller.changed_machines(),
            };
            if changes.is_empty() {
                continue;
            }
            log::debug!(
                "Changes: jobs {:?}, machines {:?}",
                changes.jobs,
                changes.machines
            );
            // Nobody is connected when sending fails
            let _ = self.inner.changes.send(Arc::new(changes));
        }
    }
}
