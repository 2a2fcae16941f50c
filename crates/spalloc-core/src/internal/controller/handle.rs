use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::internal::bmp::{BmpConnector, BmpWorker, DEFAULT_RETRY_DELAY};
use crate::internal::common::ids::JobId;
use crate::internal::common::utils::now;
use crate::internal::controller::comm::{BmpWorkers, ControllerComm};
use crate::internal::controller::core::Core;
use crate::internal::controller::job::JobDescription;
use crate::internal::controller::query::{
    self, JobInfo, JobMachineInfo, JobStateInfo, MachineInfo, WhereIs, WhereIsQuery,
};
use crate::internal::controller::reactor;
use crate::internal::controller::snapshot::ControllerSnapshot;
use crate::internal::geometry::{BoardXyz, FrameId, PhysicalLocation};
use crate::internal::machine::Machine;

pub type BackgroundCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub max_retired_jobs: usize,
    /// Cooldown between freeing boards and reusing them.
    pub seconds_before_free: f64,
    /// Pause before a failed BMP request is retried.
    pub bmp_retry_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            max_retired_jobs: 1200,
            seconds_before_free: 30.0,
            bmp_retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

struct ControllerState {
    core: Core,
    workers: BmpWorkers,
}

pub(crate) struct ControllerInner {
    state: Mutex<ControllerState>,
    on_background_state_change: Mutex<Option<Arc<BackgroundCallback>>>,
    stopped: Mutex<Vec<BmpWorker>>,
    this: Weak<ControllerInner>,
}

impl ControllerInner {
    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` under the controller lock, then joins stopped BMP workers,
    /// reports failed BMP submissions and fires the change callback.
    fn with_core<R>(&self, f: impl FnOnce(&mut Core, &mut ControllerComm) -> R) -> R {
        let (result, stopped, failed, changed) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let mut comm = ControllerComm::new(&mut state.workers, &self.this);
            let result = f(&mut state.core, &mut comm);
            let (stopped, failed) = comm.into_deferred();
            (result, stopped, failed, state.core.has_changes())
        };
        for mut worker in stopped {
            worker.join();
        }
        for (job_id, reason) in failed {
            self.on_bmp_request_complete(job_id, Err(reason));
        }
        if changed {
            self.notify_background_state_change();
        }
        result
    }

    pub(crate) fn on_bmp_request_complete(&self, job_id: JobId, result: Result<(), String>) {
        self.with_core(|core, comm| {
            reactor::on_bmp_request_complete(core, comm, job_id, result, now())
        });
    }

    fn notify_background_state_change(&self) {
        let callback = self
            .on_background_state_change
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Thread-safe handle to the allocation service.
///
/// Every operation runs under a single lock. BMP workers run on their own
/// threads and take the lock only briefly to report completed requests.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Controller {
    pub fn new(config: ControllerConfig, connector: Arc<dyn BmpConnector>) -> Self {
        let core = Core::new(config.max_retired_jobs, config.seconds_before_free);
        Self::with_state(core, BmpWorkers::new(connector, config.bmp_retry_delay))
    }

    fn with_state(core: Core, workers: BmpWorkers) -> Self {
        let inner = Arc::new_cyclic(|this| ControllerInner {
            state: Mutex::new(ControllerState { core, workers }),
            on_background_state_change: Mutex::new(None),
            stopped: Mutex::new(Vec::new()),
            this: this.clone(),
        });
        Controller { inner }
    }

    /// Recreates a controller from saved state. BMP workers are started
    /// for every machine and all keepalives are reset.
    pub fn restore(
        snapshot: ControllerSnapshot,
        connector: Arc<dyn BmpConnector>,
        bmp_retry_delay: Duration,
    ) -> crate::Result<Self> {
        let core = Core::from_snapshot(snapshot)?;
        let controller = Self::with_state(core, BmpWorkers::new(connector, bmp_retry_delay));
        controller
            .inner
            .with_core(|core, comm| reactor::on_restore(core, comm, now()));
        Ok(controller)
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        self.inner.lock().core.snapshot()
    }

    /// Sets the function called whenever the job or machine change sets
    /// become non-empty. It is never called with the lock held.
    pub fn set_on_background_state_change(&self, callback: Option<BackgroundCallback>) {
        *self
            .inner
            .on_background_state_change
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = callback.map(Arc::new);
    }

    pub fn max_retired_jobs(&self) -> usize {
        self.inner.lock().core.max_retired_jobs()
    }

    pub fn set_max_retired_jobs(&self, max_retired_jobs: usize) {
        self.inner.lock().core.set_max_retired_jobs(max_retired_jobs);
    }

    pub fn seconds_before_free(&self) -> f64 {
        self.inner.lock().core.job_queue().seconds_before_free()
    }

    pub fn set_seconds_before_free(&self, seconds_before_free: f64) {
        self.inner
            .lock()
            .core
            .job_queue_mut()
            .set_seconds_before_free(seconds_before_free);
    }

    pub fn machines(&self) -> Vec<Machine> {
        self.inner.lock().core.machines().to_vec()
    }

    /// Replaces the set of machines; the order of `machines` is their priority.
    ///
    /// Machines whose hardware description changed are recreated, which
    /// destroys their jobs. Blocks until BMP workers of removed machines
    /// have finished.
    pub fn set_machines(&self, machines: Vec<Machine>) -> crate::Result<()> {
        self.inner
            .with_core(|core, comm| reactor::on_set_machines(core, comm, machines, now()))
    }

    pub fn create_job(&self, description: JobDescription, host: Option<&str>) -> crate::Result<JobId> {
        self.inner
            .with_core(|core, comm| reactor::on_create_job(core, comm, description, host, now()))
    }

    pub fn job_keepalive(&self, job_id: JobId, host: Option<&str>) {
        let mut state = self.inner.lock();
        reactor::on_job_keepalive(&mut state.core, job_id, host, now());
    }

    pub fn get_job_state(&self, job_id: JobId, host: Option<&str>) -> JobStateInfo {
        let mut state = self.inner.lock();
        reactor::on_job_keepalive(&mut state.core, job_id, host, now());
        query::job_state(&state.core, job_id)
    }

    pub fn get_job_machine_info(&self, job_id: JobId, host: Option<&str>) -> Option<JobMachineInfo> {
        let mut state = self.inner.lock();
        reactor::on_job_keepalive(&mut state.core, job_id, host, now());
        query::job_machine_info(&state.core, job_id)
    }

    pub fn power_on_job_boards(&self, job_id: JobId, host: Option<&str>) {
        self.inner.with_core(|core, comm| {
            reactor::on_power_job_boards(core, comm, job_id, true, host, now())
        });
    }

    pub fn power_off_job_boards(&self, job_id: JobId, host: Option<&str>) {
        self.inner.with_core(|core, comm| {
            reactor::on_power_job_boards(core, comm, job_id, false, host, now())
        });
    }

    pub fn destroy_job(&self, job_id: JobId, reason: Option<String>, host: Option<&str>) {
        self.inner.with_core(|core, comm| {
            reactor::on_destroy_job(core, comm, job_id, reason, host, now())
        });
    }

    pub fn list_jobs(&self) -> Vec<JobInfo> {
        query::list_jobs(&self.inner.lock().core)
    }

    pub fn list_machines(&self) -> Vec<MachineInfo> {
        query::list_machines(&self.inner.lock().core)
    }

    pub fn get_board_position(&self, machine: &str, board: BoardXyz) -> Option<PhysicalLocation> {
        query::board_position(&self.inner.lock().core, machine, board)
    }

    pub fn get_board_at_position(
        &self,
        machine: &str,
        location: PhysicalLocation,
    ) -> Option<BoardXyz> {
        query::board_at_position(&self.inner.lock().core, machine, location)
    }

    pub fn where_is(&self, query: &WhereIsQuery) -> Option<WhereIs> {
        query::where_is(&self.inner.lock().core, query)
    }

    pub fn destroy_timed_out_jobs(&self) {
        self.inner
            .with_core(|core, comm| reactor::on_destroy_timed_out_jobs(core, comm, now()));
    }

    pub fn check_free(&self) {
        self.inner
            .with_core(|core, comm| reactor::on_check_free(core, comm, now()));
    }

    /// Ids of jobs changed since the last call.
    pub fn changed_jobs(&self) -> BTreeSet<JobId> {
        self.inner.lock().core.take_changed_jobs()
    }

    /// Names of machines changed since the last call.
    pub fn changed_machines(&self) -> BTreeSet<String> {
        self.inner.lock().core.take_changed_machines()
    }

    /// Lock held by the BMP worker of a frame while it executes commands.
    pub fn bmp_handler_lock(&self, machine: &str, frame: FrameId) -> Option<Arc<Mutex<()>>> {
        self.inner
            .lock()
            .workers
            .get(machine, frame)
            .map(|worker| worker.handler_lock())
    }

    /// Asks all BMP workers to finish their queued requests and exit.
    pub fn stop(&self) {
        let workers = self.inner.lock().workers.stop_all();
        self.inner
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(workers);
    }

    /// Waits for the workers stopped by [`Controller::stop`] to exit.
    pub fn join(&self) {
        let workers = std::mem::take(
            &mut *self
                .inner
                .stopped
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for mut worker in workers {
            worker.join();
        }
    }
}
