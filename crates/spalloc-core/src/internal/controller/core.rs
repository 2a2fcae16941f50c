use std::collections::{BTreeMap, BTreeSet};

use lru::LruCache;

use crate::internal::common::error::SpallocError;
use crate::internal::common::ids::JobId;
use crate::internal::common::{Map, Set};
use crate::internal::controller::job::Job;
use crate::internal::controller::snapshot::{ControllerSnapshot, STATE_VERSION};
use crate::internal::geometry::BoardXyz;
use crate::internal::machine::Machine;
use crate::internal::scheduler::JobQueue;

/// State owned by the controller.
pub struct Core {
    next_id: u32,
    max_retired_jobs: usize,
    /// Machines in priority order.
    machines: Vec<Machine>,
    job_queue: JobQueue,
    /// Live jobs; ordered by id, hence by creation.
    jobs: BTreeMap<JobId, Job>,
    /// Destruction reasons of recently destroyed jobs.
    retired: LruCache<JobId, Option<String>>,
    /// Destroyed jobs whose boards are still being switched off, with the
    /// number of outstanding BMP request groups.
    powering_down: Map<JobId, u32>,
    changed_jobs: Set<JobId>,
    changed_machines: Set<String>,
}

impl Core {
    pub fn new(max_retired_jobs: usize, seconds_before_free: f64) -> Self {
        Core {
            next_id: 1,
            max_retired_jobs,
            machines: Vec::new(),
            job_queue: JobQueue::new(seconds_before_free),
            jobs: Default::default(),
            retired: LruCache::unbounded(),
            powering_down: Default::default(),
            changed_jobs: Default::default(),
            changed_machines: Default::default(),
        }
    }

    pub fn new_job_id(&mut self) -> JobId {
        let id = JobId::new(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn machines(&self) -> &[Machine] {
        &self.machines
    }

    pub fn get_machine(&self, name: &str) -> Option<&Machine> {
        self.machines.iter().find(|m| m.name == name)
    }

    pub fn set_machines(&mut self, machines: Vec<Machine>) {
        self.machines = machines;
    }

    pub fn job_queue(&self) -> &JobQueue {
        &self.job_queue
    }

    pub fn job_queue_mut(&mut self) -> &mut JobQueue {
        &mut self.job_queue
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn job_ids(&self) -> impl Iterator<Item = JobId> + '_ {
        self.jobs.keys().copied()
    }

    pub fn get_job(&self, job_id: JobId) -> Option<&Job> {
        self.jobs.get(&job_id)
    }

    pub fn get_job_mut(&mut self, job_id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&job_id)
    }

    pub fn insert_job(&mut self, job: Job) -> crate::Result<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(SpallocError::GenericError(format!(
                "Job {} already exists",
                job.id
            )));
        }
        self.jobs.insert(job.id, job);
        Ok(())
    }

    pub fn remove_job(&mut self, job_id: JobId) -> Option<Job> {
        self.jobs.remove(&job_id)
    }

    #[inline]
    pub fn split_jobs_machines_mut(&mut self) -> (&mut BTreeMap<JobId, Job>, &[Machine]) {
        (&mut self.jobs, &self.machines)
    }

    /// Live job holding a board of a machine.
    pub fn job_on_board(&self, machine_name: &str, board: BoardXyz) -> Option<&Job> {
        self.jobs.values().find(|job| {
            job.allocation
                .as_ref()
                .is_some_and(|a| a.machine == machine_name && a.boards.contains(&board))
        })
    }

    pub fn max_retired_jobs(&self) -> usize {
        self.max_retired_jobs
    }

    pub fn set_max_retired_jobs(&mut self, max_retired_jobs: usize) {
        self.max_retired_jobs = max_retired_jobs;
        self.trim_retired();
    }

    pub fn retire_job(&mut self, job_id: JobId, reason: Option<String>) {
        self.retired.push(job_id, reason);
        self.trim_retired();
    }

    fn trim_retired(&mut self) {
        while self.retired.len() > self.max_retired_jobs {
            self.retired.pop_lru();
        }
    }

    /// Destruction reason of a retired job; `None` if the job is not retired.
    pub fn retired_reason(&self, job_id: JobId) -> Option<&Option<String>> {
        self.retired.peek(&job_id)
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    pub fn powering_down(&self, job_id: JobId) -> Option<u32> {
        self.powering_down.get(&job_id).copied()
    }

    pub fn set_powering_down(&mut self, job_id: JobId, remaining: u32) {
        self.powering_down.insert(job_id, remaining);
    }

    pub fn remove_powering_down(&mut self, job_id: JobId) -> Option<u32> {
        self.powering_down.remove(&job_id)
    }

    pub fn powering_down_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.powering_down.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn mark_job_changed(&mut self, job_id: JobId) {
        self.changed_jobs.insert(job_id);
    }

    pub fn mark_machine_changed(&mut self, name: &str) {
        if !self.changed_machines.contains(name) {
            self.changed_machines.insert(name.to_string());
        }
    }

    pub fn has_changes(&self) -> bool {
        !self.changed_jobs.is_empty() || !self.changed_machines.is_empty()
    }

    pub fn take_changed_jobs(&mut self) -> BTreeSet<JobId> {
        std::mem::take(&mut self.changed_jobs).into_iter().collect()
    }

    pub fn take_changed_machines(&mut self) -> BTreeSet<String> {
        std::mem::take(&mut self.changed_machines)
            .into_iter()
            .collect()
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        let mut powering_down: Vec<(JobId, u32)> =
            self.powering_down.iter().map(|(&id, &n)| (id, n)).collect();
        powering_down.sort();
        ControllerSnapshot {
            version: STATE_VERSION,
            next_id: self.next_id,
            max_retired_jobs: self.max_retired_jobs,
            seconds_before_free: self.job_queue.seconds_before_free(),
            machines: self.machines.clone(),
            job_queue: self.job_queue.clone(),
            jobs: self.jobs.values().cloned().collect(),
            // Oldest first, so that restoring preserves eviction order
            retired: self
                .retired
                .iter()
                .rev()
                .map(|(&id, reason)| (id, reason.clone()))
                .collect(),
            powering_down,
        }
    }

    pub fn from_snapshot(snapshot: ControllerSnapshot) -> crate::Result<Self> {
        if snapshot.version != STATE_VERSION {
            return Err(SpallocError::SerializationError(format!(
                "Unsupported state version {} (expected {STATE_VERSION})",
                snapshot.version
            )));
        }
        let mut core = Core::new(snapshot.max_retired_jobs, snapshot.seconds_before_free);
        core.next_id = snapshot.next_id;
        core.machines = snapshot.machines;
        core.job_queue = snapshot.job_queue;
        core.jobs = snapshot.jobs.into_iter().map(|job| (job.id, job)).collect();
        for (job_id, reason) in snapshot.retired {
            core.retire_job(job_id, reason);
        }
        core.powering_down = snapshot.powering_down.into_iter().collect();
        Ok(core)
    }
}
