use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::internal::allocator::{Allocation, AllocationRequest, Allocator};
use crate::internal::common::error::SpallocError;
use crate::internal::common::ids::{AllocationId, JobId};
use crate::internal::geometry::{BoardLink, BoardXyz};
use crate::internal::machine::default_tags;

/// Outcome of a queue operation, to be applied by the owner of the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// A pending job received boards on a machine.
    Allocated {
        job_id: JobId,
        machine: String,
        allocation: Allocation,
    },
    /// An allocated job was destroyed.
    ///
    /// When `released` is false the allocation stays reserved until
    /// [`JobQueue::free`] is called for the job.
    Freed {
        job_id: JobId,
        reason: Option<String>,
        released: bool,
    },
    /// A job was removed before it got any boards.
    Cancelled {
        job_id: JobId,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedJob {
    id: JobId,
    /// Explicitly requested machine; excludes `tags`.
    machine_name: Option<String>,
    tags: BTreeSet<String>,
    request: AllocationRequest,
    /// Machine and allocation once the job has boards.
    placement: Option<(String, AllocationId)>,
}

impl QueuedJob {
    fn is_pending(&self) -> bool {
        self.placement.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueMachine {
    name: String,
    tags: BTreeSet<String>,
    allocator: Allocator,
}

/// Matches jobs to the machines able to run them.
///
/// Machines are kept in priority order. Pending jobs are tried oldest first
/// on every eligible machine; a job which does not fit anywhere yet does not
/// hold back younger jobs which do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueue {
    seconds_before_free: f64,
    machines: Vec<QueueMachine>,
    /// Job ids grow monotonically, so this is also submission order.
    jobs: BTreeMap<JobId, QueuedJob>,
    #[serde(skip)]
    postponed: u32,
    #[serde(skip)]
    events: Vec<QueueEvent>,
    /// Time of the latest timed operation; placement passes release
    /// cooled-down boards up to it.
    #[serde(skip)]
    now: f64,
}

impl JobQueue {
    pub fn new(seconds_before_free: f64) -> Self {
        JobQueue {
            seconds_before_free,
            machines: Vec::new(),
            jobs: Default::default(),
            postponed: 0,
            events: Vec::new(),
            now: 0.0,
        }
    }

    /// Events produced since the last call.
    pub fn take_events(&mut self) -> Vec<QueueEvent> {
        std::mem::take(&mut self.events)
    }

    /// Suspends queue processing until the matching [`JobQueue::resume`],
    /// so that several machine changes are applied atomically.
    pub fn postpone(&mut self) {
        self.postponed += 1;
    }

    pub fn resume(&mut self, now: f64) {
        if self.postponed == 0 {
            log::error!("Job queue resumed without being postponed");
            return;
        }
        self.postponed -= 1;
        self.advance(now);
        self.regenerate();
    }

    fn advance(&mut self, now: f64) {
        self.now = self.now.max(now);
    }

    pub fn seconds_before_free(&self) -> f64 {
        self.seconds_before_free
    }

    pub fn set_seconds_before_free(&mut self, seconds_before_free: f64) {
        self.seconds_before_free = seconds_before_free;
        for machine in &mut self.machines {
            machine
                .allocator
                .set_seconds_before_free(seconds_before_free);
        }
    }

    pub fn machine_names(&self) -> impl Iterator<Item = &str> {
        self.machines.iter().map(|m| m.name.as_str())
    }

    pub fn allocator(&self, machine_name: &str) -> Option<&Allocator> {
        self.find_machine(machine_name).map(|i| &self.machines[i].allocator)
    }

    pub fn is_pending(&self, job_id: JobId) -> bool {
        self.jobs.get(&job_id).is_some_and(|job| job.is_pending())
    }

    pub fn contains_job(&self, job_id: JobId) -> bool {
        self.jobs.contains_key(&job_id)
    }

    fn find_machine(&self, name: &str) -> Option<usize> {
        self.machines.iter().position(|m| m.name == name)
    }

    pub fn add_machine(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
        tags: BTreeSet<String>,
        dead_boards: BTreeSet<BoardXyz>,
        dead_links: BTreeSet<BoardLink>,
    ) -> crate::Result<()> {
        if self.find_machine(name).is_some() {
            return Err(SpallocError::InvalidMachine(format!(
                "Machine name {name} already in use"
            )));
        }
        let allocator = Allocator::new(
            width,
            height,
            dead_boards,
            dead_links,
            self.seconds_before_free,
        );
        self.machines.push(QueueMachine {
            name: name.to_string(),
            tags,
            allocator,
        });
        self.regenerate();
        Ok(())
    }

    /// Moves a machine to the lowest priority.
    pub fn move_machine_to_end(&mut self, name: &str) {
        if let Some(index) = self.find_machine(name) {
            let machine = self.machines.remove(index);
            self.machines.push(machine);
        }
    }

    /// Applies changes which do not affect jobs already holding boards.
    pub fn modify_machine(
        &mut self,
        name: &str,
        tags: Option<BTreeSet<String>>,
        dead_boards: Option<BTreeSet<BoardXyz>>,
        dead_links: Option<BTreeSet<BoardLink>>,
    ) -> crate::Result<()> {
        let index = self
            .find_machine(name)
            .ok_or_else(|| SpallocError::InvalidMachine(format!("Unknown machine {name}")))?;
        let machine = &mut self.machines[index];
        if let Some(tags) = tags {
            machine.tags = tags;
        }
        if let Some(dead_boards) = dead_boards {
            machine.allocator.set_dead_boards(dead_boards);
        }
        if let Some(dead_links) = dead_links {
            machine.allocator.set_dead_links(dead_links);
        }
        self.regenerate();
        Ok(())
    }

    /// Removes a machine, destroying every job allocated on it.
    /// The allocations are released immediately.
    pub fn remove_machine(&mut self, name: &str) -> crate::Result<()> {
        let index = self
            .find_machine(name)
            .ok_or_else(|| SpallocError::InvalidMachine(format!("Unknown machine {name}")))?;
        let affected: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| matches!(&job.placement, Some((machine, _)) if machine == name))
            .map(|job| job.id)
            .collect();
        for job_id in affected {
            self.jobs.remove(&job_id);
            self.events.push(QueueEvent::Freed {
                job_id,
                reason: Some("Machine removed.".to_string()),
                released: true,
            });
        }
        self.machines.remove(index);
        self.regenerate();
        Ok(())
    }

    /// Submits a new job. The job is cancelled straight away when no
    /// machine could ever run it.
    pub fn create_job(
        &mut self,
        job_id: JobId,
        request: AllocationRequest,
        machine_name: Option<String>,
        tags: Option<BTreeSet<String>>,
        now: f64,
    ) -> crate::Result<()> {
        self.advance(now);
        if self.jobs.contains_key(&job_id) {
            return Err(SpallocError::InvalidArguments(format!(
                "Job id {job_id} is not unique"
            )));
        }
        if machine_name.is_some() && tags.is_some() {
            return Err(SpallocError::InvalidArguments(
                "Only one of machine and tags may be specified for a job".to_string(),
            ));
        }
        let tags = if machine_name.is_some() {
            BTreeSet::new()
        } else {
            tags.unwrap_or_else(default_tags)
        };
        self.jobs.insert(
            job_id,
            QueuedJob {
                id: job_id,
                machine_name,
                tags,
                request,
                placement: None,
            },
        );
        if self.postponed == 0 && self.check_possible(job_id) {
            self.process_queue();
        }
        Ok(())
    }

    /// Cancels a pending job or starts freeing the boards of an allocated
    /// one. Allocated jobs stay known until [`JobQueue::free`].
    pub fn destroy_job(&mut self, job_id: JobId, reason: Option<String>, now: f64) {
        self.advance(now);
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        if job.is_pending() {
            self.jobs.remove(&job_id);
            self.events.push(QueueEvent::Cancelled { job_id, reason });
        } else {
            self.events.push(QueueEvent::Freed {
                job_id,
                reason,
                released: false,
            });
        }
        self.process_queue();
    }

    /// Returns the boards of a destroyed job to its machine's allocator.
    pub fn free(&mut self, job_id: JobId, now: f64) {
        self.advance(now);
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        if job.is_pending() {
            return;
        }
        if let Some(QueuedJob {
            placement: Some((machine_name, allocation_id)),
            ..
        }) = self.jobs.remove(&job_id)
        {
            if let Some(index) = self.find_machine(&machine_name) {
                self.machines[index].allocator.free(allocation_id, now);
            }
            self.process_queue();
        }
    }

    /// Releases cooled-down allocations on every machine.
    pub fn check_free(&mut self, now: f64) -> bool {
        self.advance(now);
        if self.postponed > 0 {
            return false;
        }
        let mut changed = false;
        for machine in &mut self.machines {
            changed |= machine.allocator.check_free(now);
        }
        if changed {
            self.process_queue();
        }
        changed
    }

    fn eligible_machines(&self, job: &QueuedJob) -> Vec<usize> {
        self.machines
            .iter()
            .enumerate()
            .filter(|(_, machine)| match &job.machine_name {
                Some(name) => &machine.name == name,
                None => job.tags.is_subset(&machine.tags),
            })
            .map(|(index, _)| index)
            .collect()
    }

    /// Cancels the job if no machine could ever satisfy it.
    fn check_possible(&mut self, job_id: JobId) -> bool {
        let Some(job) = self.jobs.get(&job_id) else {
            return false;
        };
        let possible = self
            .eligible_machines(job)
            .into_iter()
            .any(|index| self.machines[index].allocator.alloc_possible(&job.request));
        if !possible {
            log::debug!("No machine can ever run job {job_id}");
            self.jobs.remove(&job_id);
            self.events.push(QueueEvent::Cancelled {
                job_id,
                reason: Some("No suitable machines available.".to_string()),
            });
        }
        possible
    }

    /// Rechecks every pending job against the current set of machines.
    fn regenerate(&mut self) {
        if self.postponed > 0 {
            return;
        }
        let pending: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| job.is_pending())
            .map(|job| job.id)
            .collect();
        for job_id in pending {
            self.check_possible(job_id);
        }
        self.process_queue();
    }

    /// Tries to place every pending job, oldest first.
    fn process_queue(&mut self) {
        if self.postponed > 0 {
            return;
        }
        let pending: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| job.is_pending())
            .map(|job| job.id)
            .collect();
        for job_id in pending {
            let Some(job) = self.jobs.get(&job_id) else {
                continue;
            };
            let candidates = self.eligible_machines(job);
            let request = job.request.clone();
            for index in candidates {
                let machine = &mut self.machines[index];
                if let Some(allocation) = machine.allocator.alloc(&request, self.now) {
                    log::debug!(
                        "Job {job_id} placed on machine {} as allocation {}",
                        machine.name,
                        allocation.id
                    );
                    let machine_name = machine.name.clone();
                    if let Some(job) = self.jobs.get_mut(&job_id) {
                        job.placement = Some((machine_name.clone(), allocation.id));
                    }
                    self.events.push(QueueEvent::Allocated {
                        job_id,
                        machine: machine_name,
                        allocation,
                    });
                    break;
                }
            }
        }
    }
}
