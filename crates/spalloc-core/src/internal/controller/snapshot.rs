use serde::{Deserialize, Serialize};

use crate::internal::common::ids::JobId;
use crate::internal::controller::job::Job;
use crate::internal::machine::Machine;
use crate::internal::scheduler::JobQueue;

/// Bumped whenever the layout of [`ControllerSnapshot`] changes.
pub const STATE_VERSION: u32 = 1;

/// Persistent part of the controller state.
///
/// BMP workers are not part of it; they are recreated on restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSnapshot {
    pub version: u32,
    pub next_id: u32,
    pub max_retired_jobs: usize,
    pub seconds_before_free: f64,
    pub machines: Vec<Machine>,
    /// Also holds the allocator of every machine.
    pub job_queue: JobQueue,
    pub jobs: Vec<Job>,
    /// Retired jobs and their destruction reasons, oldest first.
    pub retired: Vec<(JobId, Option<String>)>,
    pub powering_down: Vec<(JobId, u32)>,
}
