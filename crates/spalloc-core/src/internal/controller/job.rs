use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::internal::allocator::AllocationRequest;
use crate::internal::common::ids::JobId;
use crate::internal::geometry::{BoardLink, BoardXyz, ChipXy, WrapAround};

pub const DEFAULT_KEEPALIVE: f64 = 60.0;

/// Lifecycle state of a job as reported to clients.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum JobState {
    /// The job id was never seen or has been forgotten.
    Unknown,
    /// Waiting for a suitable machine.
    Queued,
    /// Boards are being powered on or off.
    Power,
    Ready,
    Destroyed,
}

impl JobState {
    /// Numeric code used on the wire.
    pub fn code(self) -> u8 {
        match self {
            JobState::Unknown => 0,
            JobState::Queued => 1,
            JobState::Power => 2,
            JobState::Ready => 3,
            JobState::Destroyed => 4,
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Unknown => "unknown",
            JobState::Queued => "queued",
            JobState::Power => "power",
            JobState::Ready => "ready",
            JobState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Everything a client specifies when creating a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescription {
    pub owner: String,
    /// Seconds between keepalives before the job is destroyed; `None` never
    /// times out.
    pub keepalive: Option<f64>,
    pub request: AllocationRequest,
    /// Run only on this machine. Mutually exclusive with `tags`.
    pub machine: Option<String>,
    pub tags: Option<BTreeSet<String>>,
}

impl JobDescription {
    pub fn new(owner: &str, request: AllocationRequest) -> Self {
        JobDescription {
            owner: owner.to_string(),
            keepalive: Some(DEFAULT_KEEPALIVE),
            request,
            machine: None,
            tags: None,
        }
    }
}

/// Boards held by a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAllocation {
    pub machine: String,
    pub boards: BTreeSet<BoardXyz>,
    pub periphery: BTreeSet<BoardLink>,
    pub torus: WrapAround,
    /// Size of the allocated system in chips.
    pub width: u32,
    pub height: u32,
    /// Ethernet chip of every board, relative to the job, and its hostname.
    pub connections: BTreeMap<ChipXy, String>,
}

impl JobAllocation {
    /// Board whose Ethernet chip becomes chip (0, 0) of the job.
    ///
    /// Multi-board jobs start at board 0 of their lowest triad, a single
    /// board job is its own origin.
    pub fn origin(&self) -> BoardXyz {
        origin_of(&self.boards)
    }
}

pub(crate) fn origin_of(boards: &BTreeSet<BoardXyz>) -> BoardXyz {
    let x = boards.iter().map(|b| b.0).min().unwrap_or(0);
    let y = boards.iter().map(|b| b.1).min().unwrap_or(0);
    match boards.iter().next() {
        Some(&(_, _, z)) if boards.len() == 1 => (x, y, z),
        _ => (x, y, 0),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner: String,
    /// Unix timestamp of creation.
    pub start_time: f64,
    pub keepalive: Option<f64>,
    pub keepalive_until: Option<f64>,
    /// Host which last touched the job.
    pub keepalive_host: Option<String>,
    pub state: JobState,
    /// Requested power state; `None` until the job gets boards.
    pub power: Option<bool>,
    pub description: JobDescription,
    pub allocation: Option<JobAllocation>,
    /// BMP request groups which must finish before the job is ready.
    pub bmp_requests_until_ready: u32,
}

impl Job {
    pub fn new(id: JobId, description: JobDescription, host: Option<&str>, now: f64) -> Self {
        Job {
            id,
            owner: description.owner.clone(),
            start_time: now,
            keepalive: description.keepalive,
            keepalive_until: description.keepalive.map(|k| now + k),
            keepalive_host: host.map(|h| h.to_string()),
            state: JobState::Queued,
            power: None,
            description,
            allocation: None,
            bmp_requests_until_ready: 0,
        }
    }

    pub fn update_keepalive(&mut self, host: Option<&str>, now: f64) {
        if let Some(host) = host {
            self.keepalive_host = Some(host.to_string());
        }
        self.keepalive_until = self.keepalive.map(|k| now + k);
    }

    pub fn is_timed_out(&self, now: f64) -> bool {
        self.keepalive_until.is_some_and(|until| until < now)
    }
}
