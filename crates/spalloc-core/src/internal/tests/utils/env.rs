use std::collections::BTreeSet;

use crate::internal::allocator::AllocationRequest;
use crate::internal::bmp::{LinkRequest, RequestGroup};
use crate::internal::common::ids::JobId;
use crate::internal::controller::JobDescription;
use crate::internal::controller::JobState;
use crate::internal::controller::comm::Comm;
use crate::internal::controller::core::Core;
use crate::internal::controller::query;
use crate::internal::controller::reactor::{
    on_bmp_request_complete, on_check_free, on_create_job, on_destroy_job,
    on_destroy_timed_out_jobs, on_power_job_boards, on_set_machines,
};
use crate::internal::geometry::{BoardXyz, FrameId};
use crate::internal::machine::Machine;

/// A request group as the controller handed it to a BMP worker.
#[derive(Debug, Clone)]
pub struct SentGroup {
    pub machine: String,
    pub frame: FrameId,
    pub job_id: JobId,
    pub power_on: BTreeSet<u32>,
    pub power_off: BTreeSet<u32>,
    pub links: Vec<LinkRequest>,
}

#[derive(Default)]
pub struct TestComm {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub sent: Vec<SentGroup>,
}

impl TestComm {
    pub fn take_started(&mut self) -> Vec<String> {
        std::mem::take(&mut self.started)
    }

    pub fn take_stopped(&mut self) -> Vec<String> {
        std::mem::take(&mut self.stopped)
    }

    pub fn take_sent(&mut self, len: usize) -> Vec<SentGroup> {
        assert_eq!(self.sent.len(), len, "sent groups: {:?}", self.sent);
        std::mem::take(&mut self.sent)
    }

    pub fn emptiness_check(&self) {
        if !self.started.is_empty() {
            panic!("Unexpected started machines: {:?}", self.started);
        }
        if !self.stopped.is_empty() {
            panic!("Unexpected stopped machines: {:?}", self.stopped);
        }
        if !self.sent.is_empty() {
            panic!("Unexpected BMP requests: {:?}", self.sent);
        }
    }
}

impl Comm for TestComm {
    fn start_bmp_workers(&mut self, machine: &Machine) {
        self.started.push(machine.name.clone());
    }

    fn stop_bmp_workers(&mut self, machine_name: &str) {
        self.stopped.push(machine_name.to_string());
    }

    fn send_bmp_requests(
        &mut self,
        machine_name: &str,
        frame: FrameId,
        job_id: JobId,
        group: RequestGroup,
    ) {
        self.sent.push(SentGroup {
            machine: machine_name.to_string(),
            frame,
            job_id,
            power_on: group.power_on.clone(),
            power_off: group.power_off.clone(),
            links: group.links.to_vec(),
        });
    }
}

/// Drives the reactor directly with a manual clock.
pub struct TestEnv {
    pub core: Core,
    pub comm: TestComm,
    pub now: f64,
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_cooldown(0.0)
    }

    pub fn with_cooldown(seconds_before_free: f64) -> Self {
        TestEnv {
            core: Core::new(100, seconds_before_free),
            comm: TestComm::default(),
            now: 1000.0,
        }
    }

    pub fn advance(&mut self, seconds: f64) {
        self.now += seconds;
    }

    pub fn set_machines(&mut self, machines: Vec<Machine>) {
        on_set_machines(&mut self.core, &mut self.comm, machines, self.now).unwrap();
    }

    pub fn submit(&mut self, description: JobDescription) -> JobId {
        on_create_job(
            &mut self.core,
            &mut self.comm,
            description,
            Some("client"),
            self.now,
        )
        .unwrap()
    }

    pub fn create_job(&mut self, request: AllocationRequest) -> JobId {
        self.submit(JobDescription::new("owner", request))
    }

    pub fn create_job_on(&mut self, request: AllocationRequest, machine: &str) -> JobId {
        let mut description = JobDescription::new("owner", request);
        description.machine = Some(machine.to_string());
        self.submit(description)
    }

    pub fn destroy_job(&mut self, job_id: JobId, reason: &str) {
        on_destroy_job(
            &mut self.core,
            &mut self.comm,
            job_id,
            Some(reason.to_string()),
            Some("client"),
            self.now,
        );
    }

    pub fn power_job(&mut self, job_id: JobId, power: bool) {
        on_power_job_boards(
            &mut self.core,
            &mut self.comm,
            job_id,
            power,
            Some("client"),
            self.now,
        );
    }

    pub fn destroy_timed_out_jobs(&mut self) {
        on_destroy_timed_out_jobs(&mut self.core, &mut self.comm, self.now);
    }

    pub fn check_free(&mut self) {
        on_check_free(&mut self.core, &mut self.comm, self.now);
    }

    /// Reports success for every group sent so far.
    /// Returns how many groups were completed.
    pub fn complete_bmp(&mut self) -> usize {
        let sent = std::mem::take(&mut self.comm.sent);
        for group in &sent {
            on_bmp_request_complete(&mut self.core, &mut self.comm, group.job_id, Ok(()), self.now);
        }
        sent.len()
    }

    /// Completes groups until no new ones are sent.
    pub fn settle(&mut self) {
        while self.complete_bmp() > 0 {}
    }

    pub fn fail_bmp(&mut self, job_id: JobId, reason: &str) {
        on_bmp_request_complete(
            &mut self.core,
            &mut self.comm,
            job_id,
            Err(reason.to_string()),
            self.now,
        );
    }

    pub fn state(&self, job_id: JobId) -> JobState {
        query::job_state(&self.core, job_id).state
    }

    pub fn reason(&self, job_id: JobId) -> Option<String> {
        query::job_state(&self.core, job_id).reason
    }

    pub fn boards(&self, job_id: JobId) -> BTreeSet<BoardXyz> {
        self.core
            .get_job(job_id)
            .and_then(|job| job.allocation.as_ref())
            .map(|allocation| allocation.boards.clone())
            .unwrap_or_default()
    }

    pub fn machine_of(&self, job_id: JobId) -> Option<String> {
        self.core
            .get_job(job_id)?
            .allocation
            .as_ref()
            .map(|allocation| allocation.machine.clone())
    }
}
