use std::collections::{BTreeMap, BTreeSet};

use crate::internal::allocator::Allocation;
use crate::internal::bmp::RequestGroup;
use crate::internal::common::error::SpallocError;
use crate::internal::common::ids::JobId;
use crate::internal::common::utils::format_comma_delimited;
use crate::internal::controller::comm::Comm;
use crate::internal::controller::core::Core;
use crate::internal::controller::job::{Job, JobAllocation, JobDescription, JobState, origin_of};
use crate::internal::geometry::{
    BOARD_CHIPS, FrameId, board_to_chip, triad_dimensions_to_chips,
};
use crate::internal::machine::{Machine, validate_machines};
use crate::internal::scheduler::QueueEvent;

pub(crate) fn on_set_machines(
    core: &mut Core,
    comm: &mut impl Comm,
    machines: Vec<Machine>,
    now: f64,
) -> crate::Result<()> {
    validate_machines(&machines)?;

    let before: BTreeSet<String> = core.machines().iter().map(|m| m.name.clone()).collect();
    let after: BTreeSet<String> = machines.iter().map(|m| m.name.clone()).collect();
    let mut added: BTreeSet<String> = after.difference(&before).cloned().collect();
    let mut removed: BTreeSet<String> = before.difference(&after).cloned().collect();
    let mut changed = BTreeSet::new();

    for new in machines.iter().filter(|m| before.contains(&m.name)) {
        let Some(old) = core.get_machine(&new.name) else {
            continue;
        };
        if old == new {
            continue;
        }
        if old.differs_in_hardware(new) {
            removed.insert(new.name.clone());
            added.insert(new.name.clone());
        } else {
            changed.insert(new.name.clone());
        }
    }
    log::debug!(
        "Updating machines: added=[{}] removed=[{}] changed=[{}]",
        format_comma_delimited(&added),
        format_comma_delimited(&removed),
        format_comma_delimited(&changed)
    );

    core.job_queue_mut().postpone();
    for name in &removed {
        if let Err(error) = core.job_queue_mut().remove_machine(name) {
            log::error!("Removing machine {name} failed: {error}");
        }
        comm.stop_bmp_workers(name);
    }
    for new in machines.iter().filter(|m| changed.contains(&m.name)) {
        if let Err(error) = core.job_queue_mut().modify_machine(
            &new.name,
            Some(new.tags.clone()),
            Some(new.dead_boards.clone()),
            Some(new.dead_links.clone()),
        ) {
            log::error!("Modifying machine {} failed: {error}", new.name);
        }
    }
    for new in machines.iter().filter(|m| added.contains(&m.name)) {
        comm.start_bmp_workers(new);
        if let Err(error) = core.job_queue_mut().add_machine(
            &new.name,
            new.width,
            new.height,
            new.tags.clone(),
            new.dead_boards.clone(),
            new.dead_links.clone(),
        ) {
            log::error!("Adding machine {} failed: {error}", new.name);
        }
    }
    for machine in &machines {
        core.job_queue_mut().move_machine_to_end(&machine.name);
    }
    core.set_machines(machines);
    core.job_queue_mut().resume(now);
    apply_queue_events(core, comm, now);

    for name in added.iter().chain(&changed).chain(&removed) {
        core.mark_machine_changed(name);
    }
    Ok(())
}

pub(crate) fn on_create_job(
    core: &mut Core,
    comm: &mut impl Comm,
    description: JobDescription,
    host: Option<&str>,
    now: f64,
) -> crate::Result<JobId> {
    description.request.validate()?;
    if description.machine.is_some() && description.tags.is_some() {
        return Err(SpallocError::InvalidArguments(
            "Only one of machine and tags may be specified for a job".to_string(),
        ));
    }

    let job_id = core.new_job_id();
    log::info!(
        "create_job({:?}) as job {job_id} for {} from {}",
        description.request.shape,
        description.owner,
        host.unwrap_or("internal")
    );
    let request = description.request.clone();
    let machine = description.machine.clone();
    let tags = description.tags.clone();
    core.insert_job(Job::new(job_id, description, host, now))?;
    core.mark_job_changed(job_id);
    core.job_queue_mut()
        .create_job(job_id, request, machine, tags, now)?;
    apply_queue_events(core, comm, now);
    Ok(job_id)
}

pub(crate) fn on_job_keepalive(core: &mut Core, job_id: JobId, host: Option<&str>, now: f64) {
    if let Some(job) = core.get_job_mut(job_id) {
        job.update_keepalive(host, now);
    }
}

pub(crate) fn on_destroy_job(
    core: &mut Core,
    comm: &mut impl Comm,
    job_id: JobId,
    reason: Option<String>,
    host: Option<&str>,
    now: f64,
) {
    if core.get_job(job_id).is_none() {
        return;
    }
    log::info!(
        "destroy_job({job_id}, {}) from {}",
        reason.as_deref().unwrap_or("-"),
        host.unwrap_or("internal")
    );
    core.job_queue_mut().destroy_job(job_id, reason, now);
    apply_queue_events(core, comm, now);
}

/// Power on (or reset) or power off the boards of a job.
/// Powering on also isolates the job by disabling its peripheral links.
pub(crate) fn on_power_job_boards(
    core: &mut Core,
    comm: &mut impl Comm,
    job_id: JobId,
    power: bool,
    host: Option<&str>,
    now: f64,
) {
    log::info!(
        "power_job({job_id}, {}) from {}",
        if power { "On" } else { "Off" },
        host.unwrap_or("internal")
    );
    on_job_keepalive(core, job_id, host, now);
    let (jobs, machines) = core.split_jobs_machines_mut();
    let Some(job) = jobs.get_mut(&job_id) else {
        return;
    };
    let Some(machine) = job
        .allocation
        .as_ref()
        .and_then(|a| machines.iter().find(|m| m.name == a.machine))
    else {
        return;
    };
    send_power_commands(comm, machine, job, power, if power { Some(false) } else { None });
    core.mark_job_changed(job_id);
}

pub(crate) fn on_destroy_timed_out_jobs(core: &mut Core, comm: &mut impl Comm, now: f64) {
    let timed_out: Vec<JobId> = core
        .jobs()
        .filter(|job| job.is_timed_out(now))
        .map(|job| job.id)
        .collect();
    for job_id in timed_out {
        on_destroy_job(
            core,
            comm,
            job_id,
            Some("Job timed out.".to_string()),
            None,
            now,
        );
    }
}

pub(crate) fn on_check_free(core: &mut Core, comm: &mut impl Comm, now: f64) {
    if core.job_queue_mut().check_free(now) {
        apply_queue_events(core, comm, now);
    }
}

/// Called when a BMP request group of a job finishes.
///
/// A failure destroys the job. Once all groups of a live job finish it
/// becomes ready; once all groups of a destroyed job finish its boards are
/// handed back to the allocator.
pub(crate) fn on_bmp_request_complete(
    core: &mut Core,
    comm: &mut impl Comm,
    job_id: JobId,
    result: Result<(), String>,
    now: f64,
) {
    if let Err(reason) = &result {
        log::warn!("BMP request of job {job_id} failed: {reason}");
        on_destroy_job(
            core,
            comm,
            job_id,
            Some(format!("Machine configuration failed. Error: {reason}")),
            None,
            now,
        );
    }

    if let Some(job) = core.get_job_mut(job_id) {
        if job.bmp_requests_until_ready == 0 {
            log::error!("Unexpected BMP completion for job {job_id}");
            return;
        }
        job.bmp_requests_until_ready -= 1;
        if job.bmp_requests_until_ready == 0 {
            job.state = JobState::Ready;
            core.mark_job_changed(job_id);
        }
    } else if let Some(remaining) = core.powering_down(job_id) {
        if remaining > 1 {
            core.set_powering_down(job_id, remaining - 1);
        } else {
            core.remove_powering_down(job_id);
            log::debug!("Boards of job {job_id} are off, releasing them");
            core.job_queue_mut().free(job_id, now);
            apply_queue_events(core, comm, now);
        }
    }
}

/// Brings a freshly restored core back to life.
///
/// Keepalives are reset to give clients time to reconnect. BMP requests
/// which were in flight when the state was saved are lost, so jobs waiting
/// for them get their power state applied again and boards of destroyed
/// jobs are released.
pub(crate) fn on_restore(core: &mut Core, comm: &mut impl Comm, now: f64) {
    let machines: Vec<Machine> = core.machines().to_vec();
    for machine in &machines {
        comm.start_bmp_workers(machine);
    }

    for job_id in core.powering_down_ids() {
        core.remove_powering_down(job_id);
        core.job_queue_mut().free(job_id, now);
    }

    let (jobs, machines) = core.split_jobs_machines_mut();
    for job in jobs.values_mut() {
        job.update_keepalive(None, now);
        if job.bmp_requests_until_ready == 0 {
            continue;
        }
        job.bmp_requests_until_ready = 0;
        let power = job.power.unwrap_or(true);
        if let Some(machine) = job
            .allocation
            .as_ref()
            .and_then(|a| machines.iter().find(|m| m.name == a.machine))
        {
            send_power_commands(comm, machine, job, power, if power { Some(false) } else { None });
        }
    }
    apply_queue_events(core, comm, now);
}

/// Applies everything the job queue decided until it has nothing more to say.
fn apply_queue_events(core: &mut Core, comm: &mut impl Comm, now: f64) {
    loop {
        let events = core.job_queue_mut().take_events();
        if events.is_empty() {
            break;
        }
        for event in events {
            match event {
                QueueEvent::Allocated {
                    job_id,
                    machine,
                    allocation,
                } => on_job_allocated(core, comm, job_id, &machine, allocation),
                QueueEvent::Freed {
                    job_id,
                    reason,
                    released,
                } => teardown_job(core, comm, job_id, reason, !released, now),
                QueueEvent::Cancelled { job_id, reason } => teardown_job(
                    core,
                    comm,
                    job_id,
                    Some(format!("Cancelled: {}", reason.unwrap_or_default())),
                    false,
                    now,
                ),
            }
        }
    }
}

fn on_job_allocated(
    core: &mut Core,
    comm: &mut impl Comm,
    job_id: JobId,
    machine_name: &str,
    allocation: Allocation,
) {
    let (jobs, machines) = core.split_jobs_machines_mut();
    let (Some(job), Some(machine)) = (
        jobs.get_mut(&job_id),
        machines.iter().find(|m| m.name == machine_name),
    ) else {
        log::error!("Allocation {} for unknown job {job_id}", allocation.id);
        return;
    };

    let (ox, oy, oz) = origin_of(&allocation.boards);
    let (width, height) = if allocation.boards.len() > 1 {
        let max_x = allocation.boards.iter().map(|b| b.0).max().unwrap_or(ox);
        let max_y = allocation.boards.iter().map(|b| b.1).max().unwrap_or(oy);
        triad_dimensions_to_chips(max_x - ox + 1, max_y - oy + 1, allocation.torus)
    } else {
        (BOARD_CHIPS, BOARD_CHIPS)
    };
    let connections: BTreeMap<_, _> = allocation
        .boards
        .iter()
        .filter_map(|&(x, y, z)| {
            let ip = machine.spinnaker_ips.get(&(x, y, z))?;
            let chip = board_to_chip(x as i64 - ox as i64, y as i64 - oy as i64, z - oz);
            Some((chip, ip.clone()))
        })
        .collect();
    log::info!(
        "Job {job_id} allocated {} board(s) on machine {machine_name}",
        allocation.boards.len()
    );
    job.allocation = Some(JobAllocation {
        machine: machine_name.to_string(),
        boards: allocation.boards,
        periphery: allocation.periphery,
        torus: allocation.torus,
        width,
        height,
        connections,
    });
    send_power_commands(comm, machine, job, true, Some(false));
    core.mark_job_changed(job_id);
    core.mark_machine_changed(machine_name);
}

/// Retires a destroyed job; its boards are switched off when `power_off`
/// is set, and released once that finishes.
fn teardown_job(
    core: &mut Core,
    comm: &mut impl Comm,
    job_id: JobId,
    reason: Option<String>,
    power_off: bool,
    now: f64,
) {
    let Some(mut job) = core.remove_job(job_id) else {
        if !power_off {
            // The machine of a job which was already powering down went away
            core.remove_powering_down(job_id);
        }
        return;
    };
    core.retire_job(job_id, reason);
    core.mark_job_changed(job_id);

    let machine_name = job.allocation.as_ref().map(|a| a.machine.clone());
    if let Some(machine_name) = machine_name {
        core.mark_machine_changed(&machine_name);
        if power_off {
            if let Some(machine) = core.get_machine(&machine_name) {
                send_power_commands(comm, machine, &mut job, false, None);
            }
            if job.bmp_requests_until_ready > 0 {
                core.set_powering_down(job_id, job.bmp_requests_until_ready);
            } else {
                core.job_queue_mut().free(job_id, now);
            }
        }
    }
    match &job.keepalive_host {
        Some(host) => log::info!("Completed shutdown of job {job_id} (owner-host: {host})"),
        None => log::info!("Completed shutdown of job {job_id}"),
    }
}

/// Sends power and link commands for the boards of a job, one group per
/// BMP, and moves the job into the power state.
fn send_power_commands(
    comm: &mut impl Comm,
    machine: &Machine,
    job: &mut Job,
    power: bool,
    link_enable: Option<bool>,
) {
    let Some(allocation) = &job.allocation else {
        return;
    };
    let mut groups: BTreeMap<FrameId, RequestGroup> = BTreeMap::new();
    for board in &allocation.boards {
        let Some(&(c, f, b)) = machine.board_locations.get(board) else {
            log::error!("Board {board:?} of machine {} has no location", machine.name);
            continue;
        };
        log::info!(
            "power({b}, {power}) on BMP {} for job {}",
            machine.bmp_ips.get(&(c, f)).map(String::as_str).unwrap_or("?"),
            job.id
        );
        groups.entry((c, f)).or_default().power(b, power);
    }
    if let Some(enable) = link_enable {
        for &(x, y, z, direction) in &allocation.periphery {
            let Some(&(c, f, b)) = machine.board_locations.get(&(x, y, z)) else {
                continue;
            };
            log::info!(
                "link({b}, {direction}, {enable}) on BMP {} for job {}",
                machine.bmp_ips.get(&(c, f)).map(String::as_str).unwrap_or("?"),
                job.id
            );
            groups.entry((c, f)).or_default().link(b, direction, enable);
        }
    }

    job.bmp_requests_until_ready += groups.len() as u32;
    for (frame, group) in groups {
        comm.send_bmp_requests(&machine.name, frame, job.id, group);
    }
    job.state = JobState::Power;
    job.power = Some(power);
}
