use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::internal::common::error::SpallocError;
use crate::internal::common::ids::JobId;
use crate::internal::controller::core::Core;
use crate::internal::controller::job::{Job, JobDescription, JobState};
use crate::internal::geometry::{
    BoardLink, BoardXyz, ChipXy, PhysicalLocation, WrapAround, board_local_chip, board_to_chip,
    chip_to_board, triad_dimensions_to_chips,
};
use crate::internal::machine::Machine;

#[derive(Debug, Clone, PartialEq)]
pub struct JobStateInfo {
    pub state: JobState,
    pub power: Option<bool>,
    pub keepalive: Option<f64>,
    pub reason: Option<String>,
    pub start_time: Option<f64>,
    pub keepalive_host: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobMachineInfo {
    pub width: u32,
    pub height: u32,
    pub connections: BTreeMap<ChipXy, String>,
    pub machine_name: String,
    pub boards: BTreeSet<BoardXyz>,
}

#[derive(Debug, Clone)]
pub struct JobInfo {
    pub job_id: JobId,
    pub owner: String,
    pub start_time: f64,
    pub keepalive: Option<f64>,
    pub state: JobState,
    pub power: Option<bool>,
    pub args: Vec<u32>,
    pub description: JobDescription,
    pub allocated_machine_name: Option<String>,
    pub boards: Option<BTreeSet<BoardXyz>>,
    pub keepalive_host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineInfo {
    pub name: String,
    pub tags: BTreeSet<String>,
    pub width: u32,
    pub height: u32,
    pub dead_boards: BTreeSet<BoardXyz>,
    pub dead_links: BTreeSet<BoardLink>,
}

/// A location expressed in every coordinate system at once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WhereIs {
    pub machine: String,
    pub logical: BoardXyz,
    pub physical: PhysicalLocation,
    /// Chip coordinate when the whole machine is booted as one system.
    pub chip: ChipXy,
    /// Chip coordinate relative to the board's Ethernet chip.
    pub board_chip: (u32, u32),
    pub job_id: Option<JobId>,
    /// Chip coordinate within the job occupying the board.
    pub job_chip: Option<ChipXy>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WhereIsQuery {
    Logical {
        machine: String,
        x: i64,
        y: i64,
        z: u32,
    },
    Physical {
        machine: String,
        cabinet: u32,
        frame: u32,
        board: u32,
    },
    Chip {
        machine: String,
        chip_x: i64,
        chip_y: i64,
    },
    JobChip {
        job_id: JobId,
        chip_x: i64,
        chip_y: i64,
    },
}

impl WhereIsQuery {
    /// Builds a query from named arguments. Exactly one of the supported
    /// combinations must be given.
    pub fn from_named(
        machine: Option<String>,
        job_id: Option<JobId>,
        numbers: &BTreeMap<String, i64>,
    ) -> crate::Result<Self> {
        let mut keys: BTreeSet<&str> = numbers.keys().map(|k| k.as_str()).collect();
        if machine.is_some() {
            keys.insert("machine");
        }
        if job_id.is_some() {
            keys.insert("job_id");
        }
        let get = |key: &str| numbers.get(key).copied().unwrap_or_default();
        let unsigned = |key: &str| {
            u32::try_from(get(key)).map_err(|_| {
                SpallocError::InvalidArguments(format!("{key} must be a non-negative integer"))
            })
        };
        let has_keys = |expected: &[&str]| keys == expected.iter().copied().collect::<BTreeSet<&str>>();

        match (machine, job_id) {
            (Some(machine), None) if has_keys(&["machine", "x", "y", "z"]) => {
                Ok(WhereIsQuery::Logical {
                    machine,
                    x: get("x"),
                    y: get("y"),
                    z: unsigned("z")?,
                })
            }
            (Some(machine), None) if has_keys(&["machine", "cabinet", "frame", "board"]) => {
                Ok(WhereIsQuery::Physical {
                    machine,
                    cabinet: unsigned("cabinet")?,
                    frame: unsigned("frame")?,
                    board: unsigned("board")?,
                })
            }
            (Some(machine), None) if has_keys(&["machine", "chip_x", "chip_y"]) => {
                Ok(WhereIsQuery::Chip {
                    machine,
                    chip_x: get("chip_x"),
                    chip_y: get("chip_y"),
                })
            }
            (None, Some(job_id)) if has_keys(&["job_id", "chip_x", "chip_y"]) => {
                Ok(WhereIsQuery::JobChip {
                    job_id,
                    chip_x: get("chip_x"),
                    chip_y: get("chip_y"),
                })
            }
            _ => Err(SpallocError::InvalidArguments(format!(
                "no location query takes {}",
                keys.iter().copied().collect::<Vec<_>>().join(", ")
            ))),
        }
    }
}

pub(crate) fn job_state(core: &Core, job_id: JobId) -> JobStateInfo {
    if let Some(job) = core.get_job(job_id) {
        return JobStateInfo {
            state: job.state,
            power: job.power,
            keepalive: job.keepalive,
            reason: None,
            start_time: Some(job.start_time),
            keepalive_host: job.keepalive_host.clone(),
        };
    }
    let (state, reason) = match core.retired_reason(job_id) {
        Some(reason) => (JobState::Destroyed, reason.clone()),
        None => (JobState::Unknown, None),
    };
    JobStateInfo {
        state,
        power: None,
        keepalive: None,
        reason,
        start_time: None,
        keepalive_host: None,
    }
}

pub(crate) fn job_machine_info(core: &Core, job_id: JobId) -> Option<JobMachineInfo> {
    let allocation = core.get_job(job_id)?.allocation.as_ref()?;
    Some(JobMachineInfo {
        width: allocation.width,
        height: allocation.height,
        connections: allocation.connections.clone(),
        machine_name: allocation.machine.clone(),
        boards: allocation.boards.clone(),
    })
}

pub(crate) fn list_jobs(core: &Core) -> Vec<JobInfo> {
    core.jobs()
        .map(|job| JobInfo {
            job_id: job.id,
            owner: job.owner.clone(),
            start_time: job.start_time,
            keepalive: job.keepalive,
            state: job.state,
            power: job.power,
            args: job.description.request.shape.to_args(),
            description: job.description.clone(),
            allocated_machine_name: job.allocation.as_ref().map(|a| a.machine.clone()),
            boards: job.allocation.as_ref().map(|a| a.boards.clone()),
            keepalive_host: job.keepalive_host.clone(),
        })
        .collect()
}

pub(crate) fn list_machines(core: &Core) -> Vec<MachineInfo> {
    core.machines()
        .iter()
        .map(|machine| MachineInfo {
            name: machine.name.clone(),
            tags: machine.tags.clone(),
            width: machine.width,
            height: machine.height,
            dead_boards: machine.dead_boards.clone(),
            dead_links: machine.dead_links.clone(),
        })
        .collect()
}

pub(crate) fn board_position(core: &Core, machine: &str, board: BoardXyz) -> Option<PhysicalLocation> {
    core.get_machine(machine)?.board_locations.get(&board).copied()
}

pub(crate) fn board_at_position(
    core: &Core,
    machine: &str,
    location: PhysicalLocation,
) -> Option<BoardXyz> {
    core.get_machine(machine)?.board_at_position(location)
}

pub(crate) fn where_is(core: &Core, query: &WhereIsQuery) -> Option<WhereIs> {
    match query {
        WhereIsQuery::Logical { machine, x, y, z } => {
            if *z > 2 {
                return None;
            }
            let machine = core.get_machine(machine)?;
            let (chip_x, chip_y) = board_to_chip(*x, *y, *z);
            locate(core, machine, chip_x, chip_y)
        }
        WhereIsQuery::Physical {
            machine,
            cabinet,
            frame,
            board,
        } => {
            let machine = core.get_machine(machine)?;
            let (x, y, z) = machine.board_at_position((*cabinet, *frame, *board))?;
            let (chip_x, chip_y) = board_to_chip(x as i64, y as i64, z);
            locate(core, machine, chip_x, chip_y)
        }
        WhereIsQuery::Chip {
            machine,
            chip_x,
            chip_y,
        } => {
            let machine = core.get_machine(machine)?;
            locate(core, machine, *chip_x, *chip_y)
        }
        WhereIsQuery::JobChip {
            job_id,
            chip_x,
            chip_y,
        } => {
            let allocation = core.get_job(*job_id)?.allocation.as_ref()?;
            let (ox, oy, oz) = allocation.origin();
            let (dx, dy) = board_to_chip(ox as i64, oy as i64, oz);
            let machine = core.get_machine(&allocation.machine)?;
            let found = locate(core, machine, chip_x + dx, chip_y + dy)?;
            (found.job_id == Some(*job_id)).then_some(found)
        }
    }
}

fn locate(core: &Core, machine: &Machine, chip_x: i64, chip_y: i64) -> Option<WhereIs> {
    let (chip_w, chip_h) = triad_dimensions_to_chips(machine.width, machine.height, WrapAround::BOTH);
    let chip_x = chip_x.rem_euclid(chip_w as i64);
    let chip_y = chip_y.rem_euclid(chip_h as i64);
    let board_chip = board_local_chip(chip_x, chip_y);
    let logical = chip_to_board(chip_x, chip_y, chip_w, chip_h);
    if machine.dead_boards.contains(&logical) {
        return None;
    }
    let physical = *machine.board_locations.get(&logical)?;
    let job = core.job_on_board(&machine.name, logical);
    Some(WhereIs {
        machine: machine.name.clone(),
        logical,
        physical,
        chip: (chip_x, chip_y),
        board_chip,
        job_id: job.map(|job| job.id),
        job_chip: job.and_then(|job| job_chip(job, logical, board_chip)),
    })
}

fn job_chip(job: &Job, (x, y, z): BoardXyz, (board_x, board_y): (u32, u32)) -> Option<ChipXy> {
    let allocation = job.allocation.as_ref()?;
    let (ox, oy, oz) = allocation.origin();
    let (job_x, job_y) = board_to_chip(x as i64 - ox as i64, y as i64 - oy as i64, z - oz);
    Some((
        (job_x + board_x as i64).rem_euclid(allocation.width as i64),
        (job_y + board_y as i64).rem_euclid(allocation.height as i64),
    ))
}
