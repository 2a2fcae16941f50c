//! Client command dispatch.
//!
//! Domain problems (unknown jobs, infeasible requests) are reported through
//! the returned values. An `Err` means the request itself was bad and the
//! connection is closed after reporting it.

use std::collections::BTreeMap;

use serde_json::{Value, json};
use spalloc_core::{
    AllocationRequest, AllocationShape, Controller, DEFAULT_KEEPALIVE, DEFAULT_MIN_RATIO,
    JobDescription, JobId, JobInfo, JobMachineInfo, JobStateInfo, WhereIsQuery,
};

use crate::SPALLOC_VERSION;
use crate::common::error::protocol_error;
use crate::server::notify::Watches;
use crate::server::protocol::{Arguments, ClientRequest, parse_job_args, parse_tags};

const CREATE_JOB_KEYWORDS: &[&str] = &[
    "owner",
    "keepalive",
    "machine",
    "tags",
    "min_ratio",
    "max_dead_boards",
    "max_dead_links",
    "require_torus",
];

/// Executes one request on behalf of the client at `host`.
pub fn execute_command(
    controller: &Controller,
    watches: &mut Watches,
    request: &ClientRequest,
    host: &str,
) -> crate::Result<Value> {
    let host = Some(host);
    let job_id = |params: &[&str]| -> crate::Result<(JobId, Arguments)> {
        let mut args = Arguments::bind(request, params)?;
        Ok((args.required("job_id")?, args))
    };

    let value = match request.command.as_str() {
        "version" => {
            Arguments::bind(request, &[])?;
            json!(SPALLOC_VERSION)
        }
        "create_job" => {
            let description = job_description(request)?;
            let job_id = controller.create_job(description, host)?;
            json!(job_id)
        }
        "job_keepalive" => {
            let (job_id, _) = job_id(&["job_id"])?;
            controller.job_keepalive(job_id, host);
            Value::Null
        }
        "get_job_state" => {
            let (job_id, _) = job_id(&["job_id"])?;
            job_state_value(&controller.get_job_state(job_id, host))
        }
        "get_job_machine_info" => {
            let (job_id, _) = job_id(&["job_id"])?;
            job_machine_info_value(controller.get_job_machine_info(job_id, host).as_ref())
        }
        "power_on_job_boards" => {
            let (job_id, _) = job_id(&["job_id"])?;
            controller.power_on_job_boards(job_id, host);
            Value::Null
        }
        "power_off_job_boards" => {
            let (job_id, _) = job_id(&["job_id"])?;
            controller.power_off_job_boards(job_id, host);
            Value::Null
        }
        "destroy_job" => {
            let (job_id, mut args) = job_id(&["job_id", "reason"])?;
            let reason = args.optional("reason")?;
            controller.destroy_job(job_id, reason, host);
            Value::Null
        }
        "list_jobs" => {
            Arguments::bind(request, &[])?;
            Value::Array(controller.list_jobs().iter().map(job_info_value).collect())
        }
        "list_machines" => {
            Arguments::bind(request, &[])?;
            serde_json::to_value(controller.list_machines())?
        }
        "get_board_position" => {
            let mut args = Arguments::bind(request, &["machine_name", "x", "y", "z"])?;
            let machine: String = args.required("machine_name")?;
            let board = (args.required("x")?, args.required("y")?, args.required("z")?);
            serde_json::to_value(controller.get_board_position(&machine, board))?
        }
        "get_board_at_position" => {
            let mut args = Arguments::bind(request, &["machine_name", "x", "y", "z"])?;
            let machine: String = args.required("machine_name")?;
            let location = (args.required("x")?, args.required("y")?, args.required("z")?);
            serde_json::to_value(controller.get_board_at_position(&machine, location))?
        }
        "where_is" => {
            let query = where_is_query(request)?;
            serde_json::to_value(controller.where_is(&query))?
        }
        "notify_job" => {
            let mut args = Arguments::bind(request, &["job_id"])?;
            watches.jobs.watch(args.optional("job_id")?);
            Value::Null
        }
        "no_notify_job" => {
            let mut args = Arguments::bind(request, &["job_id"])?;
            watches.jobs.unwatch(args.optional("job_id")?);
            Value::Null
        }
        "notify_machine" => {
            let mut args = Arguments::bind(request, &["machine_name"])?;
            watches.machines.watch(args.optional("machine_name")?);
            Value::Null
        }
        "no_notify_machine" => {
            let mut args = Arguments::bind(request, &["machine_name"])?;
            watches.machines.unwatch(args.optional("machine_name")?);
            Value::Null
        }
        command => return protocol_error(format!("Unknown command '{command}'")),
    };
    Ok(value)
}

fn job_description(request: &ClientRequest) -> crate::Result<JobDescription> {
    let shape = AllocationShape::from_args(&parse_job_args(request)?)?;
    let mut args = Arguments::bind_keywords(request, CREATE_JOB_KEYWORDS)?;
    let owner: String = args.required("owner")?;
    let keepalive = match args.take_value("keepalive") {
        None => Some(DEFAULT_KEEPALIVE),
        Some(Value::Null) => None,
        Some(value) => match value.as_f64() {
            Some(seconds) if seconds >= 0.0 => Some(seconds),
            _ => return protocol_error(format!("Invalid keepalive {value}")),
        },
    };
    let machine: Option<String> = args.optional("machine")?;
    let tags = args
        .take_value("tags")
        .filter(|value| !value.is_null())
        .map(parse_tags)
        .transpose()?;
    if machine.is_some() && tags.is_some() {
        return protocol_error("Specifying both machine and tags is not allowed".to_string());
    }

    let mut allocation = AllocationRequest::new(shape);
    allocation.min_ratio = args.optional("min_ratio")?.unwrap_or(DEFAULT_MIN_RATIO);
    allocation.max_dead_boards = args.optional("max_dead_boards")?;
    allocation.max_dead_links = args.optional("max_dead_links")?;
    allocation.require_torus = args.optional("require_torus")?.unwrap_or(false);

    let mut description = JobDescription::new(&owner, allocation);
    description.keepalive = keepalive;
    description.machine = machine;
    description.tags = tags;
    Ok(description)
}

fn where_is_query(request: &ClientRequest) -> crate::Result<WhereIsQuery> {
    if !request.args.is_empty() {
        return protocol_error("where_is() takes keyword arguments only".to_string());
    }
    let mut machine = None;
    let mut job_id = None;
    let mut numbers = BTreeMap::new();
    for (name, value) in &request.kwargs {
        match name.as_str() {
            "machine" => match value.as_str() {
                Some(name) => machine = Some(name.to_string()),
                None => return protocol_error(format!("where_is() got an invalid machine {value}")),
            },
            "job_id" => match value.as_u64().and_then(|id| u32::try_from(id).ok()) {
                Some(id) => job_id = Some(JobId::new(id)),
                None => return protocol_error(format!("where_is() got an invalid job_id {value}")),
            },
            _ => match value.as_i64() {
                Some(number) => {
                    numbers.insert(name.clone(), number);
                }
                None => {
                    return protocol_error(format!("where_is() got an invalid {name} {value}"));
                }
            },
        }
    }
    Ok(WhereIsQuery::from_named(machine, job_id, &numbers)?)
}

fn job_state_value(info: &JobStateInfo) -> Value {
    json!({
        "state": info.state.code(),
        "power": info.power,
        "keepalive": info.keepalive,
        "reason": info.reason,
        "start_time": info.start_time,
        "keepalivehost": info.keepalive_host,
    })
}

fn job_machine_info_value(info: Option<&JobMachineInfo>) -> Value {
    match info {
        Some(info) => {
            let connections: Vec<Value> = info
                .connections
                .iter()
                .map(|(&(x, y), host)| json!([[x, y], host]))
                .collect();
            json!({
                "width": info.width,
                "height": info.height,
                "connections": connections,
                "machine_name": info.machine_name,
                "boards": info.boards,
            })
        }
        None => json!({
            "width": null,
            "height": null,
            "connections": null,
            "machine_name": null,
            "boards": null,
        }),
    }
}

fn job_info_value(job: &JobInfo) -> Value {
    let description = &job.description;
    let request = &description.request;
    json!({
        "job_id": job.job_id,
        "owner": job.owner,
        "start_time": job.start_time,
        "keepalive": job.keepalive,
        "state": job.state.code(),
        "power": job.power,
        "args": job.args,
        "kwargs": {
            "owner": description.owner,
            "keepalive": description.keepalive,
            "machine": description.machine,
            "tags": description.tags,
            "min_ratio": request.min_ratio,
            "max_dead_boards": request.max_dead_boards,
            "max_dead_links": request.max_dead_links,
            "require_torus": request.require_torus,
        },
        "allocated_machine_name": job.allocated_machine_name,
        "boards": job.boards,
        "keepalivehost": job.keepalive_host,
    })
}
