use std::collections::BTreeSet;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use spalloc_core::JobId;

use crate::common::error::protocol_error;

/// Upper bound on the length of a single request line.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// A command sent by a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

pub fn parse_request(line: &str) -> crate::Result<ClientRequest> {
    serde_json::from_str(line).or_else(|error| protocol_error(format!("Malformed request: {error}")))
}

pub fn return_message(value: Value) -> crate::Result<String> {
    Ok(serde_json::to_string(&json!({ "return": value }))?)
}

pub fn exception_message(message: &str) -> crate::Result<String> {
    Ok(serde_json::to_string(&json!({ "exception": message }))?)
}

pub fn jobs_changed_message(jobs: &[JobId]) -> crate::Result<String> {
    Ok(serde_json::to_string(&json!({ "jobs_changed": jobs }))?)
}

pub fn machines_changed_message(machines: &[String]) -> crate::Result<String> {
    Ok(serde_json::to_string(&json!({ "machines_changed": machines }))?)
}

/// Arguments of a request bound to the parameter names of a command.
///
/// Positional arguments are assigned to parameters in order, keyword
/// arguments by name. Every parameter may be given at most once.
#[derive(Debug)]
pub struct Arguments {
    command: String,
    values: Map<String, Value>,
}

impl Arguments {
    pub fn bind(request: &ClientRequest, params: &[&str]) -> crate::Result<Self> {
        Self::bind_values(&request.command, &request.args, &request.kwargs, params)
    }

    /// Binds only the keyword arguments; the command takes positional
    /// arguments of its own.
    pub fn bind_keywords(request: &ClientRequest, params: &[&str]) -> crate::Result<Self> {
        Self::bind_values(&request.command, &[], &request.kwargs, params)
    }

    fn bind_values(
        command: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
        params: &[&str],
    ) -> crate::Result<Self> {
        if args.len() > params.len() {
            return protocol_error(format!(
                "{command}() takes at most {} positional arguments but {} were given",
                params.len(),
                args.len()
            ));
        }
        let mut values: Map<String, Value> = params
            .iter()
            .zip(args)
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        for (name, value) in kwargs {
            if !params.contains(&name.as_str()) {
                return protocol_error(format!(
                    "{command}() got an unexpected keyword argument '{name}'"
                ));
            }
            if values.insert(name.clone(), value.clone()).is_some() {
                return protocol_error(format!(
                    "{command}() got multiple values for argument '{name}'"
                ));
            }
        }
        Ok(Arguments {
            command: command.to_string(),
            values,
        })
    }

    pub fn is_given(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Raw value of a parameter; `None` when it was not given at all.
    pub fn take_value(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    pub fn required<T: DeserializeOwned>(&mut self, name: &str) -> crate::Result<T> {
        match self.values.remove(name) {
            Some(value) => self.convert(name, value),
            None => protocol_error(format!(
                "{}() missing required argument '{name}'",
                self.command
            )),
        }
    }

    /// A missing parameter and an explicit `null` both give `None`.
    pub fn optional<T: DeserializeOwned>(&mut self, name: &str) -> crate::Result<Option<T>> {
        match self.values.remove(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => self.convert(name, value).map(Some),
        }
    }

    fn convert<T: DeserializeOwned>(&self, name: &str, value: Value) -> crate::Result<T> {
        serde_json::from_value(value).or_else(|error| {
            protocol_error(format!(
                "{}() got an invalid value for argument '{name}': {error}",
                self.command
            ))
        })
    }
}

/// Positional arguments of `create_job`: up to three non-negative integers.
pub fn parse_job_args(request: &ClientRequest) -> crate::Result<Vec<u32>> {
    if request.args.len() > 3 {
        return protocol_error(format!(
            "create_job() takes at most 3 positional arguments but {} were given",
            request.args.len()
        ));
    }
    request
        .args
        .iter()
        .map(|value| {
            value
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map_or_else(
                    || protocol_error(format!("create_job() got an invalid dimension {value}")),
                    Ok,
                )
        })
        .collect()
}

/// Tags given as a JSON list of strings.
pub fn parse_tags(value: Value) -> crate::Result<BTreeSet<String>> {
    serde_json::from_value(value)
        .or_else(|error| protocol_error(format!("tags must be a list of strings: {error}")))
}
