//! Server configuration file.
//!
//! The configuration is a TOML document with global server settings and a
//! list of `[[machines]]`. Machines keep the order of the file, which is
//! also their allocation priority.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::Path;

use serde::Deserialize;
use spalloc_core::{
    BoardLink, BoardXyz, Machine, StandardIps, default_tags, validate_machines,
};

use crate::common::error::ServerError;

pub const DEFAULT_PORT: u16 = 22244;
pub const DEFAULT_TIMEOUT_CHECK_INTERVAL: f64 = 5.0;
pub const DEFAULT_MAX_RETIRED_JOBS: usize = 1200;
pub const DEFAULT_SECONDS_BEFORE_FREE: f64 = 30.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub port: u16,
    /// Empty means all interfaces.
    pub ip: String,
    pub timeout_check_interval: f64,
    pub max_retired_jobs: usize,
    pub seconds_before_free: f64,
    pub machines: Vec<Machine>,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            port: DEFAULT_PORT,
            ip: String::new(),
            timeout_check_interval: DEFAULT_TIMEOUT_CHECK_INTERVAL,
            max_retired_jobs: DEFAULT_MAX_RETIRED_JOBS,
            seconds_before_free: DEFAULT_SECONDS_BEFORE_FREE,
            machines: Vec::new(),
        }
    }
}

impl Configuration {
    pub fn bind_address(&self) -> String {
        let ip = if self.ip.is_empty() {
            "0.0.0.0"
        } else {
            self.ip.as_str()
        };
        format!("{ip}:{}", self.port)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigurationFile {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    ip: String,
    #[serde(default = "default_timeout_check_interval")]
    timeout_check_interval: f64,
    #[serde(default = "default_max_retired_jobs")]
    max_retired_jobs: usize,
    #[serde(default = "default_seconds_before_free")]
    seconds_before_free: f64,
    #[serde(default)]
    machines: Vec<MachineDef>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout_check_interval() -> f64 {
    DEFAULT_TIMEOUT_CHECK_INTERVAL
}

fn default_max_retired_jobs() -> usize {
    DEFAULT_MAX_RETIRED_JOBS
}

fn default_seconds_before_free() -> f64 {
    DEFAULT_SECONDS_BEFORE_FREE
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MachineDef {
    name: String,
    tags: Option<BTreeSet<String>>,
    width: Option<u32>,
    height: Option<u32>,
    #[serde(default)]
    dead_boards: BTreeSet<BoardXyz>,
    #[serde(default)]
    dead_links: BTreeSet<BoardLink>,
    single_board: Option<SingleBoardDef>,
    standard_ips: Option<StandardIpsDef>,
    #[serde(default)]
    boards: Vec<BoardDef>,
    #[serde(default)]
    bmps: Vec<BmpDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SingleBoardDef {
    bmp_ip: String,
    spinnaker_ip: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StandardIpsDef {
    base_ip: Option<Ipv4Addr>,
    cabinet_stride: Option<Ipv4Addr>,
    frame_stride: Option<Ipv4Addr>,
    board_stride: Option<Ipv4Addr>,
    bmp_offset: Option<Ipv4Addr>,
    spinnaker_offset: Option<Ipv4Addr>,
    /// `[x, y, z, cabinet, frame, board]` per board.
    board_locations: Vec<(u32, u32, u32, u32, u32, u32)>,
}

impl StandardIpsDef {
    fn ips(&self) -> StandardIps {
        let defaults = StandardIps::default();
        StandardIps {
            base_ip: self.base_ip.unwrap_or(defaults.base_ip),
            cabinet_stride: self.cabinet_stride.unwrap_or(defaults.cabinet_stride),
            frame_stride: self.frame_stride.unwrap_or(defaults.frame_stride),
            board_stride: self.board_stride.unwrap_or(defaults.board_stride),
            bmp_offset: self.bmp_offset.unwrap_or(defaults.bmp_offset),
            spinnaker_offset: self.spinnaker_offset.unwrap_or(defaults.spinnaker_offset),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BoardDef {
    x: u32,
    y: u32,
    z: u32,
    cabinet: u32,
    frame: u32,
    board: u32,
    ip: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BmpDef {
    cabinet: u32,
    frame: u32,
    ip: String,
}

impl MachineDef {
    fn into_machine(self) -> crate::Result<Machine> {
        let explicit = !self.boards.is_empty() || !self.bmps.is_empty();
        let descriptions = [
            self.single_board.is_some(),
            self.standard_ips.is_some(),
            explicit,
        ];
        if descriptions.iter().filter(|&&given| given).count() != 1 {
            return Err(ServerError::ConfigError(format!(
                "Machine '{}' needs exactly one of single_board, standard_ips or boards/bmps",
                self.name
            )));
        }
        let tags = self.tags.unwrap_or_else(default_tags);
        let dead_links = self.dead_links;

        let machine = if let Some(single) = self.single_board {
            if self.width.is_some()
                || self.height.is_some()
                || !self.dead_boards.is_empty()
                || !dead_links.is_empty()
            {
                return Err(ServerError::ConfigError(format!(
                    "Single board machine '{}' cannot have dimensions or dead components",
                    self.name
                )));
            }
            Machine::single_board(self.name, tags, single.bmp_ip, single.spinnaker_ip)?
        } else if let Some(standard) = self.standard_ips {
            let ips = standard.ips();
            let board_locations = standard
                .board_locations
                .iter()
                .map(|&(x, y, z, c, f, b)| ((x, y, z), (c, f, b)))
                .collect();
            Machine::with_standard_ips(
                self.name,
                tags,
                self.width,
                self.height,
                self.dead_boards,
                dead_links,
                board_locations,
                &ips,
            )?
        } else {
            let mut board_locations = BTreeMap::new();
            let mut spinnaker_ips = BTreeMap::new();
            for board in self.boards {
                let xyz = (board.x, board.y, board.z);
                board_locations.insert(xyz, (board.cabinet, board.frame, board.board));
                spinnaker_ips.insert(xyz, board.ip);
            }
            let bmp_ips = self
                .bmps
                .into_iter()
                .map(|bmp| ((bmp.cabinet, bmp.frame), bmp.ip))
                .collect();
            Machine::new(
                self.name,
                tags,
                self.width,
                self.height,
                self.dead_boards,
                dead_links,
                board_locations,
                bmp_ips,
                spinnaker_ips,
            )?
        };
        Ok(machine)
    }
}

pub fn parse_config(text: &str) -> crate::Result<Configuration> {
    let file: ConfigurationFile = toml::from_str(text)?;
    if !file.timeout_check_interval.is_finite() || file.timeout_check_interval <= 0.0 {
        return Err(ServerError::ConfigError(format!(
            "timeout_check_interval must be a positive number, got {}",
            file.timeout_check_interval
        )));
    }
    if !file.seconds_before_free.is_finite() || file.seconds_before_free < 0.0 {
        return Err(ServerError::ConfigError(format!(
            "seconds_before_free must be a non-negative number, got {}",
            file.seconds_before_free
        )));
    }
    let machines = file
        .machines
        .into_iter()
        .map(MachineDef::into_machine)
        .collect::<crate::Result<Vec<_>>>()?;
    validate_machines(&machines)?;
    Ok(Configuration {
        port: file.port,
        ip: file.ip,
        timeout_check_interval: file.timeout_check_interval,
        max_retired_jobs: file.max_retired_jobs,
        seconds_before_free: file.seconds_before_free,
        machines,
    })
}

pub fn load_config(path: &Path) -> crate::Result<Configuration> {
    let text = std::fs::read_to_string(path).map_err(|error| {
        ServerError::ConfigError(format!("Cannot read {}: {error}", path.display()))
    })?;
    parse_config(&text)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use spalloc_core::Direction;

    use super::{Configuration, DEFAULT_PORT, parse_config};

    #[test]
    fn test_empty_config() {
        let config = parse_config("").unwrap();
        assert_eq!(config, Configuration::default());
        assert_eq!(config.bind_address(), format!("0.0.0.0:{DEFAULT_PORT}"));
    }

    #[test]
    fn test_global_settings() {
        let config = parse_config(
            r#"
port = 1234
ip = "127.0.0.1"
timeout_check_interval = 0.5
max_retired_jobs = 3
seconds_before_free = 0
"#,
        )
        .unwrap();
        assert_eq!(config.bind_address(), "127.0.0.1:1234");
        assert_eq!(config.timeout_check_interval, 0.5);
        assert_eq!(config.max_retired_jobs, 3);
        assert_eq!(config.seconds_before_free, 0.0);
    }

    #[test]
    fn test_single_board_machine() {
        let config = parse_config(
            r#"
[[machines]]
name = "board"
single_board = { bmp_ip = "10.0.0.0", spinnaker_ip = "10.0.0.1" }
"#,
        )
        .unwrap();
        let machine = &config.machines[0];
        assert_eq!(machine.name, "board");
        assert_eq!((machine.width, machine.height), (1, 1));
        assert_eq!(
            machine.dead_boards,
            BTreeSet::from([(0, 0, 1), (0, 0, 2)])
        );
        assert_eq!(machine.tags, BTreeSet::from(["default".to_string()]));
        assert_eq!(machine.spinnaker_ips[&(0, 0, 0)], "10.0.0.1");
        assert_eq!(machine.bmp_ips[&(0, 0)], "10.0.0.0");
    }

    #[test]
    fn test_standard_ips_machine() {
        let config = parse_config(
            r#"
[[machines]]
name = "m"
tags = ["big"]
dead_links = [[0, 0, 0, "north"], [0, 0, 1, "SW"]]

[machines.standard_ips]
base_ip = "10.2.0.0"
board_locations = [
    [0, 0, 0, 0, 0, 0],
    [0, 0, 1, 0, 0, 1],
    [0, 0, 2, 0, 0, 2],
    [1, 0, 0, 0, 1, 0],
    [1, 0, 1, 0, 1, 1],
    [1, 0, 2, 0, 1, 2],
]
"#,
        )
        .unwrap();
        let machine = &config.machines[0];
        assert_eq!((machine.width, machine.height), (2, 1));
        assert_eq!(machine.tags, BTreeSet::from(["big".to_string()]));
        assert_eq!(
            machine.dead_links,
            BTreeSet::from([(0, 0, 0, Direction::North), (0, 0, 1, Direction::SouthWest)])
        );
        assert_eq!(machine.bmp_ips[&(0, 0)], "10.2.0.0");
        assert_eq!(machine.bmp_ips[&(0, 1)], "10.2.1.0");
        assert_eq!(machine.spinnaker_ips[&(0, 0, 0)], "10.2.0.1");
        assert_eq!(machine.spinnaker_ips[&(1, 0, 2)], "10.2.1.17");
    }

    #[test]
    fn test_explicit_machine() {
        let config = parse_config(
            r#"
[[machines]]
name = "m"
width = 1
height = 1
dead_boards = [[0, 0, 2]]

[[machines.boards]]
x = 0
y = 0
z = 0
cabinet = 0
frame = 0
board = 0
ip = "spin0"

[[machines.boards]]
x = 0
y = 0
z = 1
cabinet = 0
frame = 0
board = 1
ip = "spin1"

[[machines.bmps]]
cabinet = 0
frame = 0
ip = "bmp"
"#,
        )
        .unwrap();
        let machine = &config.machines[0];
        assert_eq!(machine.board_locations[&(0, 0, 1)], (0, 0, 1));
        assert_eq!(machine.spinnaker_ips[&(0, 0, 1)], "spin1");
        assert_eq!(machine.bmp_ips[&(0, 0)], "bmp");
    }

    #[test]
    fn test_machine_order_is_kept() {
        let config = parse_config(
            r#"
[[machines]]
name = "b"
single_board = { bmp_ip = "1", spinnaker_ip = "2" }

[[machines]]
name = "a"
single_board = { bmp_ip = "3", spinnaker_ip = "4" }
"#,
        )
        .unwrap();
        let names: Vec<&str> = config.machines.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_invalid_configs() {
        let expect_error = |text: &str, message: &str| {
            let error = parse_config(text).unwrap_err().to_string();
            assert!(error.contains(message), "{error} does not contain {message}");
        };
        expect_error("prt = 1", "unknown field");
        expect_error("timeout_check_interval = 0", "timeout_check_interval");
        expect_error("timeout_check_interval = inf", "timeout_check_interval");
        expect_error("timeout_check_interval = nan", "timeout_check_interval");
        expect_error("seconds_before_free = inf", "seconds_before_free");
        expect_error("seconds_before_free = -1.0", "seconds_before_free");
        expect_error(
            r#"
[[machines]]
name = "m"
"#,
            "exactly one of",
        );
        expect_error(
            r#"
[[machines]]
name = "m"
single_board = { bmp_ip = "1", spinnaker_ip = "2" }
[machines.standard_ips]
board_locations = []
"#,
            "exactly one of",
        );
        expect_error(
            r#"
[[machines]]
name = "m"
single_board = { bmp_ip = "1", spinnaker_ip = "2" }

[[machines]]
name = "m"
single_board = { bmp_ip = "3", spinnaker_ip = "4" }
"#,
            "used multiple times",
        );
        expect_error(
            r#"
[[machines]]
name = "a"
single_board = { bmp_ip = "1", spinnaker_ip = "2" }

[[machines]]
name = "b"
single_board = { bmp_ip = "1", spinnaker_ip = "4" }
"#,
            "BMP IP '1' used multiple times",
        );
        expect_error(
            r#"
[[machines]]
name = "m"
dead_boards = [[5, 0, 0]]
[machines.standard_ips]
board_locations = [[0, 0, 0, 0, 0, 0], [0, 0, 1, 0, 0, 1], [0, 0, 2, 0, 0, 2]]
width = 1
"#,
            "unknown field",
        );
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::TempDir::with_prefix("spalloc").unwrap();
        let path = dir.path().join("spalloc.toml");
        std::fs::write(&path, "port = 4000\n").unwrap();
        assert_eq!(super::load_config(&path).unwrap().port, 4000);
        assert!(super::load_config(&dir.path().join("missing.toml")).is_err());
    }
}
