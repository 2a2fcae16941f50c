use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::internal::common::error::SpallocError;
use crate::internal::geometry::{BoardLink, BoardXyz, FrameId, PhysicalLocation};

pub const DEFAULT_TAG: &str = "default";

pub fn default_tags() -> BTreeSet<String> {
    BTreeSet::from([DEFAULT_TAG.to_string()])
}

/// Static description of one SpiNNaker machine.
///
/// Two descriptions compare equal only when every field matches; the
/// controller uses this to detect configuration changes.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub name: String,
    pub tags: BTreeSet<String>,
    /// Width in triads.
    pub width: u32,
    /// Height in triads.
    pub height: u32,
    pub dead_boards: BTreeSet<BoardXyz>,
    pub dead_links: BTreeSet<BoardLink>,
    pub board_locations: BTreeMap<BoardXyz, PhysicalLocation>,
    pub bmp_ips: BTreeMap<FrameId, String>,
    pub spinnaker_ips: BTreeMap<BoardXyz, String>,
}

/// Regular IP layout used by standard SpiNNaker installations.
///
/// Every frame gets its own address range starting at
/// `base_ip + cabinet * cabinet_stride + frame * frame_stride`, each board
/// gets `board_stride` addresses within it and the BMP of board 0 controls
/// the whole frame.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StandardIps {
    pub base_ip: Ipv4Addr,
    pub cabinet_stride: Ipv4Addr,
    pub frame_stride: Ipv4Addr,
    pub board_stride: Ipv4Addr,
    pub bmp_offset: Ipv4Addr,
    pub spinnaker_offset: Ipv4Addr,
}

impl Default for StandardIps {
    fn default() -> Self {
        Self {
            base_ip: Ipv4Addr::new(192, 168, 0, 0),
            cabinet_stride: Ipv4Addr::new(0, 0, 5, 0),
            frame_stride: Ipv4Addr::new(0, 0, 1, 0),
            board_stride: Ipv4Addr::new(0, 0, 0, 8),
            bmp_offset: Ipv4Addr::new(0, 0, 0, 0),
            spinnaker_offset: Ipv4Addr::new(0, 0, 0, 1),
        }
    }
}

impl StandardIps {
    fn frame_base(&self, cabinet: u32, frame: u32) -> u32 {
        u32::from(self.base_ip)
            .wrapping_add(u32::from(self.cabinet_stride).wrapping_mul(cabinet))
            .wrapping_add(u32::from(self.frame_stride).wrapping_mul(frame))
    }

    pub fn bmp_ip(&self, cabinet: u32, frame: u32) -> Ipv4Addr {
        Ipv4Addr::from(
            self.frame_base(cabinet, frame)
                .wrapping_add(u32::from(self.bmp_offset)),
        )
    }

    pub fn spinnaker_ip(&self, cabinet: u32, frame: u32, board: u32) -> Ipv4Addr {
        Ipv4Addr::from(
            self.frame_base(cabinet, frame)
                .wrapping_add(u32::from(self.board_stride).wrapping_mul(board))
                .wrapping_add(u32::from(self.spinnaker_offset)),
        )
    }
}

impl Machine {
    /// Creates a validated machine description.
    ///
    /// When both `width` and `height` are `None` they are inferred from the
    /// largest board coordinate in `board_locations` and `dead_boards`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        tags: BTreeSet<String>,
        width: Option<u32>,
        height: Option<u32>,
        dead_boards: BTreeSet<BoardXyz>,
        dead_links: BTreeSet<BoardLink>,
        board_locations: BTreeMap<BoardXyz, PhysicalLocation>,
        bmp_ips: BTreeMap<FrameId, String>,
        spinnaker_ips: BTreeMap<BoardXyz, String>,
    ) -> crate::Result<Machine> {
        let (width, height) = match (width, height) {
            (Some(w), Some(h)) => (w, h),
            (None, None) => infer_dimensions(&board_locations, &dead_boards).ok_or_else(|| {
                SpallocError::InvalidMachine(format!(
                    "Cannot infer dimensions of machine '{name}' without boards"
                ))
            })?,
            _ => {
                return Err(SpallocError::InvalidMachine(
                    "Both or neither of width and height must be specified".to_string(),
                ));
            }
        };
        let machine = Machine {
            name,
            tags,
            width,
            height,
            dead_boards,
            dead_links,
            board_locations,
            bmp_ips,
            spinnaker_ips,
        };
        machine.validate()?;
        Ok(machine)
    }

    /// A machine consisting of a single board, controlled by its own BMP.
    pub fn single_board(
        name: String,
        tags: BTreeSet<String>,
        bmp_ip: String,
        spinnaker_ip: String,
    ) -> crate::Result<Machine> {
        Machine::new(
            name,
            tags,
            Some(1),
            Some(1),
            BTreeSet::from([(0, 0, 1), (0, 0, 2)]),
            BTreeSet::new(),
            BTreeMap::from([((0, 0, 0), (0, 0, 0))]),
            BTreeMap::from([((0, 0), bmp_ip)]),
            BTreeMap::from([((0, 0, 0), spinnaker_ip)]),
        )
    }

    /// A machine whose BMP and SpiNNaker IPs follow the standard layout.
    #[allow(clippy::too_many_arguments)]
    pub fn with_standard_ips(
        name: String,
        tags: BTreeSet<String>,
        width: Option<u32>,
        height: Option<u32>,
        dead_boards: BTreeSet<BoardXyz>,
        dead_links: BTreeSet<BoardLink>,
        board_locations: BTreeMap<BoardXyz, PhysicalLocation>,
        ips: &StandardIps,
    ) -> crate::Result<Machine> {
        let bmp_ips = board_locations
            .values()
            .map(|&(c, f, _)| ((c, f), ips.bmp_ip(c, f).to_string()))
            .collect();
        let spinnaker_ips = board_locations
            .iter()
            .map(|(&xyz, &(c, f, b))| (xyz, ips.spinnaker_ip(c, f, b).to_string()))
            .collect();
        Machine::new(
            name,
            tags,
            width,
            height,
            dead_boards,
            dead_links,
            board_locations,
            bmp_ips,
            spinnaker_ips,
        )
    }

    fn contains(&self, x: u32, y: u32, z: u32) -> bool {
        x < self.width && y < self.height && z < 3
    }

    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |msg: String| -> crate::Result<()> {
            Err(SpallocError::InvalidMachine(format!("{}: {msg}", self.name)))
        };
        if self.width == 0 || self.height == 0 {
            return invalid("Machine must be at least 1x1 triads".to_string());
        }
        for &(x, y, z) in &self.dead_boards {
            if !self.contains(x, y, z) {
                return invalid(format!("Dead board ({x}, {y}, {z}) outside system"));
            }
        }
        for &(x, y, z, _) in &self.dead_links {
            if !self.contains(x, y, z) {
                return invalid(format!("Dead link ({x}, {y}, {z}) outside system"));
            }
        }

        let mut locations = BTreeSet::new();
        for (&(x, y, z), &(c, f, b)) in &self.board_locations {
            if !self.contains(x, y, z) {
                return invalid(format!(
                    "Board location given for board not in system ({x}, {y}, {z})"
                ));
            }
            if !locations.insert((c, f, b)) {
                return invalid(format!("Multiple boards given location c:{c}, f:{f}, b:{b}"));
            }
        }

        for board in self.live_boards() {
            if !self.board_locations.contains_key(&board) {
                return invalid(format!("Board location missing for {board:?}"));
            }
            if !self.spinnaker_ips.contains_key(&board) {
                return invalid(format!("SpiNNaker IP not given for board {board:?}"));
            }
        }
        for &(c, f, _) in &locations {
            if !self.bmp_ips.contains_key(&(c, f)) {
                return invalid(format!("BMP IP not given for frame ({c}, {f})"));
            }
        }
        Ok(())
    }

    pub fn live_boards(&self) -> impl Iterator<Item = BoardXyz> + '_ {
        (0..self.width).flat_map(move |x| {
            (0..self.height).flat_map(move |y| {
                (0..3)
                    .map(move |z| (x, y, z))
                    .filter(|b| !self.dead_boards.contains(b))
            })
        })
    }

    pub fn board_at_position(&self, location: PhysicalLocation) -> Option<BoardXyz> {
        self.board_locations
            .iter()
            .find(|&(_, &loc)| loc == location)
            .map(|(&xyz, _)| xyz)
    }

    /// Changes which require the machine to be torn down and rebuilt, as
    /// opposed to tags and dead components which can be updated in place.
    pub fn differs_in_hardware(&self, other: &Machine) -> bool {
        self.name != other.name
            || self.width != other.width
            || self.height != other.height
            || self.board_locations != other.board_locations
            || self.bmp_ips != other.bmp_ips
            || self.spinnaker_ips != other.spinnaker_ips
    }
}

fn infer_dimensions(
    board_locations: &BTreeMap<BoardXyz, PhysicalLocation>,
    dead_boards: &BTreeSet<BoardXyz>,
) -> Option<(u32, u32)> {
    board_locations
        .keys()
        .chain(dead_boards.iter())
        .fold(None, |acc, &(x, y, _)| match acc {
            None => Some((x, y)),
            Some((w, h)) => Some((w.max(x), h.max(y))),
        })
        .map(|(x, y)| (x + 1, y + 1))
}

/// Validates a whole set of machines: names, BMP IPs and SpiNNaker IPs must
/// all be unique.
pub fn validate_machines<'a>(machines: impl IntoIterator<Item = &'a Machine>) -> crate::Result<()> {
    let mut names = BTreeSet::new();
    let mut bmp_ips = BTreeSet::new();
    let mut spinnaker_ips = BTreeSet::new();
    for machine in machines {
        if !names.insert(machine.name.as_str()) {
            return Err(SpallocError::InvalidMachine(format!(
                "Machine name '{}' used multiple times",
                machine.name
            )));
        }
        for ip in machine.bmp_ips.values() {
            if !bmp_ips.insert(ip.as_str()) {
                return Err(SpallocError::InvalidMachine(format!(
                    "BMP IP '{ip}' used multiple times"
                )));
            }
        }
        for ip in machine.spinnaker_ips.values() {
            if !spinnaker_ips.insert(ip.as_str()) {
                return Err(SpallocError::InvalidMachine(format!(
                    "SpiNNaker IP '{ip}' used multiple times"
                )));
            }
        }
    }
    Ok(())
}
