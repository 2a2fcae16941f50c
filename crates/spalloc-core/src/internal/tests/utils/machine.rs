use std::collections::{BTreeMap, BTreeSet};

use crate::internal::allocator::{AllocationRequest, AllocationShape};
use crate::internal::geometry::{BoardLink, BoardXyz};
use crate::internal::machine::{Machine, default_tags};

/// A `width` x `height` machine whose physical location of every board
/// equals its logical coordinate and whose BMPs are one per triad.
pub fn simple_machine(name: &str, width: u32, height: u32) -> Machine {
    MachineBuilder::new(name, width, height).build()
}

pub struct MachineBuilder {
    name: String,
    width: u32,
    height: u32,
    tags: BTreeSet<String>,
    dead_boards: BTreeSet<BoardXyz>,
    dead_links: BTreeSet<BoardLink>,
}

impl MachineBuilder {
    pub fn new(name: &str, width: u32, height: u32) -> Self {
        MachineBuilder {
            name: name.to_string(),
            width,
            height,
            tags: default_tags(),
            dead_boards: Default::default(),
            dead_links: Default::default(),
        }
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn dead_board(mut self, board: BoardXyz) -> Self {
        self.dead_boards.insert(board);
        self
    }

    pub fn dead_link(mut self, link: BoardLink) -> Self {
        self.dead_links.insert(link);
        self
    }

    pub fn build(self) -> Machine {
        let mut board_locations = BTreeMap::new();
        let mut spinnaker_ips = BTreeMap::new();
        let mut bmp_ips = BTreeMap::new();
        for x in 0..self.width {
            for y in 0..self.height {
                bmp_ips.insert((x, y), format!("bmp-{}-{x}-{y}", self.name));
                for z in 0..3 {
                    board_locations.insert((x, y, z), (x, y, z));
                    spinnaker_ips.insert((x, y, z), format!("spin-{}-{x}-{y}-{z}", self.name));
                }
            }
        }
        Machine::new(
            self.name,
            self.tags,
            Some(self.width),
            Some(self.height),
            self.dead_boards,
            self.dead_links,
            board_locations,
            bmp_ips,
            spinnaker_ips,
        )
        .unwrap()
    }
}

pub fn any_board() -> AllocationRequest {
    AllocationRequest::new(AllocationShape::AnyBoard)
}

pub fn board(x: u32, y: u32, z: u32) -> AllocationRequest {
    AllocationRequest::new(AllocationShape::Board { x, y, z })
}

pub fn boards(count: u32) -> AllocationRequest {
    AllocationRequest::new(AllocationShape::Boards { count })
}

pub fn triads(width: u32, height: u32) -> AllocationRequest {
    AllocationRequest::new(AllocationShape::Triads { width, height })
}
