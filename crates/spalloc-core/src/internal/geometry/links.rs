use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// The six board-to-board link directions.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[serde(alias = "E")]
    East,
    #[serde(alias = "NE")]
    NorthEast,
    #[serde(alias = "N")]
    North,
    #[serde(alias = "W")]
    West,
    #[serde(alias = "SW")]
    SouthWest,
    #[serde(alias = "S")]
    South,
}

impl Direction {
    pub const ALL: [Direction; 6] = [
        Direction::East,
        Direction::NorthEast,
        Direction::North,
        Direction::West,
        Direction::SouthWest,
        Direction::South,
    ];

    pub fn opposite(self) -> Direction {
        match self {
            Direction::East => Direction::West,
            Direction::NorthEast => Direction::SouthWest,
            Direction::North => Direction::South,
            Direction::West => Direction::East,
            Direction::SouthWest => Direction::NorthEast,
            Direction::South => Direction::North,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Direction::East => "east",
            Direction::NorthEast => "north_east",
            Direction::North => "north",
            Direction::West => "west",
            Direction::SouthWest => "south_west",
            Direction::South => "south",
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "east" | "E" => Direction::East,
            "north_east" | "NE" => Direction::NorthEast,
            "north" | "N" => Direction::North,
            "west" | "W" => Direction::West,
            "south_west" | "SW" => Direction::SouthWest,
            "south" | "S" => Direction::South,
            _ => return Err(format!("Invalid link direction '{s}'")),
        })
    }
}

bitflags! {
    /// Which dimensions a set of boards wraps around in.
    #[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
    pub struct WrapAround: u8 {
        const X = 0b01;
        const Y = 0b10;
        const BOTH = Self::X.bits() | Self::Y.bits();
    }
}

impl WrapAround {
    pub const NONE: WrapAround = WrapAround::empty();
}
