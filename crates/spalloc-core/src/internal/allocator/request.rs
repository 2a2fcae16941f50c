use serde::{Deserialize, Serialize};

use crate::internal::common::error::SpallocError;

pub const DEFAULT_MIN_RATIO: f64 = 0.333;

/// What kind of region a job asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationShape {
    /// Any single working board.
    AnyBoard,
    /// One specific board.
    Board { x: u32, y: u32, z: u32 },
    /// At least this many boards, allocated as whole triads.
    Boards { count: u32 },
    /// An exact rectangle of triads.
    Triads { width: u32, height: u32 },
}

impl AllocationShape {
    /// Interprets the positional allocation arguments of a job request:
    /// none or a single `1` mean one board, one number means that many
    /// boards, two numbers a rectangle of triads and three a specific board.
    pub fn from_args(args: &[u32]) -> crate::Result<Self> {
        Ok(match *args {
            [] | [1] => AllocationShape::AnyBoard,
            [count] => AllocationShape::Boards { count },
            [width, height] => AllocationShape::Triads { width, height },
            [x, y, z] => AllocationShape::Board { x, y, z },
            _ => {
                return Err(SpallocError::InvalidArguments(format!(
                    "Expected at most 3 positional arguments, got {}",
                    args.len()
                )));
            }
        })
    }

    pub fn to_args(&self) -> Vec<u32> {
        match *self {
            AllocationShape::AnyBoard => vec![],
            AllocationShape::Board { x, y, z } => vec![x, y, z],
            AllocationShape::Boards { count } => vec![count],
            AllocationShape::Triads { width, height } => vec![width, height],
        }
    }

    pub fn is_single_board(&self) -> bool {
        matches!(
            self,
            AllocationShape::AnyBoard | AllocationShape::Board { .. }
        )
    }
}

/// A complete allocation request: the shape plus the quality constraints
/// the allocated region must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub shape: AllocationShape,
    /// Minimum aspect ratio (`min(w, h) / max(w, h)`) for board count requests.
    pub min_ratio: f64,
    /// `None` means any number of dead boards is tolerated.
    pub max_dead_boards: Option<u32>,
    /// `None` means any number of dead links is tolerated.
    pub max_dead_links: Option<u32>,
    pub require_torus: bool,
}

impl AllocationRequest {
    pub fn new(shape: AllocationShape) -> Self {
        AllocationRequest {
            shape,
            min_ratio: DEFAULT_MIN_RATIO,
            max_dead_boards: None,
            max_dead_links: None,
            require_torus: false,
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.require_torus && self.shape.is_single_board() {
            return Err(SpallocError::InvalidArguments(
                "require_torus must be false when allocating boards".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_ratio) {
            return Err(SpallocError::InvalidArguments(format!(
                "min_ratio must be between 0.0 and 1.0, got {}",
                self.min_ratio
            )));
        }
        Ok(())
    }
}
