//! Logical, physical and chip coordinate systems of a SpiNNaker machine.
//!
//! A machine is a torus of triads. Each triad holds three boards (`z = 0, 1, 2`)
//! whose Ethernet chips sit at fixed offsets within a 12x12 block of chips.

mod coordinates;
mod links;

pub use coordinates::{
    BOARD_CHIPS, TRIAD_CHIPS, board_down_link, board_local_chip, board_to_chip, chip_to_board,
    triad_dimensions_to_chips,
};
pub use links::{Direction, WrapAround};

/// Logical board coordinate `(x, y, z)` in triads.
pub type BoardXyz = (u32, u32, u32);

/// Physical board location `(cabinet, frame, board)`.
pub type PhysicalLocation = (u32, u32, u32);

/// BMP address `(cabinet, frame)`.
pub type FrameId = (u32, u32);

/// A directed board-to-board link, seen from the sending board.
pub type BoardLink = (u32, u32, u32, Direction);

/// Chip coordinate when the whole machine is booted as one system.
pub type ChipXy = (i64, i64);
