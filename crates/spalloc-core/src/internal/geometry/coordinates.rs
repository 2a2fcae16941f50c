use super::{BoardXyz, ChipXy, Direction, WrapAround};

/// Width and height of one triad in chips.
pub const TRIAD_CHIPS: u32 = 12;

/// Width and height of the bounding box of a single board in chips.
pub const BOARD_CHIPS: u32 = 8;

/// Chip offset of each board's Ethernet chip within its triad.
const BOARD_OFFSETS: [(i64, i64); 3] = [(0, 0), (8, 4), (4, 8)];

/// `(dx, dy, dz)` to the neighbouring board, indexed by `[z][direction]`.
const LINK_DELTAS: [[(i64, i64, i64); 6]; 3] = [
    [(0, 0, 1), (0, 0, 2), (-1, 0, 1), (-1, -1, 2), (-1, -1, 1), (0, -1, 2)],
    [(1, 0, 1), (1, 1, -1), (0, 0, 1), (0, 0, -1), (0, -1, 1), (1, 0, -1)],
    [(1, 1, -2), (0, 1, -1), (0, 1, -2), (-1, 0, -1), (0, 0, -2), (0, 0, -1)],
];

/// Follow a link from board `(x, y, z)` in a `width` x `height` triad torus.
///
/// Returns the neighbouring board together with the dimensions in which the
/// link wrapped around the edge of the machine.
pub fn board_down_link(
    x: u32,
    y: u32,
    z: u32,
    direction: Direction,
    width: u32,
    height: u32,
) -> (u32, u32, u32, WrapAround) {
    let (dx, dy, dz) = LINK_DELTAS[z as usize][direction as usize];
    let nx = x as i64 + dx;
    let ny = y as i64 + dy;

    let mut wrapped = WrapAround::NONE;
    if nx < 0 || nx >= width as i64 {
        wrapped |= WrapAround::X;
    }
    if ny < 0 || ny >= height as i64 {
        wrapped |= WrapAround::Y;
    }
    (
        nx.rem_euclid(width as i64) as u32,
        ny.rem_euclid(height as i64) as u32,
        (z as i64 + dz) as u32,
        wrapped,
    )
}

/// Chip coordinate of the Ethernet chip of a board.
pub fn board_to_chip(x: i64, y: i64, z: u32) -> ChipXy {
    let (ox, oy) = BOARD_OFFSETS[z as usize];
    (
        x * TRIAD_CHIPS as i64 + ox,
        y * TRIAD_CHIPS as i64 + oy,
    )
}

/// Size in chips of a `width` x `height` triad system.
///
/// Boards 1 and 2 overhang the triad grid by four chips, so dimensions that
/// do not wrap around need the extra space.
pub fn triad_dimensions_to_chips(width: u32, height: u32, torus: WrapAround) -> (u32, u32) {
    let mut chip_w = width * TRIAD_CHIPS;
    let mut chip_h = height * TRIAD_CHIPS;
    if !torus.contains(WrapAround::X) {
        chip_w += 4;
    }
    if !torus.contains(WrapAround::Y) {
        chip_h += 4;
    }
    (chip_w, chip_h)
}

#[inline]
fn in_board(dx: i64, dy: i64) -> bool {
    (0..BOARD_CHIPS as i64).contains(&dx)
        && (0..BOARD_CHIPS as i64).contains(&dy)
        && dx - dy <= 4
        && dy - dx <= 3
}

/// Find the board that owns a chip.
///
/// Returns unwrapped triad coordinates, the board within the triad and the
/// chip's coordinate relative to that board's Ethernet chip.
pub fn locate_chip(chip_x: i64, chip_y: i64) -> (i64, i64, u32, (u32, u32)) {
    for (z, (ox, oy)) in BOARD_OFFSETS.iter().enumerate() {
        let lx = chip_x - ox;
        let ly = chip_y - oy;
        let dx = lx.rem_euclid(TRIAD_CHIPS as i64);
        let dy = ly.rem_euclid(TRIAD_CHIPS as i64);
        if in_board(dx, dy) {
            return (
                lx.div_euclid(TRIAD_CHIPS as i64),
                ly.div_euclid(TRIAD_CHIPS as i64),
                z as u32,
                (dx as u32, dy as u32),
            );
        }
    }
    unreachable!("boards tile the triad")
}

/// Chip coordinate relative to the Ethernet chip of the board owning it.
pub fn board_local_chip(chip_x: i64, chip_y: i64) -> (u32, u32) {
    locate_chip(chip_x, chip_y).3
}

/// Logical board containing a chip of a machine `chip_w` x `chip_h` chips large.
pub fn chip_to_board(chip_x: i64, chip_y: i64, chip_w: u32, chip_h: u32) -> BoardXyz {
    let (x, y, z, _) = locate_chip(chip_x, chip_y);
    let width = (chip_w / TRIAD_CHIPS).max(1) as i64;
    let height = (chip_h / TRIAD_CHIPS).max(1) as i64;
    (
        x.rem_euclid(width) as u32,
        y.rem_euclid(height) as u32,
        z,
    )
}
