use std::collections::{BTreeSet, VecDeque};

use crate::internal::geometry::{BoardLink, BoardXyz, Direction, WrapAround, board_down_link};

/// Boards, isolating links and torus class of an accepted candidate region.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateResult {
    pub boards: BTreeSet<BoardXyz>,
    pub periphery: BTreeSet<BoardLink>,
    pub torus: WrapAround,
}

#[derive(Default)]
struct LinkClasses {
    dead: usize,
    dead_wrap: usize,
    periphery: BTreeSet<BoardLink>,
    torus: WrapAround,
}

/// Decides whether a candidate rectangle of triads is acceptable given the
/// dead boards and links of a machine and the constraints of a request.
///
/// The result of the last accepted candidate is kept so the allocator can
/// report which boards it allocated.
pub(crate) struct CandidateFilter<'a> {
    width: u32,
    height: u32,
    dead_boards: &'a BTreeSet<BoardXyz>,
    dead_links: &'a BTreeSet<BoardLink>,
    max_dead_boards: Option<u32>,
    max_dead_links: Option<u32>,
    require_torus: bool,
    /// Board count used for dead board accounting instead of the size of
    /// the candidate region.
    expected_boards: Option<u32>,
    result: Option<CandidateResult>,
}

impl<'a> CandidateFilter<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        width: u32,
        height: u32,
        dead_boards: &'a BTreeSet<BoardXyz>,
        dead_links: &'a BTreeSet<BoardLink>,
        max_dead_boards: Option<u32>,
        max_dead_links: Option<u32>,
        require_torus: bool,
        expected_boards: Option<u32>,
    ) -> Self {
        CandidateFilter {
            width,
            height,
            dead_boards,
            dead_links,
            max_dead_boards,
            max_dead_links,
            require_torus,
            expected_boards,
            result: None,
        }
    }

    pub fn take_result(&mut self) -> Option<CandidateResult> {
        self.result.take()
    }

    /// Live boards reachable from `(x, y, 0)` over working links without
    /// leaving the candidate rectangle.
    fn enumerate_boards(&self, x: u32, y: u32, width: u32, height: u32) -> BTreeSet<BoardXyz> {
        let mut boards = BTreeSet::new();
        let mut to_visit = VecDeque::from([(x, y, 0)]);
        while let Some(board) = to_visit.pop_front() {
            if self.dead_boards.contains(&board) || !boards.insert(board) {
                continue;
            }
            let (bx, by, bz) = board;
            for direction in Direction::ALL {
                if self.dead_links.contains(&(bx, by, bz, direction)) {
                    continue;
                }
                let (nx, ny, nz, _) =
                    board_down_link(bx, by, bz, direction, self.width, self.height);
                if (x..x + width).contains(&nx) && (y..y + height).contains(&ny) {
                    to_visit.push_back((nx, ny, nz));
                }
            }
        }
        boards
    }

    fn classify_links(&self, boards: &BTreeSet<BoardXyz>) -> LinkClasses {
        let mut classes = LinkClasses::default();
        for &(x, y, z) in boards {
            for direction in Direction::ALL {
                let (nx, ny, nz, wrapped) =
                    board_down_link(x, y, z, direction, self.width, self.height);
                if boards.contains(&(nx, ny, nz)) {
                    classes.torus |= wrapped;
                    if self.dead_links.contains(&(x, y, z, direction)) {
                        if wrapped.is_empty() {
                            classes.dead += 1;
                        } else {
                            classes.dead_wrap += 1;
                        }
                    }
                } else {
                    classes.periphery.insert((x, y, z, direction));
                }
            }
        }
        classes
    }

    pub fn check(&mut self, x: u32, y: u32, width: u32, height: u32) -> bool {
        let boards = self.enumerate_boards(x, y, width, height);
        if boards.is_empty() {
            return false;
        }
        if let Some(max_dead_boards) = self.max_dead_boards {
            let expected = self.expected_boards.unwrap_or(width * height * 3);
            let dead = expected.saturating_sub(boards.len() as u32);
            if dead > max_dead_boards {
                return false;
            }
        }

        let classes = self.classify_links(&boards);
        if self.require_torus && classes.torus.is_empty() {
            return false;
        }
        if let Some(max_dead_links) = self.max_dead_links {
            let mut dead_links = classes.dead;
            if self.require_torus {
                dead_links += classes.dead_wrap;
            }
            if dead_links > max_dead_links as usize {
                return false;
            }
        }

        self.result = Some(CandidateResult {
            boards,
            periphery: classes.periphery,
            torus: classes.torus,
        });
        true
    }
}
