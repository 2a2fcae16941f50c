use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::internal::allocator::filter::CandidateFilter;
use crate::internal::allocator::pack_tree::{PackTree, area_to_rect};
use crate::internal::allocator::request::{AllocationRequest, AllocationShape};
use crate::internal::common::ids::AllocationId;
use crate::internal::geometry::{BoardLink, BoardXyz, Direction, WrapAround};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
enum AllocationKind {
    /// A rectangle of triads held directly in the pack tree.
    Triads,
    /// One board of a triad shared between single-board allocations.
    Board,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingFree {
    freed_at: f64,
    kind: AllocationKind,
    board: BoardXyz,
}

/// Result of a successful allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub id: AllocationId,
    pub boards: BTreeSet<BoardXyz>,
    /// Links leaving the allocated boards which must be disabled to isolate them.
    pub periphery: BTreeSet<BoardLink>,
    pub torus: WrapAround,
}

/// Board allocator of a single machine.
///
/// Whole triads are managed by a [`PackTree`]. Single-board requests are
/// served from triads taken out of the tree for that purpose; such a triad
/// returns to the tree once all of its boards are free again.
/// Freed allocations only become available after `seconds_before_free`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocator {
    width: u32,
    height: u32,
    dead_boards: BTreeSet<BoardXyz>,
    dead_links: BTreeSet<BoardLink>,
    seconds_before_free: f64,
    next_id: u32,
    pack_tree: PackTree,
    allocations: BTreeMap<AllocationId, (AllocationKind, BoardXyz)>,
    to_free: VecDeque<PendingFree>,
    /// Triads used for single boards which still have free working boards.
    single_board_triads: BTreeMap<(u32, u32), BTreeSet<u32>>,
    /// Triads used for single boards with no free working board left.
    full_single_board_triads: BTreeSet<(u32, u32)>,
}

impl Allocator {
    pub fn new(
        width: u32,
        height: u32,
        dead_boards: BTreeSet<BoardXyz>,
        dead_links: BTreeSet<BoardLink>,
        seconds_before_free: f64,
    ) -> Self {
        Allocator {
            width,
            height,
            dead_boards,
            dead_links,
            seconds_before_free,
            next_id: 1,
            pack_tree: PackTree::new(0, 0, width, height),
            allocations: Default::default(),
            to_free: Default::default(),
            single_board_triads: Default::default(),
            full_single_board_triads: Default::default(),
        }
    }

    pub fn set_dead_boards(&mut self, dead_boards: BTreeSet<BoardXyz>) {
        self.dead_boards = dead_boards;
    }

    pub fn set_dead_links(&mut self, dead_links: BTreeSet<BoardLink>) {
        self.dead_links = dead_links;
    }

    pub fn set_seconds_before_free(&mut self, seconds_before_free: f64) {
        self.seconds_before_free = seconds_before_free;
    }

    pub fn pack_tree(&self) -> &PackTree {
        &self.pack_tree
    }

    /// Triads currently serving single-board allocations.
    pub fn single_board_triads(&self) -> BTreeSet<(u32, u32)> {
        self.single_board_triads
            .keys()
            .chain(self.full_single_board_triads.iter())
            .copied()
            .collect()
    }

    pub fn pending_free_count(&self) -> usize {
        self.to_free.len()
    }

    fn working_boards(&self, x: u32, y: u32) -> BTreeSet<u32> {
        (0..3)
            .filter(|&z| !self.dead_boards.contains(&(x, y, z)))
            .collect()
    }

    fn filter(&self, request: &AllocationRequest, expected_boards: Option<u32>) -> CandidateFilter<'_> {
        CandidateFilter::new(
            self.width,
            self.height,
            &self.dead_boards,
            &self.dead_links,
            request.max_dead_boards,
            request.max_dead_links,
            request.require_torus,
            expected_boards,
        )
    }

    /// Tests the corners of an otherwise empty machine.
    fn corners_possible(
        &self,
        width: u32,
        height: u32,
        request: &AllocationRequest,
        expected_boards: Option<u32>,
    ) -> bool {
        let mut filter = self.filter(request, expected_boards);
        let xs = [0, self.width - width];
        let ys = [0, self.height - height];
        xs.iter()
            .flat_map(|&x| ys.iter().map(move |&y| (x, y)))
            .any(|(x, y)| filter.check(x, y, width, height))
    }

    /// Conservative feasibility check: `false` means the request can never
    /// be satisfied by this machine, `true` means it might be.
    pub fn alloc_possible(&self, request: &AllocationRequest) -> bool {
        match request.shape {
            AllocationShape::AnyBoard => {
                (self.dead_boards.len() as u32) < self.width * self.height * 3
            }
            AllocationShape::Board { x, y, z } => {
                x < self.width && y < self.height && z < 3 && !self.dead_boards.contains(&(x, y, z))
            }
            AllocationShape::Boards { count } => {
                let triads = count.div_ceil(3);
                if triads == 0 || (request.require_torus && triads != self.width * self.height) {
                    return false;
                }
                match area_to_rect(triads, self.width, self.height, request.min_ratio) {
                    Some((width, height)) => {
                        self.corners_possible(width, height, request, Some(count))
                    }
                    None => false,
                }
            }
            AllocationShape::Triads { width, height } => {
                if width == 0 || height == 0 || width > self.width || height > self.height {
                    return false;
                }
                if request.require_torus && (width != self.width || height != self.height) {
                    return false;
                }
                self.corners_possible(width, height, request, None)
            }
        }
    }

    /// Allocates boards for a request. Allocations which have cooled down
    /// by `now` are released first.
    pub fn alloc(&mut self, request: &AllocationRequest, now: f64) -> Option<Allocation> {
        self.check_free(now);
        let allocation = match request.shape {
            AllocationShape::AnyBoard => self.alloc_board(None),
            AllocationShape::Board { x, y, z } => self.alloc_board(Some((x, y, z))),
            AllocationShape::Boards { count } => self.alloc_boards(count, request),
            AllocationShape::Triads { width, height } => self.alloc_triads(width, height, request),
        };
        if let Some(allocation) = &allocation {
            log::debug!(
                "Allocated {} board(s) as allocation {}",
                allocation.boards.len(),
                allocation.id
            );
        }
        allocation
    }

    fn new_id(&mut self) -> AllocationId {
        let id = AllocationId::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn alloc_triads(
        &mut self,
        width: u32,
        height: u32,
        request: &AllocationRequest,
    ) -> Option<Allocation> {
        if request.require_torus && (width != self.width || height != self.height) {
            return None;
        }
        let mut filter = CandidateFilter::new(
            self.width,
            self.height,
            &self.dead_boards,
            &self.dead_links,
            request.max_dead_boards,
            request.max_dead_links,
            request.require_torus,
            None,
        );
        let (x, y) = self
            .pack_tree
            .alloc(width, height, &mut |x, y, w, h| filter.check(x, y, w, h))?;
        let result = filter.take_result()?;
        let id = self.new_id();
        self.allocations
            .insert(id, (AllocationKind::Triads, (x, y, 0)));
        Some(Allocation {
            id,
            boards: result.boards,
            periphery: result.periphery,
            torus: result.torus,
        })
    }

    fn alloc_boards(&mut self, count: u32, request: &AllocationRequest) -> Option<Allocation> {
        let triads = count.div_ceil(3);
        if triads == 0 || (request.require_torus && triads != self.width * self.height) {
            return None;
        }
        let mut filter = CandidateFilter::new(
            self.width,
            self.height,
            &self.dead_boards,
            &self.dead_links,
            request.max_dead_boards,
            request.max_dead_links,
            request.require_torus,
            Some(count),
        );
        let (x, y, _, _) = self.pack_tree.alloc_area(
            triads,
            request.min_ratio,
            &mut |x, y, w, h| filter.check(x, y, w, h),
        )?;
        let result = filter.take_result()?;
        let id = self.new_id();
        self.allocations
            .insert(id, (AllocationKind::Triads, (x, y, 0)));
        Some(Allocation {
            id,
            boards: result.boards,
            periphery: result.periphery,
            torus: result.torus,
        })
    }

    /// Takes a board from the triads already serving single boards.
    fn take_pooled_board(&mut self, requested: Option<BoardXyz>) -> Option<BoardXyz> {
        let (xy, z) = match requested {
            None => {
                let (&xy, available) = self.single_board_triads.iter().next()?;
                (xy, *available.iter().next()?)
            }
            Some((x, y, z)) => {
                if !self.single_board_triads.get(&(x, y))?.contains(&z) {
                    return None;
                }
                ((x, y), z)
            }
        };
        let available = self.single_board_triads.get_mut(&xy)?;
        available.remove(&z);
        if available.is_empty() {
            self.single_board_triads.remove(&xy);
            self.full_single_board_triads.insert(xy);
        }
        Some((xy.0, xy.1, z))
    }

    fn register_board(&mut self, board: BoardXyz) -> Allocation {
        let id = self.new_id();
        self.allocations.insert(id, (AllocationKind::Board, board));
        let (x, y, z) = board;
        Allocation {
            id,
            boards: BTreeSet::from([board]),
            periphery: Direction::ALL
                .iter()
                .map(|&direction| (x, y, z, direction))
                .collect(),
            torus: WrapAround::NONE,
        }
    }

    fn alloc_board(&mut self, requested: Option<BoardXyz>) -> Option<Allocation> {
        if let Some((x, y, z)) = requested {
            if x >= self.width || y >= self.height || z >= 3 || self.dead_boards.contains(&(x, y, z))
            {
                return None;
            }
        }
        if let Some(board) = self.take_pooled_board(requested) {
            return Some(self.register_board(board));
        }

        let (x, y) = match requested {
            Some((x, y, _)) => self.pack_tree.request(x, y)?,
            None => {
                let dead_boards = &self.dead_boards;
                self.pack_tree.alloc(1, 1, &mut |x, y, _, _| {
                    (0..3).any(|z| !dead_boards.contains(&(x, y, z)))
                })?
            }
        };
        let working = self.working_boards(x, y);
        self.single_board_triads.insert((x, y), working);
        let board = self.take_pooled_board(requested)?;
        Some(self.register_board(board))
    }

    /// Queues an allocation to be released once it has cooled down.
    pub fn free(&mut self, id: AllocationId, now: f64) {
        match self.allocations.remove(&id) {
            Some((kind, board)) => self.to_free.push_back(PendingFree {
                freed_at: now,
                kind,
                board,
            }),
            None => log::warn!("Freeing unknown allocation {id}"),
        }
    }

    /// Releases all allocations which have cooled down.
    /// Returns true if anything was released.
    pub fn check_free(&mut self, now: f64) -> bool {
        let mut changed = false;
        while let Some(entry) = self.to_free.front() {
            if now - entry.freed_at < self.seconds_before_free {
                break;
            }
            if let Some(entry) = self.to_free.pop_front() {
                self.release(entry);
                changed = true;
            }
        }
        changed
    }

    fn release(&mut self, entry: PendingFree) {
        let (x, y, z) = entry.board;
        match entry.kind {
            AllocationKind::Triads => {
                if let Err(error) = self.pack_tree.free(x, y) {
                    log::error!("Releasing triads at ({x}, {y}) failed: {error}");
                }
            }
            AllocationKind::Board => {
                if self.full_single_board_triads.remove(&(x, y)) {
                    self.single_board_triads.insert((x, y), BTreeSet::new());
                }
                let working = self.working_boards(x, y);
                let available = self.single_board_triads.entry((x, y)).or_default();
                available.insert(z);
                if *available == working {
                    self.single_board_triads.remove(&(x, y));
                    if let Err(error) = self.pack_tree.free(x, y) {
                        log::error!("Releasing single board triad ({x}, {y}) failed: {error}");
                    }
                }
            }
        }
    }
}
