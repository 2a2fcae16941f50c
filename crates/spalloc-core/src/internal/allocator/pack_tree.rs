use serde::{Deserialize, Serialize};

use crate::internal::common::error::SpallocError;

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
enum NodeState {
    Free,
    Allocated,
    /// Two children which exactly partition this node along one axis.
    Split(Box<[PackTree; 2]>),
}

/// Guillotine free-space index over a rectangular grid of triads.
///
/// Every node is either a free leaf, an allocated leaf or is split into two
/// children. Freeing an allocation collapses any split whose children are
/// both free leaves, so free space never stays fragmented.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PackTree {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    state: NodeState,
}

impl PackTree {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        PackTree {
            x,
            y,
            width,
            height,
            state: NodeState::Free,
        }
    }

    #[inline]
    fn area(&self) -> u32 {
        self.width * self.height
    }

    #[inline]
    fn contains(&self, x: u32, y: u32) -> bool {
        (self.x..self.x + self.width).contains(&x) && (self.y..self.y + self.height).contains(&y)
    }

    fn set_children(&mut self, a: PackTree, b: PackTree) -> &mut [PackTree; 2] {
        debug_assert!(matches!(self.state, NodeState::Free));
        self.state = NodeState::Split(Box::new([a, b]));
        match &mut self.state {
            NodeState::Split(children) => children,
            _ => unreachable!(),
        }
    }

    /// Split into a bottom part ending just below row `y` and a top part.
    fn hsplit(&mut self, y: u32) -> &mut [PackTree; 2] {
        let bottom = PackTree::new(self.x, self.y, self.width, y - self.y);
        let top = PackTree::new(self.x, y, self.width, self.height - (y - self.y));
        self.set_children(bottom, top)
    }

    /// Split into a left part ending just before column `x` and a right part.
    fn vsplit(&mut self, x: u32) -> &mut [PackTree; 2] {
        let left = PackTree::new(self.x, self.y, x - self.x, self.height);
        let right = PackTree::new(x, self.y, self.width - (x - self.x), self.height);
        self.set_children(left, right)
    }

    /// Children in the order they should be searched: smallest first.
    fn search_order(children: &[PackTree; 2]) -> [usize; 2] {
        if children[1].area() < children[0].area() {
            [1, 0]
        } else {
            [0, 1]
        }
    }

    /// Tries the corners of this leaf as origins of a `width` x `height`
    /// rectangle and returns the first one the filter accepts.
    fn find_acceptable<F>(&self, width: u32, height: u32, filter: &mut F) -> Option<(u32, u32)>
    where
        F: FnMut(u32, u32, u32, u32) -> bool,
    {
        let mut tried: [Option<(u32, u32)>; 4] = [None; 4];
        let xs = [self.x, self.x + self.width - width];
        let ys = [self.y, self.y + self.height - height];
        for (i, candidate) in xs
            .iter()
            .flat_map(|&x| ys.iter().map(move |&y| (x, y)))
            .enumerate()
        {
            if tried.contains(&Some(candidate)) {
                continue;
            }
            tried[i] = Some(candidate);
            if filter(candidate.0, candidate.1, width, height) {
                return Some(candidate);
            }
        }
        None
    }

    /// Allocates a `width` x `height` rectangle accepted by `filter`.
    ///
    /// Returns the bottom-left corner of the allocation.
    pub fn alloc<F>(&mut self, width: u32, height: u32, filter: &mut F) -> Option<(u32, u32)>
    where
        F: FnMut(u32, u32, u32, u32) -> bool,
    {
        if width == 0 || height == 0 || width > self.width || height > self.height {
            return None;
        }
        match &mut self.state {
            NodeState::Allocated => return None,
            NodeState::Split(children) => {
                for i in Self::search_order(children) {
                    if let Some(xy) = children[i].alloc(width, height, filter) {
                        return Some(xy);
                    }
                }
                return None;
            }
            NodeState::Free => {}
        }

        let (x, y) = self.find_acceptable(width, height, filter)?;
        if width == self.width && height == self.height {
            self.state = NodeState::Allocated;
            return Some((self.x, self.y));
        }

        // Keep the larger leftover region whole
        let dw = self.width - width;
        let dh = self.height - height;
        let (self_x, self_y) = (self.x, self.y);
        let child = if dh > dw {
            let children = self.hsplit(if y != self_y { y } else { y + height });
            &mut children[if y == self_y { 0 } else { 1 }]
        } else {
            let children = self.vsplit(if x != self_x { x } else { x + width });
            &mut children[if x == self_x { 0 } else { 1 }]
        };

        let (child_x, child_y) = (child.x, child.y);
        let target = if child.width != width {
            let children = child.vsplit(if x != child_x { x } else { child_x + width });
            &mut children[if x == child_x { 0 } else { 1 }]
        } else if child.height != height {
            let children = child.hsplit(if y != child_y { y } else { child_y + height });
            &mut children[if y == child_y { 0 } else { 1 }]
        } else {
            child
        };
        target.state = NodeState::Allocated;
        Some((target.x, target.y))
    }

    /// Allocates a region of at least `area` cells whose aspect ratio is at
    /// least `min_ratio`.
    ///
    /// Returns `(x, y, width, height)` of the allocation.
    pub fn alloc_area<F>(
        &mut self,
        area: u32,
        min_ratio: f64,
        filter: &mut F,
    ) -> Option<(u32, u32, u32, u32)>
    where
        F: FnMut(u32, u32, u32, u32) -> bool,
    {
        if area > self.area() {
            return None;
        }
        match &mut self.state {
            NodeState::Allocated => None,
            NodeState::Split(children) => {
                for i in Self::search_order(children) {
                    if let Some(rect) = children[i].alloc_area(area, min_ratio, filter) {
                        return Some(rect);
                    }
                }
                None
            }
            NodeState::Free => {
                let (width, height) = area_to_rect(area, self.width, self.height, min_ratio)?;
                let (x, y) = self.alloc(width, height, filter)?;
                Some((x, y, width, height))
            }
        }
    }

    /// Allocates the single cell at `(x, y)` if it is free.
    pub fn request(&mut self, x: u32, y: u32) -> Option<(u32, u32)> {
        if !self.contains(x, y) {
            return None;
        }
        match &mut self.state {
            NodeState::Allocated => return None,
            NodeState::Split(children) => {
                if let Some(xy) = children[0].request(x, y) {
                    return Some(xy);
                }
                return children[1].request(x, y);
            }
            NodeState::Free => {}
        }
        if self.width == 1 && self.height == 1 {
            self.state = NodeState::Allocated;
            return Some((x, y));
        }

        // Split off the largest free region not containing the cell
        let left = x - self.x;
        let right = self.x + self.width - x - 1;
        let above = self.y + self.height - y - 1;
        let below = y - self.y;
        let largest = left.max(right).max(above).max(below);
        if left == largest {
            self.vsplit(x);
        } else if right == largest {
            self.vsplit(x + 1);
        } else if above == largest {
            self.hsplit(y + 1);
        } else {
            self.hsplit(y);
        }
        self.request(x, y)
    }

    /// Frees the allocation whose bottom-left corner is `(x, y)`.
    pub fn free(&mut self, x: u32, y: u32) -> crate::Result<()> {
        match &mut self.state {
            NodeState::Allocated if (self.x, self.y) == (x, y) => {
                self.state = NodeState::Free;
                Ok(())
            }
            NodeState::Free if (self.x, self.y) == (x, y) => Err(SpallocError::GenericError(
                format!("Cannot free non-allocated region {x}, {y}"),
            )),
            NodeState::Split(children) => {
                let child = children
                    .iter_mut()
                    .find(|c| c.contains(x, y))
                    .ok_or_else(|| {
                        SpallocError::GenericError(format!(
                            "Cannot free {x}, {y} which is outside the region"
                        ))
                    })?;
                child.free(x, y)?;
                if children
                    .iter()
                    .all(|c| matches!(c.state, NodeState::Free))
                {
                    self.state = NodeState::Free;
                }
                Ok(())
            }
            _ => Err(SpallocError::GenericError(format!(
                "Cannot free {x}, {y} which is not the origin of an allocation"
            ))),
        }
    }

    /// All leaves as `(x, y, width, height, allocated)`.
    pub fn leaves(&self) -> Vec<(u32, u32, u32, u32, bool)> {
        let mut result = Vec::new();
        self.collect_leaves(&mut result);
        result
    }

    fn collect_leaves(&self, out: &mut Vec<(u32, u32, u32, u32, bool)>) {
        match &self.state {
            NodeState::Free => out.push((self.x, self.y, self.width, self.height, false)),
            NodeState::Allocated => out.push((self.x, self.y, self.width, self.height, true)),
            NodeState::Split(children) => {
                children[0].collect_leaves(out);
                children[1].collect_leaves(out);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.state, NodeState::Free)
    }
}

/// Picks the dimensions of a rectangle of at least `area` cells fitting in
/// `max_width` x `max_height` with an aspect ratio of at least `min_ratio`.
///
/// Smaller rectangles win, then squarer ones, then wider ones.
pub fn area_to_rect(area: u32, max_width: u32, max_height: u32, min_ratio: f64) -> Option<(u32, u32)> {
    if area == 0 {
        return None;
    }
    for test_area in area..=max_width * max_height {
        let best = (1..=max_height.min(test_area))
            .filter(|h| test_area % h == 0)
            .map(|h| (test_area / h, h))
            .filter(|&(w, h)| {
                w <= max_width && (w.min(h) as f64 / w.max(h) as f64) >= min_ratio
            })
            .min_by_key(|&(w, h)| (w.abs_diff(h), std::cmp::Reverse(w)));
        if best.is_some() {
            return best;
        }
    }
    None
}
