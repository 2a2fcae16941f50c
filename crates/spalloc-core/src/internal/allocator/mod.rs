mod allocator;
mod filter;
mod pack_tree;
mod request;

pub use allocator::{Allocation, Allocator};
pub use pack_tree::{PackTree, area_to_rect};
pub use request::{AllocationRequest, AllocationShape, DEFAULT_MIN_RATIO};
