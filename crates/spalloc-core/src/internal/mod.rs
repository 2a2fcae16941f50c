pub mod allocator;
pub mod bmp;
pub(crate) mod common;
pub mod controller;
pub mod geometry;
pub mod machine;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod tests;
