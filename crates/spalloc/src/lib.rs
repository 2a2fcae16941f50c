pub mod common;
pub mod config;
pub mod server;

#[cfg(test)]
mod tests;

pub type Error = crate::common::error::ServerError;
pub type Result<T> = std::result::Result<T, Error>;

pub const SPALLOC_VERSION: &str = env!("CARGO_PKG_VERSION");
