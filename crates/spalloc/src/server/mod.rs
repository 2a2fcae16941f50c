//! TCP front end of the allocation service.
//!
//! Clients exchange newline-delimited JSON objects with the server. Every
//! connection is served by its own task; changes reported by the
//! controller are fanned out to all connections, each of which forwards
//! the ones its client subscribed to.

pub mod bootstrap;
pub mod client;
pub mod commands;
pub mod notify;
pub mod protocol;
pub mod state;
pub mod state_file;
