//! Asynchronous control of the Board Management Processors.
//!
//! Every BMP (one per cabinet and frame) gets its own worker thread which
//! executes [`RequestGroup`]s strictly in submission order.

mod request;
mod transport;
mod worker;

pub use request::{CompletionCallback, LinkRequest, RequestGroup};
pub use transport::{BmpConnector, BmpTransport, LoggingConnector};
pub use worker::{BmpWorker, DEFAULT_RETRY_DELAY, REQUEST_ATTEMPTS};
