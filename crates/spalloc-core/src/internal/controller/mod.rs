pub(crate) mod comm;
pub(crate) mod core;
mod handle;
pub(crate) mod job;
pub(crate) mod query;
pub(crate) mod reactor;
mod snapshot;

pub use handle::{BackgroundCallback, Controller, ControllerConfig};
pub use job::{DEFAULT_KEEPALIVE, Job, JobAllocation, JobDescription, JobState};
pub use query::{JobInfo, JobMachineInfo, JobStateInfo, MachineInfo, WhereIs, WhereIsQuery};
pub use snapshot::{ControllerSnapshot, STATE_VERSION};
