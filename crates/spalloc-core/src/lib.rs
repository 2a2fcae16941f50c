#[macro_use]
pub mod internal;

pub use crate::internal::common::ids::{AllocationId, JobId};
pub use crate::internal::common::utils::{format_comma_delimited, now};
pub use crate::internal::common::{Map, Set};

pub use crate::internal::allocator::{
    Allocation, AllocationRequest, AllocationShape, Allocator, DEFAULT_MIN_RATIO, PackTree,
};
pub use crate::internal::bmp::{BmpConnector, BmpTransport, DEFAULT_RETRY_DELAY, LoggingConnector};
pub use crate::internal::controller::{
    Controller, ControllerConfig, ControllerSnapshot, DEFAULT_KEEPALIVE, JobDescription, JobInfo,
    JobMachineInfo, JobState, JobStateInfo, MachineInfo, STATE_VERSION, WhereIs, WhereIsQuery,
};
pub use crate::internal::geometry::{BoardLink, BoardXyz, Direction, PhysicalLocation, WrapAround};
pub use crate::internal::machine::{Machine, StandardIps, default_tags, validate_machines};

pub type Error = internal::common::error::SpallocError;
pub type Result<T> = std::result::Result<T, Error>;
