mod job_queue;

pub use job_queue::{JobQueue, QueueEvent};
