pub mod registry;
pub mod stats;
pub mod task;

pub use registry::{BatchHandle, Registry};
pub use task::{poll_callback, PollCallback, PollTask, Regime, TaskSnapshot, TaskStatus};
