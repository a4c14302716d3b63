#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Scheduler service for the Spider task-graph engine.
//!
//! Workers poll the scheduler over TCP for dispatchable tasks. Selection
//! is FIFO with data-locality preferences; scheduler leases prevent two
//! schedulers from handing out the same task concurrently.

pub mod cache;
pub mod loops;
pub mod message;
pub mod policy;
pub mod server;

pub use message::{ScheduleTaskRequest, ScheduleTaskResponse, TaskCompletion};
pub use policy::{FifoPolicy, SchedulerPolicy};
pub use server::SchedulerServer;
