#![deny(unreachable_pub)]

//! Worker side of the Spider task-graph engine.
//!
//! The worker registers itself as a driver, polls a scheduler for
//! dispatchable tasks, and runs every task instance in an isolated
//! `spider_task_executor` child process supervised by [`TaskExecutor`].

pub mod error;
pub mod executor;
pub mod libs;
pub mod pipe;
pub mod run;
pub mod scheduler_client;

pub use error::WorkerError;
pub use executor::{CancelHandle, ExecutorOutcome, ExecutorSpec, TaskExecutor};
pub use libs::LibraryTable;
pub use run::{run_worker, WorkerConfig};
pub use scheduler_client::SchedulerClient;
