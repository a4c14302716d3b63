#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Client façade for the Spider task-graph engine.
//!
//! A [`Driver`] registers the calling process with the storage backend,
//! keeps it alive with heartbeats, and submits task graphs built with
//! [`TaskGraphBuilder`]. Task functions are registered into a
//! [`FunctionRegistry`] and run inside worker-spawned executor processes
//! with a [`TaskContext`] bound to the running task.

pub mod builder;
pub mod context;
pub mod data;
pub mod driver;
pub mod error;
pub mod job;
pub mod registry;

pub use builder::{literal, output, TaskGraphBuilder, TaskInputSlot, TaskNode, TaskOptions};
pub use context::TaskContext;
pub use data::{DataBuilder, DataHandle};
pub use driver::Driver;
pub use error::ClientError;
pub use job::JobHandle;
pub use registry::{
    DataRef, FunctionRegistry, InvokeOutcome, TaskArgs, TaskError, TaskFunction, TaskOutputs,
    TaskValue,
};
