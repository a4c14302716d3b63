#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Core data model and wire codec for the Spider task-graph engine.
//!
//! Everything in this crate is shared by the storage layer, the scheduler,
//! the worker, and the client façade: entity types, the task graph, the
//! storage and function-invoke error taxonomies, the msgpack envelope
//! codec, and the TCP message framing.

pub mod data;
pub mod driver;
pub mod envelope;
pub mod error;
pub mod graph;
pub mod job;
pub mod net;
pub mod stop;
pub mod task;
