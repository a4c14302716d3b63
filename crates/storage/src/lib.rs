#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Storage abstraction for the Spider task-graph engine.
//!
//! The metadata and data stores are the single source of truth for every
//! cross-component coordination. Each trait operation takes an explicit
//! connection handle and is atomic: a backend either applies the whole
//! mutation or none of it.
//!
//! The `memory` module provides the in-tree reference backend
//! (`memory://`); durable SQL backends plug in through the same factory
//! trait.

pub mod batch;
pub mod connection;
pub mod data;
pub mod memory;
pub mod metadata;

pub use batch::JobSubmissionBatch;
pub use connection::{StorageConnection, StorageFactory};
pub use data::DataStorage;
pub use memory::MemoryStorageFactory;
pub use metadata::MetadataStorage;

use std::sync::Arc;

use spider_core::error::StorageErr;

/// Scheme of the in-memory backend url.
pub const MEMORY_URL_SCHEME: &str = "memory://";

/// Resolves a storage url to a backend factory.
pub fn factory_for_url(url: &str) -> Result<Arc<dyn StorageFactory>, StorageErr> {
    if url.starts_with(MEMORY_URL_SCHEME) {
        return Ok(Arc::new(MemoryStorageFactory::new()));
    }
    Err(StorageErr::DbNotFound(format!(
        "no storage backend for url {url}"
    )))
}
