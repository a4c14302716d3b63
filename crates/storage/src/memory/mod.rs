//! In-memory reference backend.
//!
//! One mutex guards the whole database; every trait operation locks it
//! once, validates, then mutates, which gives each call the per-call
//! atomicity the storage contract requires.

mod data;
mod db;
mod metadata;

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use spider_core::error::StorageErr;

use crate::connection::{StorageConnection, StorageFactory};
use crate::data::DataStorage;
use crate::metadata::MetadataStorage;

use db::MemoryDb;

pub use data::MemoryDataStorage;
pub use metadata::MemoryMetadataStorage;

/// Factory for the `memory://` backend. Cloned factories share one
/// database; distinct factories are fully isolated.
#[derive(Clone, Default)]
pub struct MemoryStorageFactory {
    db: Arc<Mutex<MemoryDb>>,
}

impl MemoryStorageFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageFactory for MemoryStorageFactory {
    async fn provide_connection(&self) -> Result<Box<dyn StorageConnection>, StorageErr> {
        Ok(Box::new(MemoryConnection {
            db: self.db.clone(),
        }))
    }

    fn provide_metadata_storage(&self) -> Arc<dyn MetadataStorage> {
        Arc::new(MemoryMetadataStorage)
    }

    fn provide_data_storage(&self) -> Arc<dyn DataStorage> {
        Arc::new(MemoryDataStorage)
    }
}

/// Connection handle of the in-memory backend.
pub struct MemoryConnection {
    db: Arc<Mutex<MemoryDb>>,
}

impl StorageConnection for MemoryConnection {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Locks the database behind a generic connection handle.
pub(crate) fn lock(
    conn: &mut dyn StorageConnection,
) -> Result<MutexGuard<'_, MemoryDb>, StorageErr> {
    let conn = conn
        .as_any_mut()
        .downcast_mut::<MemoryConnection>()
        .ok_or_else(|| {
            StorageErr::Connection("connection does not belong to the memory backend".to_string())
        })?;
    conn.db
        .lock()
        .map_err(|_| StorageErr::Other("memory store mutex poisoned".to_string()))
}
