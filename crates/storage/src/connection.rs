//! Connection handles and the backend factory.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use spider_core::error::StorageErr;

use crate::data::DataStorage;
use crate::metadata::MetadataStorage;

/// A live connection to a storage backend.
///
/// Connections are held for the duration of one transaction at a time and
/// are never multiplexed. Backends downcast the handle to their own type.
pub trait StorageConnection: Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Produces connections and store handles for one backend.
#[async_trait]
pub trait StorageFactory: Send + Sync {
    async fn provide_connection(&self) -> Result<Box<dyn StorageConnection>, StorageErr>;

    fn provide_metadata_storage(&self) -> Arc<dyn MetadataStorage>;

    fn provide_data_storage(&self) -> Arc<dyn DataStorage>;
}
