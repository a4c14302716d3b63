//! The data store surface: opaque values, references, and key-value rows.

use async_trait::async_trait;
use uuid::Uuid;

use spider_core::data::{Data, KeyValueData};
use spider_core::error::StorageErr;

use crate::connection::StorageConnection;

/// Persistence of user data blobs, their reference sets, and the scoped
/// key-value namespaces.
#[async_trait]
pub trait DataStorage: Send + Sync {
    /// Creates the backend schema. Idempotent.
    async fn initialize(&self, conn: &mut dyn StorageConnection) -> Result<(), StorageErr>;

    /// Stores a datum owned by a driver, adding the driver reference.
    async fn add_driver_data(
        &self,
        conn: &mut dyn StorageConnection,
        driver_id: Uuid,
        data: &Data,
    ) -> Result<(), StorageErr>;

    /// Stores a datum owned by a task, adding the task reference.
    async fn add_task_data(
        &self,
        conn: &mut dyn StorageConnection,
        task_id: Uuid,
        data: &Data,
    ) -> Result<(), StorageErr>;

    async fn get_data(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<Data, StorageErr>;

    /// Reads a datum the given driver holds a reference to.
    async fn get_driver_data(
        &self,
        conn: &mut dyn StorageConnection,
        driver_id: Uuid,
        id: Uuid,
    ) -> Result<Data, StorageErr>;

    /// Reads a datum the given task holds a reference to.
    async fn get_task_data(
        &self,
        conn: &mut dyn StorageConnection,
        task_id: Uuid,
        id: Uuid,
    ) -> Result<Data, StorageErr>;

    async fn set_data_locality(
        &self,
        conn: &mut dyn StorageConnection,
        data: &Data,
    ) -> Result<(), StorageErr>;

    async fn remove_data(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<(), StorageErr>;

    async fn add_task_reference(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
        task_id: Uuid,
    ) -> Result<(), StorageErr>;

    async fn remove_task_reference(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
        task_id: Uuid,
    ) -> Result<(), StorageErr>;

    async fn add_driver_reference(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
        driver_id: Uuid,
    ) -> Result<(), StorageErr>;

    async fn remove_driver_reference(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
        driver_id: Uuid,
    ) -> Result<(), StorageErr>;

    /// Deletes every datum with no remaining driver or task reference.
    async fn remove_dangling_data(
        &self,
        conn: &mut dyn StorageConnection,
    ) -> Result<(), StorageErr>;

    async fn add_client_kv_data(
        &self,
        conn: &mut dyn StorageConnection,
        data: &KeyValueData,
    ) -> Result<(), StorageErr>;

    async fn add_task_kv_data(
        &self,
        conn: &mut dyn StorageConnection,
        data: &KeyValueData,
    ) -> Result<(), StorageErr>;

    async fn get_client_kv_data(
        &self,
        conn: &mut dyn StorageConnection,
        client_id: Uuid,
        key: &str,
    ) -> Result<String, StorageErr>;

    async fn get_task_kv_data(
        &self,
        conn: &mut dyn StorageConnection,
        task_id: Uuid,
        key: &str,
    ) -> Result<String, StorageErr>;
}
