//! Task-scoped access to the storage backend.

use std::sync::Arc;

use uuid::Uuid;

use spider_core::data::{Data, KeyValueData};
use spider_core::error::StorageErr;
use spider_core::graph::TaskGraph;

use spider_storage::{DataStorage, MetadataStorage, StorageFactory};

use crate::error::ClientError;
use crate::registry::DataRef;

/// Handle given to every running task function.
///
/// It exposes the storage facilities a task may use: the task-scoped
/// key-value store, data creation and loading, and nested job submission
/// with the task as the client.
#[derive(Clone)]
pub struct TaskContext {
    task_id: Uuid,
    factory: Arc<dyn StorageFactory>,
    metadata: Arc<dyn MetadataStorage>,
    data: Arc<dyn DataStorage>,
}

impl TaskContext {
    pub fn new(task_id: Uuid, factory: Arc<dyn StorageFactory>) -> Self {
        let metadata = factory.provide_metadata_storage();
        let data = factory.provide_data_storage();
        Self {
            task_id,
            factory,
            metadata,
            data,
        }
    }

    /// Id of the task this context is bound to.
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Inserts into the task-scoped key-value store, overwriting any
    /// existing value.
    pub async fn kv_insert(&self, key: &str, value: &str) -> Result<(), ClientError> {
        let mut conn = self.factory.provide_connection().await?;
        self.data
            .add_task_kv_data(conn.as_mut(), &KeyValueData::new(self.task_id, key, value))
            .await?;
        Ok(())
    }

    /// Reads from the task-scoped key-value store. Values written by
    /// previous instances of the same task are visible.
    pub async fn kv_get(&self, key: &str) -> Result<Option<String>, ClientError> {
        let mut conn = self.factory.provide_connection().await?;
        match self
            .data
            .get_task_kv_data(conn.as_mut(), self.task_id, key)
            .await
        {
            Ok(value) => Ok(Some(value)),
            Err(StorageErr::KeyNotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Stores a new datum owned by this task and returns a reference to it.
    pub async fn create_data(&self, value: Vec<u8>) -> Result<DataRef, ClientError> {
        let data = Data::new(value);
        let id = data.id;
        let mut conn = self.factory.provide_connection().await?;
        self.data
            .add_task_data(conn.as_mut(), self.task_id, &data)
            .await?;
        Ok(DataRef(id))
    }

    /// Loads a datum this task holds a reference to.
    pub async fn load_data(&self, data_ref: DataRef) -> Result<Vec<u8>, ClientError> {
        let mut conn = self.factory.provide_connection().await?;
        let data = self
            .data
            .get_task_data(conn.as_mut(), self.task_id, data_ref.0)
            .await?;
        Ok(data.value)
    }

    /// Submits a nested job with this task as the client.
    pub async fn submit_job(&self, graph: &TaskGraph) -> Result<Uuid, ClientError> {
        let job_id = Uuid::new_v4();
        let mut conn = self.factory.provide_connection().await?;
        self.metadata
            .add_job(conn.as_mut(), job_id, self.task_id, graph)
            .await?;
        Ok(job_id)
    }

    /// Ids of every job this task has started.
    pub async fn jobs(&self) -> Result<Vec<Uuid>, ClientError> {
        let mut conn = self.factory.provide_connection().await?;
        Ok(self
            .metadata
            .get_jobs_by_client_id(conn.as_mut(), self.task_id)
            .await?)
    }
}
