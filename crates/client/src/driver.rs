//! The driver: a registered client process.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use spider_core::data::KeyValueData;
use spider_core::driver::Driver as DriverRecord;
use spider_core::error::StorageErr;
use spider_core::graph::TaskGraph;
use spider_core::net::local_address;

use spider_storage::{
    factory_for_url, DataStorage, JobSubmissionBatch, MetadataStorage, StorageFactory,
};

use crate::data::DataBuilder;
use crate::error::ClientError;
use crate::job::JobHandle;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const HEARTBEAT_FAIL_LIMIT: u32 = 5;

/// Shared store handles threaded through jobs and data handles.
#[derive(Clone)]
pub(crate) struct StorageHandles {
    pub(crate) factory: Arc<dyn StorageFactory>,
    pub(crate) metadata: Arc<dyn MetadataStorage>,
    pub(crate) data: Arc<dyn DataStorage>,
}

impl StorageHandles {
    fn new(factory: Arc<dyn StorageFactory>) -> Self {
        let metadata = factory.provide_metadata_storage();
        let data = factory.provide_data_storage();
        Self {
            factory,
            metadata,
            data,
        }
    }
}

/// Deferred storage cleanup performed by the driver's background task.
#[derive(Debug)]
pub(crate) enum CleanupAction {
    RemoveDriverReference { data_id: Uuid, driver_id: Uuid },
}

/// A registered client of the Spider cluster.
///
/// Registration inserts a driver row which a background task keeps fresh
/// with heartbeats; a driver that stops heartbeating is swept away by the
/// scheduler, cascading its references.
pub struct Driver {
    id: Uuid,
    handles: StorageHandles,
    cleanup_tx: mpsc::UnboundedSender<CleanupAction>,
    heartbeat: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

impl Driver {
    /// Connects to the storage backend at `storage_url` and registers a
    /// fresh driver id.
    pub async fn connect(storage_url: &str) -> Result<Self, ClientError> {
        Self::with_factory(factory_for_url(storage_url)?).await
    }

    pub async fn with_factory(factory: Arc<dyn StorageFactory>) -> Result<Self, ClientError> {
        Self::with_factory_and_id(factory, Uuid::new_v4()).await
    }

    pub async fn with_factory_and_id(
        factory: Arc<dyn StorageFactory>,
        id: Uuid,
    ) -> Result<Self, ClientError> {
        let handles = StorageHandles::new(factory);
        let mut conn = handles.factory.provide_connection().await?;
        handles.metadata.initialize(conn.as_mut()).await?;
        handles.data.initialize(conn.as_mut()).await?;

        match handles
            .metadata
            .add_driver(conn.as_mut(), &DriverRecord::new(id, local_address()))
            .await
        {
            Ok(()) => {}
            Err(StorageErr::DuplicateKey(_)) => return Err(ClientError::DriverIdInUse(id)),
            Err(err) => return Err(err.into()),
        }

        let heartbeat = tokio::spawn(heartbeat_loop(handles.clone(), id));

        let (cleanup_tx, cleanup_rx) = mpsc::unbounded_channel();
        let cleanup = tokio::spawn(cleanup_loop(handles.clone(), cleanup_rx));

        Ok(Self {
            id,
            handles,
            cleanup_tx,
            heartbeat,
            cleanup,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Persists a task graph as a new job.
    ///
    /// A `DuplicateKey` collision is retried once with freshly minted task
    /// ids.
    pub async fn submit(&self, graph: TaskGraph) -> Result<JobHandle, ClientError> {
        let mut graph = graph;
        let mut conn = self.handles.factory.provide_connection().await?;
        for attempt in 0..2 {
            let job_id = Uuid::new_v4();
            let mut batch = JobSubmissionBatch::new();
            self.handles
                .metadata
                .add_job_batch(conn.as_mut(), &mut batch, job_id, self.id, &graph)
                .await?;
            match self
                .handles
                .metadata
                .submit_batch(conn.as_mut(), &mut batch)
                .await
            {
                Ok(()) => return Ok(JobHandle::new(job_id, self.handles.clone())),
                Err(StorageErr::DuplicateKey(_)) if attempt == 0 => {
                    tracing::debug!(%job_id, "job submission hit a duplicate key, retrying with new ids");
                    graph.reset_ids();
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(ClientError::Other(
            "job submission kept colliding with existing ids".to_string(),
        ))
    }

    /// Handle to an already-submitted job.
    pub fn job(&self, id: Uuid) -> JobHandle {
        JobHandle::new(id, self.handles.clone())
    }

    /// Ids of every job submitted by this driver.
    pub async fn jobs(&self) -> Result<Vec<Uuid>, ClientError> {
        let mut conn = self.handles.factory.provide_connection().await?;
        Ok(self
            .handles
            .metadata
            .get_jobs_by_client_id(conn.as_mut(), self.id)
            .await?)
    }

    /// Inserts into the client-scoped key-value store.
    pub async fn kv_insert(&self, key: &str, value: &str) -> Result<(), ClientError> {
        let mut conn = self.handles.factory.provide_connection().await?;
        self.handles
            .data
            .add_client_kv_data(conn.as_mut(), &KeyValueData::new(self.id, key, value))
            .await?;
        Ok(())
    }

    /// Reads from the client-scoped key-value store.
    pub async fn kv_get(&self, key: &str) -> Result<Option<String>, ClientError> {
        let mut conn = self.handles.factory.provide_connection().await?;
        match self
            .handles
            .data
            .get_client_kv_data(conn.as_mut(), self.id, key)
            .await
        {
            Ok(value) => Ok(Some(value)),
            Err(StorageErr::KeyNotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn data_builder(&self) -> DataBuilder<'_> {
        DataBuilder::new(self)
    }

    /// Clean shutdown: removes the driver row (cascading this driver's
    /// references) and stops the background tasks.
    pub async fn shutdown(self) -> Result<(), ClientError> {
        let mut conn = self.handles.factory.provide_connection().await?;
        self.handles
            .metadata
            .remove_driver(conn.as_mut(), self.id)
            .await?;
        Ok(())
    }

    pub(crate) fn storage_handles(&self) -> StorageHandles {
        self.handles.clone()
    }

    pub(crate) fn cleanup_sender(&self) -> mpsc::UnboundedSender<CleanupAction> {
        self.cleanup_tx.clone()
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.heartbeat.abort();
        self.cleanup.abort();
    }
}

async fn heartbeat_loop(handles: StorageHandles, id: Uuid) {
    let mut conn = match handles.factory.provide_connection().await {
        Ok(conn) => conn,
        Err(err) => {
            tracing::error!(%err, "cannot open heartbeat connection");
            return;
        }
    };
    let mut fail_count = 0u32;
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match handles.metadata.update_heartbeat(conn.as_mut(), id).await {
            Ok(()) => fail_count = 0,
            Err(err) => {
                fail_count += 1;
                tracing::warn!(%err, fail_count, "driver heartbeat failed");
                if fail_count >= HEARTBEAT_FAIL_LIMIT {
                    tracing::error!("driver heartbeat failed too many times, giving up");
                    return;
                }
            }
        }
    }
}

async fn cleanup_loop(
    handles: StorageHandles,
    mut rx: mpsc::UnboundedReceiver<CleanupAction>,
) {
    let mut conn = match handles.factory.provide_connection().await {
        Ok(conn) => conn,
        Err(err) => {
            tracing::error!(%err, "cannot open cleanup connection");
            return;
        }
    };
    while let Some(action) = rx.recv().await {
        match action {
            CleanupAction::RemoveDriverReference { data_id, driver_id } => {
                if let Err(err) = handles
                    .data
                    .remove_driver_reference(conn.as_mut(), data_id, driver_id)
                    .await
                {
                    tracing::warn!(%err, %data_id, "failed to remove driver data reference");
                }
            }
        }
    }
}
