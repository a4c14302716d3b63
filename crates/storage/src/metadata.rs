//! The metadata store surface: drivers, schedulers, jobs, tasks, task
//! instances, leases, and heartbeats.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use spider_core::driver::{Driver, Scheduler};
use spider_core::error::StorageErr;
use spider_core::graph::TaskGraph;
use spider_core::job::{JobMetadata, JobStatus};
use spider_core::task::{ScheduleTaskMetadata, Task, TaskInstance, TaskOutput, TaskState};

use crate::batch::JobSubmissionBatch;
use crate::connection::StorageConnection;

/// Transactional persistence of the task-graph data model. Every method is
/// atomic per call.
#[async_trait]
pub trait MetadataStorage: Send + Sync {
    /// Creates the backend schema. Idempotent.
    async fn initialize(&self, conn: &mut dyn StorageConnection) -> Result<(), StorageErr>;

    async fn add_driver(
        &self,
        conn: &mut dyn StorageConnection,
        driver: &Driver,
    ) -> Result<(), StorageErr>;

    async fn remove_driver(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<(), StorageErr>;

    /// Registers a scheduler, including its driver row so heartbeats and
    /// cascades work.
    async fn add_scheduler(
        &self,
        conn: &mut dyn StorageConnection,
        scheduler: &Scheduler,
    ) -> Result<(), StorageErr>;

    async fn get_active_scheduler(
        &self,
        conn: &mut dyn StorageConnection,
    ) -> Result<Vec<Scheduler>, StorageErr>;

    async fn get_scheduler_addr(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<(String, u16), StorageErr>;

    /// Persists a whole task graph as one job. Tasks are inserted in
    /// topological order; head tasks start `ready`, the rest `pending`.
    async fn add_job(
        &self,
        conn: &mut dyn StorageConnection,
        job_id: Uuid,
        client_id: Uuid,
        graph: &TaskGraph,
    ) -> Result<(), StorageErr>;

    /// Buffers a job submission into `batch` without touching the backend.
    async fn add_job_batch(
        &self,
        conn: &mut dyn StorageConnection,
        batch: &mut JobSubmissionBatch,
        job_id: Uuid,
        client_id: Uuid,
        graph: &TaskGraph,
    ) -> Result<(), StorageErr>;

    /// Applies every buffered submission in one transaction.
    async fn submit_batch(
        &self,
        conn: &mut dyn StorageConnection,
        batch: &mut JobSubmissionBatch,
    ) -> Result<(), StorageErr>;

    async fn get_job_metadata(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<JobMetadata, StorageErr>;

    async fn get_job_complete(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<bool, StorageErr>;

    async fn get_job_status(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<JobStatus, StorageErr>;

    async fn get_job_output_tasks(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<Vec<Uuid>, StorageErr>;

    async fn get_task_graph(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<TaskGraph, StorageErr>;

    async fn get_jobs_by_client_id(
        &self,
        conn: &mut dyn StorageConnection,
        client_id: Uuid,
    ) -> Result<Vec<Uuid>, StorageErr>;

    /// Sets the job and all of its unfinished tasks to `cancel`.
    async fn cancel_job(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<(), StorageErr>;

    /// Cancels the job owning `task_id` and records the cancel message.
    async fn cancel_job_by_task(
        &self,
        conn: &mut dyn StorageConnection,
        task_id: Uuid,
        message: &str,
    ) -> Result<(), StorageErr>;

    /// Returns the `(function_name, message)` recorded for a cancelled or
    /// failed job.
    async fn get_job_message(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<(String, String), StorageErr>;

    async fn remove_job(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<(), StorageErr>;

    /// Resets every task of the job for another attempt. Returns `false`
    /// without mutating when some task already reached its retry limit.
    async fn reset_job(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<bool, StorageErr>;

    /// Inserts a dynamically created child task under an existing parent.
    async fn add_child(
        &self,
        conn: &mut dyn StorageConnection,
        parent_id: Uuid,
        child: &Task,
    ) -> Result<(), StorageErr>;

    async fn get_task(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<Task, StorageErr>;

    async fn get_task_job_id(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<Uuid, StorageErr>;

    async fn get_task_state(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<TaskState, StorageErr>;

    /// Returns the ready, unleased tasks of running jobs, annotated with
    /// job metadata and data localities, taking a lease on every returned
    /// task for `scheduler_id`. Stale leases are evicted first.
    async fn get_ready_tasks(
        &self,
        conn: &mut dyn StorageConnection,
        scheduler_id: Uuid,
    ) -> Result<Vec<ScheduleTaskMetadata>, StorageErr>;

    async fn set_task_state(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
        state: TaskState,
    ) -> Result<(), StorageErr>;

    /// `ready → running`, failing with `KeyNotFound` when the task is not
    /// ready.
    async fn set_task_running(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<(), StorageErr>;

    async fn add_task_instance(
        &self,
        conn: &mut dyn StorageConnection,
        instance: &TaskInstance,
    ) -> Result<(), StorageErr>;

    /// Atomically moves the task to `running` and records the instance,
    /// requiring the task to be `ready` or every prior instance to have
    /// timed out. Drops the task's scheduler lease.
    async fn create_task_instance(
        &self,
        conn: &mut dyn StorageConnection,
        instance: &TaskInstance,
    ) -> Result<(), StorageErr>;

    /// Binds the instance, fills outputs, propagates them to downstream
    /// inputs, promotes newly ready tasks, and finishes the job when every
    /// task succeeded. Idempotent: a second finish is a no-op.
    async fn task_finish(
        &self,
        conn: &mut dyn StorageConnection,
        instance: &TaskInstance,
        outputs: &[TaskOutput],
    ) -> Result<(), StorageErr>;

    /// Deletes the instance; when it was the last one, fails the task and
    /// the job and records the error message.
    async fn task_fail(
        &self,
        conn: &mut dyn StorageConnection,
        instance: &TaskInstance,
        message: &str,
    ) -> Result<(), StorageErr>;

    /// Running tasks with a timeout whose instances have all timed out,
    /// eligible for speculative re-dispatch.
    async fn get_task_timeout(
        &self,
        conn: &mut dyn StorageConnection,
    ) -> Result<Vec<ScheduleTaskMetadata>, StorageErr>;

    async fn get_child_tasks(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<Vec<Task>, StorageErr>;

    async fn get_parent_tasks(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<Vec<Task>, StorageErr>;

    async fn update_heartbeat(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<(), StorageErr>;

    /// Deletes drivers whose heartbeat is older than `timeout` and returns
    /// their ids. Schedulers, leases, and driver references cascade.
    async fn heartbeat_timeout(
        &self,
        conn: &mut dyn StorageConnection,
        timeout: Duration,
    ) -> Result<Vec<Uuid>, StorageErr>;
}
