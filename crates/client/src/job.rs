//! Client handle to a submitted job.

use std::time::Duration;

use uuid::Uuid;

use spider_core::envelope::pack_value;
use spider_core::job::JobStatus;

use crate::driver::StorageHandles;
use crate::error::ClientError;
use crate::registry::TaskOutputs;

/// Interval between job status polls.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A running task graph.
pub struct JobHandle {
    id: Uuid,
    handles: StorageHandles,
}

impl JobHandle {
    pub(crate) fn new(id: Uuid, handles: StorageHandles) -> Self {
        Self { id, handles }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn status(&self) -> Result<JobStatus, ClientError> {
        let mut conn = self.handles.factory.provide_connection().await?;
        Ok(self
            .handles
            .metadata
            .get_job_status(conn.as_mut(), self.id)
            .await?)
    }

    /// Waits for the job to reach a terminal state.
    ///
    /// A failed job is reset and rerun while every task still has retry
    /// budget, so a job returns `Failed` only once some task exhausted its
    /// retries.
    pub async fn wait_complete(&self) -> Result<JobStatus, ClientError> {
        let mut conn = self.handles.factory.provide_connection().await?;
        loop {
            let status = self
                .handles
                .metadata
                .get_job_status(conn.as_mut(), self.id)
                .await?;
            match status {
                JobStatus::Running => tokio::time::sleep(POLL_INTERVAL).await,
                JobStatus::Failed => {
                    if self
                        .handles
                        .metadata
                        .reset_job(conn.as_mut(), self.id)
                        .await?
                    {
                        tracing::debug!(job_id = %self.id, "job failed with retry budget left, resetting");
                        continue;
                    }
                    return Ok(JobStatus::Failed);
                }
                status => return Ok(status),
            }
        }
    }

    /// Cancels the job: every unfinished task and the job itself move to
    /// the cancelled state.
    pub async fn cancel(&self) -> Result<(), ClientError> {
        let mut conn = self.handles.factory.provide_connection().await?;
        Ok(self
            .handles
            .metadata
            .cancel_job(conn.as_mut(), self.id)
            .await?)
    }

    /// Decodes the job result from its output tasks.
    ///
    /// Only meaningful for a job in the `Succeeded` state.
    pub async fn result<O: TaskOutputs>(&self) -> Result<O, ClientError> {
        let mut conn = self.handles.factory.provide_connection().await?;
        let output_tasks = self
            .handles
            .metadata
            .get_job_output_tasks(conn.as_mut(), self.id)
            .await?;
        let mut fragments = Vec::new();
        for task_id in output_tasks {
            let task = self
                .handles
                .metadata
                .get_task(conn.as_mut(), task_id)
                .await?;
            for output in &task.outputs {
                if let Some(value) = &output.value {
                    fragments.push(value.clone());
                } else if let Some(data_id) = output.data_id {
                    fragments.push(pack_value(&data_id)?);
                } else {
                    return Err(ClientError::Other(format!(
                        "output of task {task_id} is not filled"
                    )));
                }
            }
        }
        Ok(O::decode(&fragments)?)
    }

    /// The `(function_name, message)` pair recorded when the job was
    /// cancelled from a task or failed out of retries.
    pub async fn error(&self) -> Result<(String, String), ClientError> {
        let mut conn = self.handles.factory.provide_connection().await?;
        Ok(self
            .handles
            .metadata
            .get_job_message(conn.as_mut(), self.id)
            .await?)
    }
}
