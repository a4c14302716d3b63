//! TCP client of the scheduler lease protocol.

use tokio::net::TcpStream;
use uuid::Uuid;

use spider_core::net::{receive_message, send_message};

use spider_scheduler::message::{ScheduleTaskRequest, ScheduleTaskResponse, TaskCompletion};

use crate::error::WorkerError;

/// One persistent connection to a scheduler.
pub struct SchedulerClient {
    stream: TcpStream,
    worker_id: Uuid,
    worker_addr: String,
}

impl SchedulerClient {
    pub async fn connect(
        addr: &str,
        port: u16,
        worker_id: Uuid,
        worker_addr: String,
    ) -> Result<Self, WorkerError> {
        let stream = TcpStream::connect((addr, port)).await?;
        Ok(Self {
            stream,
            worker_id,
            worker_addr,
        })
    }

    /// Polls for the next task, optionally reporting the completion of the
    /// previously dispatched one.
    pub async fn request_task(
        &mut self,
        completion: Option<TaskCompletion>,
    ) -> Result<Option<Uuid>, WorkerError> {
        let request = ScheduleTaskRequest {
            worker_id: self.worker_id,
            worker_addr: self.worker_addr.clone(),
            completion,
        };
        let payload = rmp_serde::to_vec(&request)
            .map_err(|err| WorkerError::Protocol(format!("cannot serialize request: {err}")))?;
        send_message(&mut self.stream, &payload).await?;

        let payload = receive_message(&mut self.stream)
            .await?
            .ok_or_else(|| WorkerError::Protocol("scheduler closed the connection".to_string()))?;
        let response: ScheduleTaskResponse = rmp_serde::from_slice(&payload)
            .map_err(|err| WorkerError::Protocol(format!("cannot parse response: {err}")))?;
        Ok(response.task_id)
    }
}
