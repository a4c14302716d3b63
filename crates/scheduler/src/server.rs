//! The TCP scheduler server.

use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use spider_core::net::{receive_message, send_message};
use spider_core::stop::StopToken;
use spider_core::task::TaskInstance;

use spider_storage::{MetadataStorage, StorageFactory};

use crate::message::{ScheduleTaskRequest, ScheduleTaskResponse};
use crate::policy::SchedulerPolicy;

/// Accepts worker connections and answers lease-protocol polls.
///
/// Each connection is served by its own cooperative task; the handler
/// loops one request/response at a time until the worker hangs up.
pub struct SchedulerServer {
    listener: TcpListener,
    state: Arc<ServerState>,
    stop: Arc<StopToken>,
}

struct ServerState {
    factory: Arc<dyn StorageFactory>,
    metadata: Arc<dyn MetadataStorage>,
    policy: Mutex<Box<dyn SchedulerPolicy>>,
}

impl SchedulerServer {
    pub fn new(
        listener: TcpListener,
        factory: Arc<dyn StorageFactory>,
        metadata: Arc<dyn MetadataStorage>,
        policy: Box<dyn SchedulerPolicy>,
        stop: Arc<StopToken>,
    ) -> Self {
        Self {
            listener,
            state: Arc::new(ServerState {
                factory,
                metadata,
                policy: Mutex::new(policy),
            }),
            stop,
        }
    }

    /// Runs the acceptor until a stop is requested.
    pub async fn run(self) {
        loop {
            tokio::select! {
                _ = self.stop.wait() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "worker connected");
                            tokio::spawn(handle_connection(stream, self.state.clone()));
                        }
                        Err(err) => {
                            tracing::error!(%err, "cannot accept connection");
                        }
                    }
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) {
    let (mut reader, mut writer) = stream.into_split();
    let mut conn = match state.factory.provide_connection().await {
        Ok(conn) => conn,
        Err(err) => {
            tracing::error!(%err, "cannot open storage connection for worker");
            return;
        }
    };

    loop {
        let payload = match receive_message(&mut reader).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return,
            Err(err) => {
                tracing::error!(%err, "cannot receive message from worker");
                return;
            }
        };
        let request: ScheduleTaskRequest = match rmp_serde::from_slice(&payload) {
            Ok(request) => request,
            Err(err) => {
                tracing::error!(%err, "cannot parse schedule task request");
                return;
            }
        };

        if !process_request(&state, conn.as_mut(), &request, &mut writer).await {
            return;
        }
    }
}

/// Handles one request; returns false when the connection should close.
async fn process_request(
    state: &ServerState,
    conn: &mut dyn spider_storage::StorageConnection,
    request: &ScheduleTaskRequest,
    writer: &mut OwnedWriteHalf,
) -> bool {
    if let Some(completion) = &request.completion {
        // Outputs were written to storage by the worker already; this
        // finish is the idempotent completion report.
        let instance = TaskInstance::with_id(completion.instance_id, completion.task_id);
        if let Err(err) = state.metadata.task_finish(conn, &instance, &[]).await {
            tracing::error!(%err, task_id = %completion.task_id, "cannot record task completion");
        }
    }

    let task_id = {
        let mut policy = state.policy.lock().await;
        match policy
            .schedule_next(request.worker_id, &request.worker_addr)
            .await
        {
            Ok(task_id) => task_id,
            Err(err) => {
                tracing::error!(%err, "schedule_next failed");
                None
            }
        }
    };

    let response = ScheduleTaskResponse { task_id };
    let payload = match rmp_serde::to_vec(&response) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(%err, "cannot serialize schedule task response");
            return false;
        }
    };
    if let Err(err) = send_message(writer, &payload).await {
        tracing::error!(
            %err,
            worker_id = %request.worker_id,
            worker_addr = %request.worker_addr,
            "cannot send message to worker"
        );
        return false;
    }
    true
}
