//! The worker main loop: register, heartbeat, poll, execute, report.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use spider_core::data::DATA_TAG;
use spider_core::driver::Driver;
use spider_core::envelope::{pack_value, unpack_value};
use spider_core::stop::StopToken;
use spider_core::task::{Task, TaskInstance, TaskOutput, TaskState};

use spider_scheduler::message::TaskCompletion;
use spider_storage::{MetadataStorage, StorageConnection, StorageFactory};

use crate::error::WorkerError;
use crate::executor::{ExecutorOutcome, ExecutorSpec, TaskExecutor};
use crate::scheduler_client::SchedulerClient;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const HEARTBEAT_FAIL_LIMIT: u32 = 5;

/// Pause between polls when the scheduler has nothing for us.
const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Pause before rediscovering a scheduler after a connection failure.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How often a running task's state is checked for cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Address this worker advertises for locality matching.
    pub worker_addr: String,
    /// Storage url handed to every executor child.
    pub storage_url: String,
    /// Task libraries handed to every executor child.
    pub libs: Vec<String>,
    /// Path of the `spider_task_executor` binary.
    pub executor_path: PathBuf,
}

/// Runs the worker until a stop is requested.
pub async fn run_worker(
    config: WorkerConfig,
    factory: Arc<dyn StorageFactory>,
    stop: Arc<StopToken>,
) -> Result<(), WorkerError> {
    let metadata = factory.provide_metadata_storage();
    let worker_id = Uuid::new_v4();

    let mut conn = factory.provide_connection().await?;
    metadata.initialize(conn.as_mut()).await?;
    metadata
        .add_driver(
            conn.as_mut(),
            &Driver::new(worker_id, config.worker_addr.clone()),
        )
        .await?;
    tracing::info!(%worker_id, addr = %config.worker_addr, "worker registered");

    let heartbeat = tokio::spawn(heartbeat_loop(
        factory.clone(),
        metadata.clone(),
        worker_id,
        stop.clone(),
    ));

    let result = poll_loop(&config, metadata.as_ref(), conn.as_mut(), worker_id, &stop).await;

    stop.request_stop();
    let _ = heartbeat.await;
    result
}

async fn poll_loop(
    config: &WorkerConfig,
    metadata: &dyn MetadataStorage,
    conn: &mut dyn StorageConnection,
    worker_id: Uuid,
    stop: &StopToken,
) -> Result<(), WorkerError> {
    let mut completion: Option<TaskCompletion> = None;
    while !stop.stop_requested() {
        let schedulers = match metadata.get_active_scheduler(conn).await {
            Ok(schedulers) => schedulers,
            Err(err) => {
                tracing::warn!(%err, "cannot look up active schedulers");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        let Some(scheduler) = schedulers.first() else {
            tracing::debug!("no active scheduler, retrying");
            tokio::time::sleep(RECONNECT_DELAY).await;
            continue;
        };

        let mut client = match SchedulerClient::connect(
            &scheduler.addr,
            scheduler.port,
            worker_id,
            config.worker_addr.clone(),
        )
        .await
        {
            Ok(client) => client,
            Err(err) => {
                tracing::warn!(%err, scheduler_id = %scheduler.id, "cannot connect to scheduler");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        tracing::info!(scheduler_id = %scheduler.id, addr = %scheduler.addr, "connected to scheduler");

        while !stop.stop_requested() {
            match client.request_task(completion.take()).await {
                Ok(Some(task_id)) => {
                    completion = run_task(config, metadata, conn, task_id).await?;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = stop.wait() => {}
                        _ = tokio::time::sleep(IDLE_SLEEP) => {}
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "scheduler connection lost, rediscovering");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Runs one dispatched task to its terminal state and reports it to the
/// store. Returns the completion to piggyback on the next poll.
async fn run_task(
    config: &WorkerConfig,
    metadata: &dyn MetadataStorage,
    conn: &mut dyn StorageConnection,
    task_id: Uuid,
) -> Result<Option<TaskCompletion>, WorkerError> {
    let task = match metadata.get_task(conn, task_id).await {
        Ok(task) => task,
        Err(err) => {
            tracing::warn!(%err, %task_id, "dispatched task is gone");
            return Ok(None);
        }
    };

    let instance = TaskInstance::new(task_id);
    if let Err(err) = metadata.create_task_instance(conn, &instance).await {
        // Another scheduler or worker won the task in the meantime.
        tracing::debug!(%err, %task_id, "cannot create task instance");
        return Ok(None);
    }

    let args = match argument_buffers(&task) {
        Ok(args) => args,
        Err(message) => {
            tracing::error!(%task_id, %message, "task arguments are incomplete");
            metadata.task_fail(conn, &instance, &message).await?;
            return Ok(None);
        }
    };

    let spec = ExecutorSpec {
        executable: config.executor_path.clone(),
        function_name: task.function_name.clone(),
        task_id,
        storage_url: config.storage_url.clone(),
        libs: config.libs.clone(),
        args,
    };
    let (executor, cancel) = match TaskExecutor::spawn(spec).await {
        Ok(pair) => pair,
        Err(err) => {
            tracing::error!(%err, %task_id, "cannot spawn task executor");
            metadata
                .task_fail(conn, &instance, &err.to_string())
                .await?;
            return Ok(None);
        }
    };
    tracing::debug!(%task_id, function = %task.function_name, "task instance started");

    // Watch for user cancellation while the child runs.
    let mut supervisor_cancelled = false;
    let wait = executor.wait();
    tokio::pin!(wait);
    let mut poll = tokio::time::interval(CANCEL_POLL_INTERVAL);
    poll.tick().await;
    let outcome = loop {
        tokio::select! {
            outcome = &mut wait => break outcome,
            _ = poll.tick() => {
                if supervisor_cancelled {
                    continue;
                }
                if let Ok(TaskState::Canceled) = metadata.get_task_state(conn, task_id).await {
                    tracing::info!(%task_id, "task cancelled under us, terminating executor");
                    cancel.cancel();
                    supervisor_cancelled = true;
                }
            }
        }
    };

    match outcome {
        ExecutorOutcome::Succeed(fragments) => {
            let outputs = match result_outputs(&task, &fragments) {
                Ok(outputs) => outputs,
                Err(message) => {
                    tracing::error!(%task_id, %message, "cannot map executor results");
                    metadata.task_fail(conn, &instance, &message).await?;
                    return Ok(None);
                }
            };
            metadata.task_finish(conn, &instance, &outputs).await?;
            tracing::info!(%task_id, "task instance succeeded");
            Ok(Some(TaskCompletion {
                task_id,
                instance_id: instance.id,
            }))
        }
        ExecutorOutcome::Error(code, message) => {
            tracing::warn!(%task_id, ?code, %message, "task instance failed");
            metadata.task_fail(conn, &instance, &message).await?;
            Ok(None)
        }
        ExecutorOutcome::Cancelled(message) => {
            tracing::info!(%task_id, %message, "task instance cancelled");
            if !supervisor_cancelled {
                // The task aborted itself; cancel its whole job with the
                // abort message before releasing the instance.
                if let Err(err) = metadata.cancel_job_by_task(conn, task_id, &message).await {
                    tracing::warn!(%err, %task_id, "cannot cancel job for aborted task");
                }
            }
            metadata.task_fail(conn, &instance, &message).await?;
            Ok(None)
        }
    }
}

/// Builds the positional argument fragments from the task's inputs.
fn argument_buffers(task: &Task) -> Result<Vec<Vec<u8>>, String> {
    let mut args = Vec::with_capacity(task.inputs.len());
    for (position, input) in task.inputs.iter().enumerate() {
        if let Some(value) = &input.value {
            args.push(value.clone());
        } else if let Some(data_id) = input.data_id {
            args.push(
                pack_value(&data_id)
                    .map_err(|err| format!("cannot encode data id at position {position}: {err}"))?,
            );
        } else {
            return Err(format!("input at position {position} has no value"));
        }
    }
    Ok(args)
}

/// Maps result fragments back onto the task's declared outputs.
fn result_outputs(task: &Task, fragments: &[Vec<u8>]) -> Result<Vec<TaskOutput>, String> {
    if fragments.len() != task.outputs.len() {
        return Err(format!(
            "executor returned {} results for {} outputs",
            fragments.len(),
            task.outputs.len()
        ));
    }
    let mut outputs = Vec::with_capacity(fragments.len());
    for (slot, fragment) in task.outputs.iter().zip(fragments) {
        if slot.type_tag == DATA_TAG {
            let data_id: Uuid = unpack_value(fragment)
                .map_err(|err| format!("cannot decode data id result: {err}"))?;
            outputs.push(TaskOutput::with_data_id(data_id, slot.type_tag.clone()));
        } else {
            outputs.push(TaskOutput::with_value(
                fragment.clone(),
                slot.type_tag.clone(),
            ));
        }
    }
    Ok(outputs)
}

async fn heartbeat_loop(
    factory: Arc<dyn StorageFactory>,
    metadata: Arc<dyn MetadataStorage>,
    worker_id: Uuid,
    stop: Arc<StopToken>,
) {
    let mut fail_count = 0u32;
    while !stop.stop_requested() {
        tokio::select! {
            _ = stop.wait() => break,
            _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
        }
        let result = match factory.provide_connection().await {
            Ok(mut conn) => metadata.update_heartbeat(conn.as_mut(), worker_id).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => fail_count = 0,
            Err(err) => {
                tracing::error!(%err, "failed to update worker heartbeat");
                fail_count += 1;
                if fail_count >= HEARTBEAT_FAIL_LIMIT {
                    stop.request_stop();
                    break;
                }
            }
        }
    }
}
