//! Metadata-store semantics of the in-memory backend.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use spider_core::driver::{Driver, Scheduler};
use spider_core::error::StorageErr;
use spider_core::graph::TaskGraph;
use spider_core::job::{JobMetadata, JobStatus};
use spider_core::task::{ScheduleTaskMetadata, Task, TaskInstance, TaskOutput, TaskState};

use crate::batch::JobSubmissionBatch;
use crate::connection::StorageConnection;
use crate::memory::db::{DriverRow, InstanceRow, JobRow, LeaseRow, MemoryDb, SchedulerRow, TaskRow};
use crate::memory::lock;
use crate::metadata::MetadataStorage;

/// Scheduler leases older than this are stale and evicted on the next read.
const LEASE_EXPIRE_MS: i64 = 10;

/// Timeouts below this are treated as "no timeout".
const TIMEOUT_EPSILON: f32 = 0.0001;

/// Metadata store over [`MemoryDb`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryMetadataStorage;

fn no_job(id: Uuid) -> StorageErr {
    StorageErr::KeyNotFound(format!("no job with id {id}"))
}

fn no_task(id: Uuid) -> StorageErr {
    StorageErr::KeyNotFound(format!("no task with id {id}"))
}

fn instance_timed_out(
    timeout: f32,
    start_time: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    if timeout < TIMEOUT_EPSILON {
        return false;
    }
    let elapsed_ms = (now - start_time).num_milliseconds() as f64;
    elapsed_ms > f64::from(timeout) * 1000.0
}

/// Validates one submission without mutating anything.
fn check_job_insert(
    db: &MemoryDb,
    job_id: Uuid,
    graph: &TaskGraph,
) -> Result<Vec<Uuid>, StorageErr> {
    if db.jobs.contains_key(&job_id) {
        return Err(StorageErr::DuplicateKey(format!(
            "job {job_id} already exists"
        )));
    }
    let order = graph
        .topological_order()
        .ok_or_else(|| StorageErr::KeyNotFound("task graph inconsistent".to_string()))?;

    for task_id in &order {
        if db.tasks.contains_key(task_id) {
            return Err(StorageErr::DuplicateKey(format!(
                "task {task_id} already exists"
            )));
        }
        let task = graph
            .task(*task_id)
            .ok_or_else(|| no_task(*task_id))?;
        for input in &task.inputs {
            let Some((producer_id, position)) = input.output_source else {
                continue;
            };
            let producer = graph
                .task(producer_id)
                .ok_or_else(|| no_task(producer_id))?;
            let output = producer.outputs.get(usize::from(position)).ok_or_else(|| {
                StorageErr::KeyNotFound(format!(
                    "task {producer_id} has no output at position {position}"
                ))
            })?;
            if output.type_tag != input.type_tag {
                return Err(StorageErr::ConstraintViolation(format!(
                    "input type {} does not match producer output type {}",
                    input.type_tag, output.type_tag
                )));
            }
        }
    }
    for declared in graph.input_tasks().iter().chain(graph.output_tasks()) {
        if graph.task(*declared).is_none() {
            return Err(no_task(*declared));
        }
    }
    Ok(order)
}

/// Applies one validated submission.
fn insert_job(db: &mut MemoryDb, job_id: Uuid, client_id: Uuid, graph: &TaskGraph) {
    let order = match graph.topological_order() {
        Some(order) => order,
        None => return,
    };
    db.jobs.insert(
        job_id,
        JobRow {
            client_id,
            creation_time: Utc::now(),
            state: JobStatus::Running,
        },
    );
    let mut inserted = Vec::with_capacity(order.len());
    for task_id in order {
        let mut task = match graph.task(task_id) {
            Some(task) => task.clone(),
            None => continue,
        };
        task.state = if task.inputs.iter().all(|input| input.is_filled()) {
            TaskState::Ready
        } else {
            TaskState::Pending
        };
        task.retries = 0;
        db.tasks.insert(
            task_id,
            TaskRow {
                job_id,
                instance_id: None,
                task,
            },
        );
        inserted.push(task_id);
    }
    db.job_tasks.insert(job_id, inserted);
    db.dependencies.extend_from_slice(graph.dependencies());
    db.input_tasks.insert(job_id, graph.input_tasks().to_vec());
    db.output_tasks
        .insert(job_id, graph.output_tasks().to_vec());
}

fn schedule_metadata(db: &MemoryDb, task_id: Uuid, row: &TaskRow) -> ScheduleTaskMetadata {
    let mut meta = ScheduleTaskMetadata::new(task_id, row.task.function_name.clone(), row.job_id);
    if let Some(job) = db.jobs.get(&row.job_id) {
        meta.client_id = job.client_id;
        meta.job_creation_time = job.creation_time;
    }
    for input in &row.task.inputs {
        let Some(data_id) = input.data_id else {
            continue;
        };
        let Some(data) = db.data.get(&data_id) else {
            continue;
        };
        for addr in &data.localities {
            if data.hard_locality {
                meta.hard_localities.push(addr.clone());
            } else {
                meta.soft_localities.push(addr.clone());
            }
        }
    }
    meta
}

/// Cancels a job and every task of it that has not reached a terminal state.
fn cancel_job_tasks(db: &mut MemoryDb, job_id: Uuid) {
    if let Some(task_ids) = db.job_tasks.get(&job_id).cloned() {
        for task_id in task_ids {
            if let Some(row) = db.tasks.get_mut(&task_id) {
                if row.task.state.is_live() {
                    row.task.state = TaskState::Canceled;
                }
            }
        }
    }
    if let Some(job) = db.jobs.get_mut(&job_id) {
        job.state = JobStatus::Cancelled;
    }
}

#[async_trait]
impl MetadataStorage for MemoryMetadataStorage {
    async fn initialize(&self, conn: &mut dyn StorageConnection) -> Result<(), StorageErr> {
        lock(conn).map(|_| ())
    }

    async fn add_driver(
        &self,
        conn: &mut dyn StorageConnection,
        driver: &Driver,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        if db.drivers.contains_key(&driver.id) {
            return Err(StorageErr::DuplicateKey(format!(
                "driver {} already exists",
                driver.id
            )));
        }
        db.drivers.insert(
            driver.id,
            DriverRow {
                addr: driver.addr.clone(),
                heartbeat: Utc::now(),
            },
        );
        Ok(())
    }

    async fn remove_driver(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        db.remove_driver_cascade(id);
        Ok(())
    }

    async fn add_scheduler(
        &self,
        conn: &mut dyn StorageConnection,
        scheduler: &Scheduler,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        if db.schedulers.contains_key(&scheduler.id) {
            return Err(StorageErr::DuplicateKey(format!(
                "scheduler {} already exists",
                scheduler.id
            )));
        }
        db.drivers.entry(scheduler.id).or_insert_with(|| DriverRow {
            addr: scheduler.addr.clone(),
            heartbeat: Utc::now(),
        });
        db.schedulers.insert(
            scheduler.id,
            SchedulerRow {
                addr: scheduler.addr.clone(),
                port: scheduler.port,
            },
        );
        Ok(())
    }

    async fn get_active_scheduler(
        &self,
        conn: &mut dyn StorageConnection,
    ) -> Result<Vec<Scheduler>, StorageErr> {
        let db = lock(conn)?;
        Ok(db
            .schedulers
            .iter()
            .map(|(id, row)| Scheduler::new(*id, row.addr.clone(), row.port))
            .collect())
    }

    async fn get_scheduler_addr(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<(String, u16), StorageErr> {
        let db = lock(conn)?;
        db.schedulers
            .get(&id)
            .map(|row| (row.addr.clone(), row.port))
            .ok_or_else(|| StorageErr::KeyNotFound(format!("no scheduler with id {id}")))
    }

    async fn add_job(
        &self,
        conn: &mut dyn StorageConnection,
        job_id: Uuid,
        client_id: Uuid,
        graph: &TaskGraph,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        check_job_insert(&db, job_id, graph)?;
        insert_job(&mut db, job_id, client_id, graph);
        Ok(())
    }

    async fn add_job_batch(
        &self,
        _conn: &mut dyn StorageConnection,
        batch: &mut JobSubmissionBatch,
        job_id: Uuid,
        client_id: Uuid,
        graph: &TaskGraph,
    ) -> Result<(), StorageErr> {
        batch.push(job_id, client_id, graph.clone());
        Ok(())
    }

    async fn submit_batch(
        &self,
        conn: &mut dyn StorageConnection,
        batch: &mut JobSubmissionBatch,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        let entries = batch.drain();
        for entry in &entries {
            check_job_insert(&db, entry.job_id, &entry.graph)?;
        }
        for entry in &entries {
            insert_job(&mut db, entry.job_id, entry.client_id, &entry.graph);
        }
        Ok(())
    }

    async fn get_job_metadata(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<JobMetadata, StorageErr> {
        let db = lock(conn)?;
        db.jobs
            .get(&id)
            .map(|row| JobMetadata {
                id,
                client_id: row.client_id,
                creation_time: row.creation_time,
            })
            .ok_or_else(|| no_job(id))
    }

    async fn get_job_complete(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<bool, StorageErr> {
        let db = lock(conn)?;
        let job = db.jobs.get(&id).ok_or_else(|| no_job(id))?;
        Ok(job.state.is_terminal())
    }

    async fn get_job_status(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<JobStatus, StorageErr> {
        let db = lock(conn)?;
        db.jobs
            .get(&id)
            .map(|row| row.state)
            .ok_or_else(|| no_job(id))
    }

    async fn get_job_output_tasks(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<Vec<Uuid>, StorageErr> {
        let db = lock(conn)?;
        db.output_tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| no_job(id))
    }

    async fn get_task_graph(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<TaskGraph, StorageErr> {
        let db = lock(conn)?;
        let task_ids = db.job_tasks.get(&id).ok_or_else(|| no_job(id))?;
        let mut graph = TaskGraph::new();
        let id_set: HashSet<Uuid> = task_ids.iter().copied().collect();
        for task_id in task_ids {
            let row = db.tasks.get(task_id).ok_or_else(|| no_task(*task_id))?;
            graph.add_task(row.task.clone());
        }
        for (parent, child) in &db.dependencies {
            if id_set.contains(parent) && id_set.contains(child) {
                graph.add_dependency(*parent, *child);
            }
        }
        for task_id in db.input_tasks.get(&id).into_iter().flatten() {
            graph.add_input_task(*task_id);
        }
        for task_id in db.output_tasks.get(&id).into_iter().flatten() {
            graph.add_output_task(*task_id);
        }
        Ok(graph)
    }

    async fn get_jobs_by_client_id(
        &self,
        conn: &mut dyn StorageConnection,
        client_id: Uuid,
    ) -> Result<Vec<Uuid>, StorageErr> {
        let db = lock(conn)?;
        Ok(db
            .jobs
            .iter()
            .filter(|(_, row)| row.client_id == client_id)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn cancel_job(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        if !db.jobs.contains_key(&id) {
            return Err(no_job(id));
        }
        cancel_job_tasks(&mut db, id);
        Ok(())
    }

    async fn cancel_job_by_task(
        &self,
        conn: &mut dyn StorageConnection,
        task_id: Uuid,
        message: &str,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        let (job_id, function_name) = {
            let row = db.tasks.get(&task_id).ok_or_else(|| no_task(task_id))?;
            (row.job_id, row.task.function_name.clone())
        };
        cancel_job_tasks(&mut db, job_id);
        db.job_errors
            .entry(job_id)
            .or_default()
            .push((function_name, message.to_string()));
        Ok(())
    }

    async fn get_job_message(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<(String, String), StorageErr> {
        let db = lock(conn)?;
        db.job_errors
            .get(&id)
            .and_then(|rows| rows.first())
            .cloned()
            .ok_or_else(|| StorageErr::KeyNotFound("no messages found".to_string()))
    }

    async fn remove_job(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        db.jobs.remove(&id);
        let task_ids = db.job_tasks.remove(&id).unwrap_or_default();
        let id_set: HashSet<Uuid> = task_ids.iter().copied().collect();
        for task_id in &task_ids {
            db.tasks.remove(task_id);
            db.scheduler_leases.remove(task_id);
        }
        db.task_instances
            .retain(|_, instance| !id_set.contains(&instance.task_id));
        db.dependencies
            .retain(|(parent, child)| !id_set.contains(parent) && !id_set.contains(child));
        db.input_tasks.remove(&id);
        db.output_tasks.remove(&id);
        db.job_errors.remove(&id);
        Ok(())
    }

    async fn reset_job(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<bool, StorageErr> {
        let mut db = lock(conn)?;
        let task_ids = db.job_tasks.get(&id).cloned().ok_or_else(|| no_job(id))?;
        for task_id in &task_ids {
            let row = db.tasks.get(task_id).ok_or_else(|| no_task(*task_id))?;
            if row.task.retries >= row.task.max_retries {
                return Ok(false);
            }
        }
        let id_set: HashSet<Uuid> = task_ids.iter().copied().collect();
        db.task_instances
            .retain(|_, instance| !id_set.contains(&instance.task_id));
        db.scheduler_leases.retain(|task_id, _| !id_set.contains(task_id));
        for task_id in &task_ids {
            if let Some(row) = db.tasks.get_mut(task_id) {
                row.task.retries += 1;
                row.instance_id = None;
                let wired = row
                    .task
                    .inputs
                    .iter()
                    .any(|input| input.output_source.is_some());
                row.task.state = if wired {
                    TaskState::Pending
                } else {
                    TaskState::Ready
                };
                for input in &mut row.task.inputs {
                    if input.output_source.is_some() {
                        input.value = None;
                        input.data_id = None;
                    }
                }
                for output in &mut row.task.outputs {
                    output.value = None;
                    output.data_id = None;
                }
            }
        }
        if let Some(job) = db.jobs.get_mut(&id) {
            job.state = JobStatus::Running;
        }
        Ok(true)
    }

    async fn add_child(
        &self,
        conn: &mut dyn StorageConnection,
        parent_id: Uuid,
        child: &Task,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        let job_id = db
            .tasks
            .get(&parent_id)
            .map(|row| row.job_id)
            .ok_or_else(|| no_task(parent_id))?;
        if db.tasks.contains_key(&child.id) {
            return Err(StorageErr::DuplicateKey(format!(
                "task {} already exists",
                child.id
            )));
        }
        let mut task = child.clone();
        task.state = if task.inputs.iter().all(|input| input.is_filled()) {
            TaskState::Ready
        } else {
            TaskState::Pending
        };
        let child_id = task.id;
        db.tasks.insert(
            child_id,
            TaskRow {
                job_id,
                instance_id: None,
                task,
            },
        );
        db.job_tasks.entry(job_id).or_default().push(child_id);
        db.dependencies.push((parent_id, child_id));
        Ok(())
    }

    async fn get_task(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<Task, StorageErr> {
        let db = lock(conn)?;
        db.tasks
            .get(&id)
            .map(|row| row.task.clone())
            .ok_or_else(|| no_task(id))
    }

    async fn get_task_job_id(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<Uuid, StorageErr> {
        let db = lock(conn)?;
        db.tasks
            .get(&id)
            .map(|row| row.job_id)
            .ok_or_else(|| no_task(id))
    }

    async fn get_task_state(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<TaskState, StorageErr> {
        let db = lock(conn)?;
        db.tasks
            .get(&id)
            .map(|row| row.task.state)
            .ok_or_else(|| no_task(id))
    }

    async fn get_ready_tasks(
        &self,
        conn: &mut dyn StorageConnection,
        scheduler_id: Uuid,
    ) -> Result<Vec<ScheduleTaskMetadata>, StorageErr> {
        let mut db = lock(conn)?;
        let now = Utc::now();
        db.scheduler_leases
            .retain(|_, lease| (now - lease.lease_time).num_milliseconds() <= LEASE_EXPIRE_MS);

        let candidates: Vec<Uuid> = db
            .tasks
            .iter()
            .filter(|(task_id, row)| {
                row.task.state == TaskState::Ready
                    && db
                        .jobs
                        .get(&row.job_id)
                        .is_some_and(|job| job.state == JobStatus::Running)
                    && !db.scheduler_leases.contains_key(task_id)
            })
            .map(|(task_id, _)| *task_id)
            .collect();

        let mut tasks = Vec::with_capacity(candidates.len());
        for task_id in candidates {
            if let Some(row) = db.tasks.get(&task_id) {
                tasks.push(schedule_metadata(&db, task_id, row));
            }
        }
        for meta in &tasks {
            db.scheduler_leases.insert(
                meta.id,
                LeaseRow {
                    scheduler_id,
                    lease_time: now,
                },
            );
        }
        Ok(tasks)
    }

    async fn set_task_state(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
        state: TaskState,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        let row = db.tasks.get_mut(&id).ok_or_else(|| no_task(id))?;
        row.task.state = state;
        Ok(())
    }

    async fn set_task_running(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        let row = db.tasks.get_mut(&id).ok_or_else(|| no_task(id))?;
        if row.task.state != TaskState::Ready {
            return Err(StorageErr::KeyNotFound("task not ready".to_string()));
        }
        row.task.state = TaskState::Running;
        Ok(())
    }

    async fn add_task_instance(
        &self,
        conn: &mut dyn StorageConnection,
        instance: &TaskInstance,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        if db.task_instances.contains_key(&instance.id) {
            return Err(StorageErr::DuplicateKey(format!(
                "task instance {} already exists",
                instance.id
            )));
        }
        db.task_instances.insert(
            instance.id,
            InstanceRow {
                task_id: instance.task_id,
                start_time: Utc::now(),
            },
        );
        Ok(())
    }

    async fn create_task_instance(
        &self,
        conn: &mut dyn StorageConnection,
        instance: &TaskInstance,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        let now = Utc::now();
        let (job_id, task_ready, timeout) = {
            let row = db
                .tasks
                .get(&instance.task_id)
                .ok_or_else(|| no_task(instance.task_id))?;
            (
                row.job_id,
                row.task.state == TaskState::Ready,
                row.task.timeout,
            )
        };
        let all_timed_out = !db.task_instances.values().any(|row| {
            row.task_id == instance.task_id && !instance_timed_out(timeout, row.start_time, now)
        });
        if !task_ready && !all_timed_out {
            return Err(StorageErr::Other(
                "task not ready or timed out".to_string(),
            ));
        }
        let job = db.jobs.get(&job_id).ok_or_else(|| no_job(job_id))?;
        if job.state != JobStatus::Running {
            return Err(StorageErr::Other("job state wrong".to_string()));
        }
        if db.task_instances.contains_key(&instance.id) {
            return Err(StorageErr::DuplicateKey(format!(
                "task instance {} already exists",
                instance.id
            )));
        }
        if let Some(row) = db.tasks.get_mut(&instance.task_id) {
            row.task.state = TaskState::Running;
        }
        db.task_instances.insert(
            instance.id,
            InstanceRow {
                task_id: instance.task_id,
                start_time: now,
            },
        );
        db.scheduler_leases.remove(&instance.task_id);
        Ok(())
    }

    async fn task_finish(
        &self,
        conn: &mut dyn StorageConnection,
        instance: &TaskInstance,
        outputs: &[TaskOutput],
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        let job_id = {
            let row = db
                .tasks
                .get_mut(&instance.task_id)
                .ok_or_else(|| no_task(instance.task_id))?;
            // At-most-once binding: only the first finish of a running,
            // unbound task mutates anything.
            if row.task.state != TaskState::Running || row.instance_id.is_some() {
                return Ok(());
            }
            row.instance_id = Some(instance.id);
            row.task.state = TaskState::Succeed;
            let slots = row.task.outputs.len().min(outputs.len());
            for (slot, output) in row.task.outputs.iter_mut().zip(outputs.iter()).take(slots) {
                slot.value = output.value.clone();
                slot.data_id = output.data_id;
            }
            row.job_id
        };

        // Propagate the finished outputs to every downstream input wired to
        // this task, then promote tasks whose last null input just filled.
        let downstream: Vec<Uuid> = db.tasks.keys().copied().collect();
        for task_id in downstream {
            let Some(row) = db.tasks.get_mut(&task_id) else {
                continue;
            };
            let mut touched = false;
            for input in &mut row.task.inputs {
                let Some((producer, position)) = input.output_source else {
                    continue;
                };
                if producer != instance.task_id {
                    continue;
                }
                let Some(output) = outputs.get(usize::from(position)) else {
                    continue;
                };
                input.value = output.value.clone();
                input.data_id = output.data_id;
                touched = true;
            }
            if touched
                && row.task.state == TaskState::Pending
                && row.task.inputs.iter().all(|input| input.is_filled())
            {
                row.task.state = TaskState::Ready;
            }
        }

        let all_succeeded = db
            .job_tasks
            .get(&job_id)
            .is_some_and(|task_ids| {
                task_ids.iter().all(|task_id| {
                    db.tasks
                        .get(task_id)
                        .is_some_and(|row| row.task.state == TaskState::Succeed)
                })
            });
        if all_succeeded {
            if let Some(job) = db.jobs.get_mut(&job_id) {
                if job.state == JobStatus::Running {
                    job.state = JobStatus::Succeeded;
                }
            }
        }
        Ok(())
    }

    async fn task_fail(
        &self,
        conn: &mut dyn StorageConnection,
        instance: &TaskInstance,
        message: &str,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        db.task_instances.remove(&instance.id);
        let remaining = db
            .task_instances
            .values()
            .filter(|row| row.task_id == instance.task_id)
            .count();
        if remaining > 0 {
            // Another attempt is still running; let it race to finish.
            return Ok(());
        }
        let (job_id, function_name) = {
            let Some(row) = db.tasks.get_mut(&instance.task_id) else {
                return Ok(());
            };
            if row.task.state != TaskState::Running {
                return Ok(());
            }
            row.task.state = TaskState::Failed;
            (row.job_id, row.task.function_name.clone())
        };
        if let Some(job) = db.jobs.get_mut(&job_id) {
            job.state = JobStatus::Failed;
        }
        db.job_errors
            .entry(job_id)
            .or_default()
            .push((function_name, message.to_string()));
        Ok(())
    }

    async fn get_task_timeout(
        &self,
        conn: &mut dyn StorageConnection,
    ) -> Result<Vec<ScheduleTaskMetadata>, StorageErr> {
        let db = lock(conn)?;
        let now = Utc::now();
        let mut tasks = Vec::new();
        for (task_id, row) in &db.tasks {
            if row.task.state != TaskState::Running || row.task.timeout < TIMEOUT_EPSILON {
                continue;
            }
            let instances: Vec<&InstanceRow> = db
                .task_instances
                .values()
                .filter(|instance| instance.task_id == *task_id)
                .collect();
            if instances.is_empty() {
                continue;
            }
            if instances
                .iter()
                .all(|instance| instance_timed_out(row.task.timeout, instance.start_time, now))
            {
                tasks.push(schedule_metadata(&db, *task_id, row));
            }
        }
        Ok(tasks)
    }

    async fn get_child_tasks(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<Vec<Task>, StorageErr> {
        let db = lock(conn)?;
        let mut children = Vec::new();
        for (parent, child) in &db.dependencies {
            if *parent == id {
                let row = db.tasks.get(child).ok_or_else(|| no_task(*child))?;
                children.push(row.task.clone());
            }
        }
        Ok(children)
    }

    async fn get_parent_tasks(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<Vec<Task>, StorageErr> {
        let db = lock(conn)?;
        let mut parents = Vec::new();
        for (parent, child) in &db.dependencies {
            if *child == id {
                let row = db.tasks.get(parent).ok_or_else(|| no_task(*parent))?;
                parents.push(row.task.clone());
            }
        }
        Ok(parents)
    }

    async fn update_heartbeat(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        let row = db
            .drivers
            .get_mut(&id)
            .ok_or_else(|| StorageErr::KeyNotFound(format!("no driver with id {id}")))?;
        row.heartbeat = Utc::now();
        Ok(())
    }

    async fn heartbeat_timeout(
        &self,
        conn: &mut dyn StorageConnection,
        timeout: Duration,
    ) -> Result<Vec<Uuid>, StorageErr> {
        let mut db = lock(conn)?;
        let now = Utc::now();
        let timeout_ms = timeout.as_millis() as i64;
        let expired: Vec<Uuid> = db
            .drivers
            .iter()
            .filter(|(_, row)| (now - row.heartbeat).num_milliseconds() > timeout_ms)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            db.remove_driver_cascade(*id);
        }
        Ok(expired)
    }
}
