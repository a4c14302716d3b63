//! Table definitions of the in-memory backend.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use spider_core::data::Data;
use spider_core::job::JobStatus;
use spider_core::task::Task;

#[derive(Debug, Clone)]
pub(crate) struct DriverRow {
    pub(crate) addr: String,
    pub(crate) heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub(crate) struct SchedulerRow {
    pub(crate) addr: String,
    pub(crate) port: u16,
}

#[derive(Debug, Clone)]
pub(crate) struct JobRow {
    pub(crate) client_id: Uuid,
    pub(crate) creation_time: DateTime<Utc>,
    pub(crate) state: JobStatus,
}

#[derive(Debug, Clone)]
pub(crate) struct TaskRow {
    pub(crate) job_id: Uuid,
    /// The instance that satisfied this task, pinned on the first finish.
    pub(crate) instance_id: Option<Uuid>,
    pub(crate) task: Task,
}

#[derive(Debug, Clone)]
pub(crate) struct InstanceRow {
    pub(crate) task_id: Uuid,
    pub(crate) start_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub(crate) struct LeaseRow {
    pub(crate) scheduler_id: Uuid,
    pub(crate) lease_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub(crate) struct MemoryDb {
    pub(crate) drivers: HashMap<Uuid, DriverRow>,
    pub(crate) schedulers: HashMap<Uuid, SchedulerRow>,
    pub(crate) jobs: HashMap<Uuid, JobRow>,
    pub(crate) tasks: HashMap<Uuid, TaskRow>,
    /// Per-job task ids in insertion (topological) order.
    pub(crate) job_tasks: HashMap<Uuid, Vec<Uuid>>,
    pub(crate) dependencies: Vec<(Uuid, Uuid)>,
    pub(crate) input_tasks: HashMap<Uuid, Vec<Uuid>>,
    pub(crate) output_tasks: HashMap<Uuid, Vec<Uuid>>,
    /// Keyed by instance id.
    pub(crate) task_instances: HashMap<Uuid, InstanceRow>,
    /// Keyed by task id: at most one lease per task.
    pub(crate) scheduler_leases: HashMap<Uuid, LeaseRow>,
    /// Per-job `(function_name, message)` rows, first row wins on read.
    pub(crate) job_errors: HashMap<Uuid, Vec<(String, String)>>,
    pub(crate) data: HashMap<Uuid, Data>,
    /// `(data_id, driver_id)`.
    pub(crate) driver_refs: HashSet<(Uuid, Uuid)>,
    /// `(data_id, task_id)`.
    pub(crate) task_refs: HashSet<(Uuid, Uuid)>,
    pub(crate) client_kv: HashMap<(Uuid, String), String>,
    pub(crate) task_kv: HashMap<(Uuid, String), String>,
}

impl MemoryDb {
    /// Removes a driver row and everything hanging off it: the scheduler
    /// registered under the same id, that scheduler's leases, and the
    /// driver's data references and key-value rows.
    pub(crate) fn remove_driver_cascade(&mut self, id: Uuid) {
        self.drivers.remove(&id);
        if self.schedulers.remove(&id).is_some() {
            self.scheduler_leases
                .retain(|_, lease| lease.scheduler_id != id);
        }
        self.driver_refs.retain(|(_, driver_id)| *driver_id != id);
        self.client_kv.retain(|(owner, _), _| *owner != id);
    }
}
