//! Job metadata and terminal states.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Terminal and in-flight states of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        self != JobStatus::Running
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobMetadata {
    pub id: Uuid,
    pub client_id: Uuid,
    pub creation_time: DateTime<Utc>,
}
