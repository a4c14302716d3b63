//! Wire messages of the lease protocol.
//!
//! Messages are serialized as msgpack arrays and framed with the ext
//! envelope from `spider_core::net`. Uuids travel as 16-byte binaries.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Completion report of a previously dispatched task, piggybacked on the
/// next poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub task_id: Uuid,
    pub instance_id: Uuid,
}

/// Worker poll for the next task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTaskRequest {
    pub worker_id: Uuid,
    pub worker_addr: String,
    pub completion: Option<TaskCompletion>,
}

/// Scheduler reply; no task id means nothing is dispatchable right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTaskResponse {
    pub task_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let request = ScheduleTaskRequest {
            worker_id: Uuid::new_v4(),
            worker_addr: "10.0.0.7".to_string(),
            completion: Some(TaskCompletion {
                task_id: Uuid::new_v4(),
                instance_id: Uuid::new_v4(),
            }),
        };
        let bytes = rmp_serde::to_vec(&request).unwrap();
        let decoded: ScheduleTaskRequest = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn empty_response_round_trips() {
        let response = ScheduleTaskResponse { task_id: None };
        let bytes = rmp_serde::to_vec(&response).unwrap();
        let decoded: ScheduleTaskResponse = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, response);
    }
}
