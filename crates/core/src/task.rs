//! Tasks, task inputs/outputs, and execution attempts.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Lifecycle states of a task within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeed,
    Failed,
    Canceled,
}

impl TaskState {
    /// Whether the task can still make progress.
    pub fn is_live(self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Ready | TaskState::Running)
    }
}

/// Implementation language of a task function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskLanguage {
    #[default]
    Native,
    Python,
}

/// One input slot of a task.
///
/// An input draws its value from exactly one source: the output of a
/// producer task (filled when the producer finishes), a literal value set
/// at submission, or a stored datum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInput {
    pub type_tag: String,
    /// `(producer task id, producer output position)` for wired inputs.
    pub output_source: Option<(Uuid, u8)>,
    pub value: Option<Vec<u8>>,
    pub data_id: Option<Uuid>,
}

impl TaskInput {
    pub fn from_output(task_id: Uuid, position: u8, type_tag: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            output_source: Some((task_id, position)),
            value: None,
            data_id: None,
        }
    }

    pub fn from_value(value: Vec<u8>, type_tag: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            output_source: None,
            value: Some(value),
            data_id: None,
        }
    }

    pub fn from_data(data_id: Uuid) -> Self {
        Self {
            type_tag: crate::data::DATA_TAG.to_string(),
            output_source: None,
            value: None,
            data_id: Some(data_id),
        }
    }

    /// An input is filled once it carries a value or a data id.
    pub fn is_filled(&self) -> bool {
        self.value.is_some() || self.data_id.is_some()
    }
}

/// One output slot of a task, filled when the task finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutput {
    pub type_tag: String,
    pub value: Option<Vec<u8>>,
    pub data_id: Option<Uuid>,
}

impl TaskOutput {
    pub fn new(type_tag: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            value: None,
            data_id: None,
        }
    }

    pub fn with_value(value: Vec<u8>, type_tag: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            value: Some(value),
            data_id: None,
        }
    }

    pub fn with_data_id(data_id: Uuid, type_tag: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            value: None,
            data_id: Some(data_id),
        }
    }
}

/// A single execution attempt of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInstance {
    pub id: Uuid,
    pub task_id: Uuid,
}

impl TaskInstance {
    pub fn new(task_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
        }
    }

    pub fn with_id(id: Uuid, task_id: Uuid) -> Self {
        Self { id, task_id }
    }
}

/// A node in a job's DAG: one registered function invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub function_name: String,
    pub language: TaskLanguage,
    pub state: TaskState,
    /// Seconds before a running instance is considered timed out; 0 disables.
    pub timeout: f32,
    pub max_retries: u32,
    pub retries: u32,
    pub inputs: Vec<TaskInput>,
    pub outputs: Vec<TaskOutput>,
}

impl Task {
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            function_name: function_name.into(),
            language: TaskLanguage::Native,
            state: TaskState::Pending,
            timeout: 0.0,
            max_retries: 0,
            retries: 0,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn add_input(&mut self, input: TaskInput) {
        self.inputs.push(input);
    }

    pub fn add_output(&mut self, output: TaskOutput) {
        self.outputs.push(output);
    }
}

/// Scheduling view of a dispatchable task.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleTaskMetadata {
    pub id: Uuid,
    pub function_name: String,
    pub job_id: Uuid,
    pub client_id: Uuid,
    pub job_creation_time: DateTime<Utc>,
    pub hard_localities: Vec<String>,
    pub soft_localities: Vec<String>,
}

impl ScheduleTaskMetadata {
    pub fn new(id: Uuid, function_name: impl Into<String>, job_id: Uuid) -> Self {
        Self {
            id,
            function_name: function_name.into(),
            job_id,
            client_id: Uuid::nil(),
            job_creation_time: DateTime::<Utc>::UNIX_EPOCH,
            hard_localities: Vec::new(),
            soft_localities: Vec::new(),
        }
    }
}
