//! Assembles validated task graphs for submission.

use std::collections::HashMap;

use uuid::Uuid;

use spider_core::data::DATA_TAG;
use spider_core::envelope::pack_value;
use spider_core::graph::TaskGraph;
use spider_core::task::{Task, TaskInput, TaskOutput};

use crate::error::ClientError;
use crate::registry::{DataRef, TaskFunction, TaskValue};

/// Handle to a task added to a [`TaskGraphBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskNode {
    id: Uuid,
}

impl TaskNode {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// One input binding of a task being added.
#[derive(Debug, Clone)]
pub enum TaskInputSlot {
    /// A literal value fixed at submission.
    Value { bytes: Vec<u8>, tag: &'static str },
    /// The output of another task in the same graph.
    Output { node: TaskNode, position: u8 },
    /// A stored datum.
    Data(DataRef),
}

/// Encodes a literal input value.
pub fn literal<T: TaskValue>(value: &T) -> Result<TaskInputSlot, ClientError> {
    Ok(TaskInputSlot::Value {
        bytes: pack_value(value)?,
        tag: T::TAG,
    })
}

/// Wires an input to the output of another task.
pub fn output(node: TaskNode, position: u8) -> TaskInputSlot {
    TaskInputSlot::Output { node, position }
}

/// Per-task knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskOptions {
    /// Seconds before a running instance is considered timed out; 0 disables.
    pub timeout: f32,
    pub max_retries: u32,
}

/// Builds a DAG of registered functions, validating arity and type tags as
/// tasks are wired together.
#[derive(Debug, Default)]
pub struct TaskGraphBuilder {
    graph: TaskGraph,
    output_tags: HashMap<Uuid, Vec<&'static str>>,
    insertion_order: Vec<Uuid>,
    marked_outputs: Vec<Uuid>,
}

impl TaskGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an invocation of `function` with default options.
    pub fn add_task(
        &mut self,
        function: &TaskFunction,
        inputs: Vec<TaskInputSlot>,
    ) -> Result<TaskNode, ClientError> {
        self.add_task_with(function, inputs, TaskOptions::default())
    }

    /// Adds an invocation of `function`, checking every input against the
    /// function's declared signature.
    pub fn add_task_with(
        &mut self,
        function: &TaskFunction,
        inputs: Vec<TaskInputSlot>,
        options: TaskOptions,
    ) -> Result<TaskNode, ClientError> {
        let expected = function.input_tags();
        if inputs.len() != expected.len() {
            return Err(ClientError::InvalidGraph(format!(
                "{} takes {} inputs, got {}",
                function.name(),
                expected.len(),
                inputs.len()
            )));
        }

        let mut task = Task::new(function.name());
        task.timeout = options.timeout;
        task.max_retries = options.max_retries;
        let mut parents = Vec::new();
        for (input, expected_tag) in inputs.into_iter().zip(expected.iter()) {
            match input {
                TaskInputSlot::Value { bytes, tag } => {
                    if tag != *expected_tag {
                        return Err(ClientError::InvalidGraph(format!(
                            "literal input of type {tag} bound to {expected_tag} parameter of {}",
                            function.name()
                        )));
                    }
                    task.add_input(TaskInput::from_value(bytes, tag));
                }
                TaskInputSlot::Output { node, position } => {
                    let producer_tags =
                        self.output_tags.get(&node.id).ok_or_else(|| {
                            ClientError::InvalidGraph("unknown producer task".to_string())
                        })?;
                    let produced =
                        producer_tags.get(usize::from(position)).ok_or_else(|| {
                            ClientError::InvalidGraph(format!(
                                "producer has no output at position {position}"
                            ))
                        })?;
                    if produced != expected_tag {
                        return Err(ClientError::InvalidGraph(format!(
                            "output of type {produced} bound to {expected_tag} parameter of {}",
                            function.name()
                        )));
                    }
                    task.add_input(TaskInput::from_output(node.id, position, *expected_tag));
                    if !parents.contains(&node.id) {
                        parents.push(node.id);
                    }
                }
                TaskInputSlot::Data(data_ref) => {
                    if *expected_tag != DATA_TAG {
                        return Err(ClientError::InvalidGraph(format!(
                            "data input bound to {expected_tag} parameter of {}",
                            function.name()
                        )));
                    }
                    task.add_input(TaskInput::from_data(data_ref.0));
                }
            }
        }
        for tag in function.output_tags() {
            task.add_output(TaskOutput::new(*tag));
        }

        let id = task.id;
        if !self.graph.add_child_task(task, &parents) {
            return Err(ClientError::InvalidGraph(
                "task could not be added to the graph".to_string(),
            ));
        }
        self.output_tags.insert(id, function.output_tags().to_vec());
        self.insertion_order.push(id);
        Ok(TaskNode { id })
    }

    /// Declares a task's outputs as part of the job result. Without any
    /// marks, the tasks with no children produce the result.
    pub fn mark_output(&mut self, node: TaskNode) {
        if !self.marked_outputs.contains(&node.id) {
            self.marked_outputs.push(node.id);
        }
    }

    pub fn build(mut self) -> Result<TaskGraph, ClientError> {
        if self.insertion_order.is_empty() {
            return Err(ClientError::InvalidGraph("graph has no tasks".to_string()));
        }
        if self.graph.topological_order().is_none() {
            return Err(ClientError::InvalidGraph(
                "graph has a cycle or dangling edge".to_string(),
            ));
        }

        for id in &self.insertion_order {
            if self.graph.parent_tasks(*id).is_empty() {
                self.graph.add_input_task(*id);
            }
        }
        let outputs: Vec<Uuid> = if self.marked_outputs.is_empty() {
            self.insertion_order
                .iter()
                .filter(|id| self.graph.child_tasks(**id).is_empty())
                .copied()
                .collect()
        } else {
            self.marked_outputs.clone()
        };
        for id in outputs {
            self.graph.add_output_task(id);
        }
        Ok(self.graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FunctionRegistry, TaskError};

    fn registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry.register("sum", |_ctx, (a, b): (i64, i64)| async move {
            Ok::<i64, TaskError>(a + b)
        });
        registry.register("stringify", |_ctx, (v,): (i64,)| async move {
            Ok::<String, TaskError>(v.to_string())
        });
        registry
    }

    #[test]
    fn wires_outputs_to_inputs() {
        let registry = registry();
        let sum = registry.get("sum").unwrap();
        let mut builder = TaskGraphBuilder::new();
        let parent = builder
            .add_task(sum, vec![literal(&1i64).unwrap(), literal(&2i64).unwrap()])
            .unwrap();
        let child = builder
            .add_task(sum, vec![output(parent, 0), literal(&3i64).unwrap()])
            .unwrap();
        let graph = builder.build().unwrap();

        assert_eq!(graph.dependencies(), &[(parent.id(), child.id())]);
        assert_eq!(graph.input_tasks(), &[parent.id()]);
        assert_eq!(graph.output_tasks(), &[child.id()]);
        let child_task = graph.task(child.id()).unwrap();
        assert_eq!(child_task.inputs[0].output_source, Some((parent.id(), 0)));
    }

    #[test]
    fn rejects_arity_mismatch() {
        let registry = registry();
        let sum = registry.get("sum").unwrap();
        let mut builder = TaskGraphBuilder::new();
        let result = builder.add_task(sum, vec![literal(&1i64).unwrap()]);
        assert!(matches!(result, Err(ClientError::InvalidGraph(_))));
    }

    #[test]
    fn rejects_tag_mismatch() {
        let registry = registry();
        let sum = registry.get("sum").unwrap();
        let stringify = registry.get("stringify").unwrap();
        let mut builder = TaskGraphBuilder::new();
        let parent = builder
            .add_task(stringify, vec![literal(&1i64).unwrap()])
            .unwrap();
        // stringify produces a str, sum expects ints.
        let result = builder.add_task(sum, vec![output(parent, 0), literal(&2i64).unwrap()]);
        assert!(matches!(result, Err(ClientError::InvalidGraph(_))));
    }
}
