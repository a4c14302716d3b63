//! Shared fixtures for the storage tests.
#![allow(dead_code)]

use std::sync::Arc;

use uuid::Uuid;

use spider_core::graph::TaskGraph;
use spider_core::task::{Task, TaskInput, TaskOutput};

use spider_storage::{
    DataStorage, MemoryStorageFactory, MetadataStorage, StorageConnection, StorageFactory,
};

pub struct TestStore {
    pub factory: Arc<MemoryStorageFactory>,
    pub metadata: Arc<dyn MetadataStorage>,
    pub data: Arc<dyn DataStorage>,
    pub conn: Box<dyn StorageConnection>,
}

pub async fn setup() -> TestStore {
    let factory = Arc::new(MemoryStorageFactory::new());
    let metadata = factory.provide_metadata_storage();
    let data = factory.provide_data_storage();
    let mut conn = factory.provide_connection().await.unwrap();
    metadata.initialize(conn.as_mut()).await.unwrap();
    data.initialize(conn.as_mut()).await.unwrap();
    TestStore {
        factory,
        metadata,
        data,
        conn,
    }
}

pub fn int_value(value: i64) -> Vec<u8> {
    rmp_serde::to_vec(&value).unwrap()
}

pub fn int_input(value: i64) -> TaskInput {
    TaskInput::from_value(int_value(value), "int")
}

pub fn int_output() -> TaskOutput {
    TaskOutput::new("int")
}

pub fn int_task(name: &str, inputs: Vec<TaskInput>) -> Task {
    let mut task = Task::new(name);
    for input in inputs {
        task.add_input(input);
    }
    task.add_output(int_output());
    task
}

/// `child(parent(a, b), c)` wired through the parent's single output.
pub fn chain_graph(a: i64, b: i64, c: i64) -> (TaskGraph, Uuid, Uuid) {
    let mut graph = TaskGraph::new();
    let parent = int_task("sum", vec![int_input(a), int_input(b)]);
    let parent_id = parent.id;
    let mut child = int_task(
        "sum",
        vec![TaskInput::from_output(parent_id, 0, "int"), int_input(c)],
    );
    child.max_retries = 0;
    let child_id = child.id;
    graph.add_task(parent);
    graph.add_child_task(child, &[parent_id]);
    graph.add_input_task(parent_id);
    graph.add_output_task(child_id);
    (graph, parent_id, child_id)
}

/// A single ready task with one literal input and one output.
pub fn single_task_graph(name: &str) -> (TaskGraph, Uuid) {
    let mut graph = TaskGraph::new();
    let task = int_task(name, vec![int_input(1)]);
    let task_id = task.id;
    graph.add_task(task);
    graph.add_input_task(task_id);
    graph.add_output_task(task_id);
    (graph, task_id)
}
