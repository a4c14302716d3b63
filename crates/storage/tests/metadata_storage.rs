mod common;

use std::time::Duration;

use uuid::Uuid;

use spider_core::driver::{Driver, Scheduler};
use spider_core::error::StorageErr;
use spider_core::job::JobStatus;
use spider_core::task::{Task, TaskInput, TaskInstance, TaskOutput, TaskState};

use common::{chain_graph, int_input, int_task, int_value, setup, single_task_graph};

#[tokio::test]
async fn add_job_round_trips_the_graph() {
    let mut store = setup().await;
    let (graph, parent_id, child_id) = chain_graph(1, 2, 3);
    let job_id = Uuid::new_v4();
    let client_id = Uuid::new_v4();

    store
        .metadata
        .add_job(store.conn.as_mut(), job_id, client_id, &graph)
        .await
        .unwrap();

    let fetched = store
        .metadata
        .get_task_graph(store.conn.as_mut(), job_id)
        .await
        .unwrap();
    assert_eq!(fetched.tasks().len(), 2);
    assert_eq!(fetched.dependencies(), &[(parent_id, child_id)]);
    assert_eq!(fetched.input_tasks(), &[parent_id]);
    assert_eq!(fetched.output_tasks(), &[child_id]);

    // Head tasks start ready, wired tasks pending.
    assert_eq!(
        fetched.task(parent_id).unwrap().state,
        TaskState::Ready
    );
    assert_eq!(
        fetched.task(child_id).unwrap().state,
        TaskState::Pending
    );

    let metadata = store
        .metadata
        .get_job_metadata(store.conn.as_mut(), job_id)
        .await
        .unwrap();
    assert_eq!(metadata.client_id, client_id);
    assert_eq!(
        store
            .metadata
            .get_job_status(store.conn.as_mut(), job_id)
            .await
            .unwrap(),
        JobStatus::Running
    );
}

#[tokio::test]
async fn duplicate_job_submission_is_rejected() {
    let mut store = setup().await;
    let (graph, _, _) = chain_graph(1, 2, 3);
    let job_id = Uuid::new_v4();
    store
        .metadata
        .add_job(store.conn.as_mut(), job_id, Uuid::new_v4(), &graph)
        .await
        .unwrap();

    let same_job = store
        .metadata
        .add_job(store.conn.as_mut(), job_id, Uuid::new_v4(), &graph)
        .await;
    assert!(matches!(same_job, Err(StorageErr::DuplicateKey(_))));

    // Same task ids under a fresh job id collide too.
    let same_tasks = store
        .metadata
        .add_job(store.conn.as_mut(), Uuid::new_v4(), Uuid::new_v4(), &graph)
        .await;
    assert!(matches!(same_tasks, Err(StorageErr::DuplicateKey(_))));
}

#[tokio::test]
async fn cyclic_graph_is_rejected() {
    let mut store = setup().await;
    let (mut graph, parent_id, child_id) = chain_graph(1, 2, 3);
    graph.add_dependency(child_id, parent_id);

    let result = store
        .metadata
        .add_job(store.conn.as_mut(), Uuid::new_v4(), Uuid::new_v4(), &graph)
        .await;
    assert!(matches!(result, Err(StorageErr::KeyNotFound(_))));
}

#[tokio::test]
async fn type_mismatch_is_rejected() {
    let mut store = setup().await;
    let mut graph = spider_core::graph::TaskGraph::new();
    let mut parent = Task::new("stringify");
    parent.add_input(int_input(1));
    parent.add_output(TaskOutput::new("str"));
    let parent_id = parent.id;
    let child = int_task(
        "sum",
        vec![TaskInput::from_output(parent_id, 0, "int"), int_input(2)],
    );
    graph.add_task(parent);
    graph.add_child_task(child, &[parent_id]);

    let result = store
        .metadata
        .add_job(store.conn.as_mut(), Uuid::new_v4(), Uuid::new_v4(), &graph)
        .await;
    assert!(matches!(result, Err(StorageErr::ConstraintViolation(_))));
}

#[tokio::test]
async fn finish_propagates_outputs_downstream() {
    let mut store = setup().await;
    let (graph, parent_id, child_id) = chain_graph(1, 2, 3);
    let job_id = Uuid::new_v4();
    store
        .metadata
        .add_job(store.conn.as_mut(), job_id, Uuid::new_v4(), &graph)
        .await
        .unwrap();

    let instance = TaskInstance::new(parent_id);
    store
        .metadata
        .create_task_instance(store.conn.as_mut(), &instance)
        .await
        .unwrap();
    store
        .metadata
        .task_finish(
            store.conn.as_mut(),
            &instance,
            &[TaskOutput::with_value(int_value(3), "int")],
        )
        .await
        .unwrap();

    let parent = store
        .metadata
        .get_task(store.conn.as_mut(), parent_id)
        .await
        .unwrap();
    assert_eq!(parent.state, TaskState::Succeed);
    assert_eq!(parent.outputs[0].value, Some(int_value(3)));

    // The child's wired input filled and the child became ready.
    let child = store
        .metadata
        .get_task(store.conn.as_mut(), child_id)
        .await
        .unwrap();
    assert_eq!(child.state, TaskState::Ready);
    assert_eq!(child.inputs[0].value, Some(int_value(3)));

    // Job still running until the child succeeds.
    assert_eq!(
        store
            .metadata
            .get_job_status(store.conn.as_mut(), job_id)
            .await
            .unwrap(),
        JobStatus::Running
    );

    let child_instance = TaskInstance::new(child_id);
    store
        .metadata
        .create_task_instance(store.conn.as_mut(), &child_instance)
        .await
        .unwrap();
    store
        .metadata
        .task_finish(
            store.conn.as_mut(),
            &child_instance,
            &[TaskOutput::with_value(int_value(6), "int")],
        )
        .await
        .unwrap();

    assert_eq!(
        store
            .metadata
            .get_job_status(store.conn.as_mut(), job_id)
            .await
            .unwrap(),
        JobStatus::Succeeded
    );
    assert!(store
        .metadata
        .get_job_complete(store.conn.as_mut(), job_id)
        .await
        .unwrap());
}

#[tokio::test]
async fn fan_in_becomes_ready_after_both_parents() {
    let mut store = setup().await;
    let mut graph = spider_core::graph::TaskGraph::new();
    let left = int_task("sum", vec![int_input(1), int_input(2)]);
    let right = int_task("sum", vec![int_input(3), int_input(4)]);
    let (left_id, right_id) = (left.id, right.id);
    let child = int_task(
        "sum",
        vec![
            TaskInput::from_output(left_id, 0, "int"),
            TaskInput::from_output(right_id, 0, "int"),
        ],
    );
    let child_id = child.id;
    graph.add_task(left);
    graph.add_task(right);
    graph.add_child_task(child, &[left_id, right_id]);
    store
        .metadata
        .add_job(store.conn.as_mut(), Uuid::new_v4(), Uuid::new_v4(), &graph)
        .await
        .unwrap();

    let left_instance = TaskInstance::new(left_id);
    store
        .metadata
        .create_task_instance(store.conn.as_mut(), &left_instance)
        .await
        .unwrap();
    store
        .metadata
        .task_finish(
            store.conn.as_mut(),
            &left_instance,
            &[TaskOutput::with_value(int_value(3), "int")],
        )
        .await
        .unwrap();

    // One parent done: the child still waits on its last null input.
    assert_eq!(
        store
            .metadata
            .get_task_state(store.conn.as_mut(), child_id)
            .await
            .unwrap(),
        TaskState::Pending
    );

    let right_instance = TaskInstance::new(right_id);
    store
        .metadata
        .create_task_instance(store.conn.as_mut(), &right_instance)
        .await
        .unwrap();
    store
        .metadata
        .task_finish(
            store.conn.as_mut(),
            &right_instance,
            &[TaskOutput::with_value(int_value(7), "int")],
        )
        .await
        .unwrap();

    let child = store
        .metadata
        .get_task(store.conn.as_mut(), child_id)
        .await
        .unwrap();
    assert_eq!(child.state, TaskState::Ready);
    assert_eq!(child.inputs[0].value, Some(int_value(3)));
    assert_eq!(child.inputs[1].value, Some(int_value(7)));
}

#[tokio::test]
async fn repeated_finish_is_a_no_op() {
    let mut store = setup().await;
    let (graph, task_id) = single_task_graph("sum");
    store
        .metadata
        .add_job(store.conn.as_mut(), Uuid::new_v4(), Uuid::new_v4(), &graph)
        .await
        .unwrap();

    let instance = TaskInstance::new(task_id);
    store
        .metadata
        .create_task_instance(store.conn.as_mut(), &instance)
        .await
        .unwrap();
    store
        .metadata
        .task_finish(
            store.conn.as_mut(),
            &instance,
            &[TaskOutput::with_value(int_value(1), "int")],
        )
        .await
        .unwrap();

    // A racing finish from another instance id observes the binding and
    // leaves the outputs alone.
    let racer = TaskInstance::new(task_id);
    store
        .metadata
        .task_finish(
            store.conn.as_mut(),
            &racer,
            &[TaskOutput::with_value(int_value(99), "int")],
        )
        .await
        .unwrap();

    let task = store
        .metadata
        .get_task(store.conn.as_mut(), task_id)
        .await
        .unwrap();
    assert_eq!(task.outputs[0].value, Some(int_value(1)));
}

#[tokio::test]
async fn create_task_instance_is_exclusive() {
    let mut store = setup().await;
    let (graph, task_id) = single_task_graph("sum");
    store
        .metadata
        .add_job(store.conn.as_mut(), Uuid::new_v4(), Uuid::new_v4(), &graph)
        .await
        .unwrap();

    let first = TaskInstance::new(task_id);
    store
        .metadata
        .create_task_instance(store.conn.as_mut(), &first)
        .await
        .unwrap();

    // The task left `ready` with a live instance; a second creation loses.
    let second = TaskInstance::new(task_id);
    let result = store
        .metadata
        .create_task_instance(store.conn.as_mut(), &second)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn last_instance_failure_fails_the_job() {
    let mut store = setup().await;
    let (graph, task_id) = single_task_graph("error_test");
    let job_id = Uuid::new_v4();
    store
        .metadata
        .add_job(store.conn.as_mut(), job_id, Uuid::new_v4(), &graph)
        .await
        .unwrap();

    let instance = TaskInstance::new(task_id);
    store
        .metadata
        .create_task_instance(store.conn.as_mut(), &instance)
        .await
        .unwrap();
    store
        .metadata
        .task_fail(store.conn.as_mut(), &instance, "Simulated error")
        .await
        .unwrap();

    assert_eq!(
        store
            .metadata
            .get_task_state(store.conn.as_mut(), task_id)
            .await
            .unwrap(),
        TaskState::Failed
    );
    assert_eq!(
        store
            .metadata
            .get_job_status(store.conn.as_mut(), job_id)
            .await
            .unwrap(),
        JobStatus::Failed
    );
    let (function_name, message) = store
        .metadata
        .get_job_message(store.conn.as_mut(), job_id)
        .await
        .unwrap();
    assert_eq!(function_name, "error_test");
    assert_eq!(message, "Simulated error");
}

#[tokio::test]
async fn non_last_instance_failure_keeps_the_task_running() {
    let mut store = setup().await;
    let (graph, task_id) = single_task_graph("sum");
    let job_id = Uuid::new_v4();
    store
        .metadata
        .add_job(store.conn.as_mut(), job_id, Uuid::new_v4(), &graph)
        .await
        .unwrap();

    let first = TaskInstance::new(task_id);
    store
        .metadata
        .create_task_instance(store.conn.as_mut(), &first)
        .await
        .unwrap();
    let second = TaskInstance::new(task_id);
    store
        .metadata
        .add_task_instance(store.conn.as_mut(), &second)
        .await
        .unwrap();

    store
        .metadata
        .task_fail(store.conn.as_mut(), &first, "speculative loser")
        .await
        .unwrap();
    assert_eq!(
        store
            .metadata
            .get_task_state(store.conn.as_mut(), task_id)
            .await
            .unwrap(),
        TaskState::Running
    );

    store
        .metadata
        .task_finish(
            store.conn.as_mut(),
            &second,
            &[TaskOutput::with_value(int_value(1), "int")],
        )
        .await
        .unwrap();
    assert_eq!(
        store
            .metadata
            .get_job_status(store.conn.as_mut(), job_id)
            .await
            .unwrap(),
        JobStatus::Succeeded
    );
}

#[tokio::test]
async fn reset_job_restores_the_graph_for_retry() {
    let mut store = setup().await;
    let (mut graph, parent_id, child_id) = chain_graph(1, 2, 3);
    for task in [parent_id, child_id] {
        graph.task_mut(task).unwrap().max_retries = 1;
    }
    let job_id = Uuid::new_v4();
    store
        .metadata
        .add_job(store.conn.as_mut(), job_id, Uuid::new_v4(), &graph)
        .await
        .unwrap();

    // Run the parent, then fail the child.
    let parent_instance = TaskInstance::new(parent_id);
    store
        .metadata
        .create_task_instance(store.conn.as_mut(), &parent_instance)
        .await
        .unwrap();
    store
        .metadata
        .task_finish(
            store.conn.as_mut(),
            &parent_instance,
            &[TaskOutput::with_value(int_value(3), "int")],
        )
        .await
        .unwrap();
    let child_instance = TaskInstance::new(child_id);
    store
        .metadata
        .create_task_instance(store.conn.as_mut(), &child_instance)
        .await
        .unwrap();
    store
        .metadata
        .task_fail(store.conn.as_mut(), &child_instance, "boom")
        .await
        .unwrap();
    assert_eq!(
        store
            .metadata
            .get_job_status(store.conn.as_mut(), job_id)
            .await
            .unwrap(),
        JobStatus::Failed
    );

    assert!(store
        .metadata
        .reset_job(store.conn.as_mut(), job_id)
        .await
        .unwrap());

    let parent = store
        .metadata
        .get_task(store.conn.as_mut(), parent_id)
        .await
        .unwrap();
    assert_eq!(parent.state, TaskState::Ready);
    assert_eq!(parent.retries, 1);
    assert_eq!(parent.outputs[0].value, None);
    // Literal inputs survive the reset.
    assert_eq!(parent.inputs[0].value, Some(int_value(1)));

    let child = store
        .metadata
        .get_task(store.conn.as_mut(), child_id)
        .await
        .unwrap();
    assert_eq!(child.state, TaskState::Pending);
    assert_eq!(child.inputs[0].value, None);
    assert_eq!(
        store
            .metadata
            .get_job_status(store.conn.as_mut(), job_id)
            .await
            .unwrap(),
        JobStatus::Running
    );

    // Retry budget is spent now.
    assert!(!store
        .metadata
        .reset_job(store.conn.as_mut(), job_id)
        .await
        .unwrap());
}

#[tokio::test]
async fn cancel_job_stops_live_tasks() {
    let mut store = setup().await;
    let (graph, parent_id, child_id) = chain_graph(1, 2, 3);
    let job_id = Uuid::new_v4();
    store
        .metadata
        .add_job(store.conn.as_mut(), job_id, Uuid::new_v4(), &graph)
        .await
        .unwrap();

    let instance = TaskInstance::new(parent_id);
    store
        .metadata
        .create_task_instance(store.conn.as_mut(), &instance)
        .await
        .unwrap();
    store
        .metadata
        .task_finish(
            store.conn.as_mut(),
            &instance,
            &[TaskOutput::with_value(int_value(3), "int")],
        )
        .await
        .unwrap();

    store
        .metadata
        .cancel_job(store.conn.as_mut(), job_id)
        .await
        .unwrap();

    assert_eq!(
        store
            .metadata
            .get_job_status(store.conn.as_mut(), job_id)
            .await
            .unwrap(),
        JobStatus::Cancelled
    );
    // Finished work keeps its state; only live tasks flip to cancel.
    assert_eq!(
        store
            .metadata
            .get_task_state(store.conn.as_mut(), parent_id)
            .await
            .unwrap(),
        TaskState::Succeed
    );
    assert_eq!(
        store
            .metadata
            .get_task_state(store.conn.as_mut(), child_id)
            .await
            .unwrap(),
        TaskState::Canceled
    );
}

#[tokio::test]
async fn cancel_job_by_task_records_the_message() {
    let mut store = setup().await;
    let (graph, task_id) = single_task_graph("abort_test");
    let job_id = Uuid::new_v4();
    store
        .metadata
        .add_job(store.conn.as_mut(), job_id, Uuid::new_v4(), &graph)
        .await
        .unwrap();

    store
        .metadata
        .cancel_job_by_task(store.conn.as_mut(), task_id, "Abort test")
        .await
        .unwrap();

    assert_eq!(
        store
            .metadata
            .get_job_status(store.conn.as_mut(), job_id)
            .await
            .unwrap(),
        JobStatus::Cancelled
    );
    let (function_name, message) = store
        .metadata
        .get_job_message(store.conn.as_mut(), job_id)
        .await
        .unwrap();
    assert_eq!(function_name, "abort_test");
    assert_eq!(message, "Abort test");
}

#[tokio::test]
async fn ready_tasks_are_leased_per_scheduler() {
    let mut store = setup().await;
    let (graph, task_id) = single_task_graph("sum");
    store
        .metadata
        .add_job(store.conn.as_mut(), Uuid::new_v4(), Uuid::new_v4(), &graph)
        .await
        .unwrap();

    let first_scheduler = Uuid::new_v4();
    let second_scheduler = Uuid::new_v4();

    let tasks = store
        .metadata
        .get_ready_tasks(store.conn.as_mut(), first_scheduler)
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, task_id);

    // The lease hides the task from other schedulers.
    let tasks = store
        .metadata
        .get_ready_tasks(store.conn.as_mut(), second_scheduler)
        .await
        .unwrap();
    assert!(tasks.is_empty());

    // Until it goes stale.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let tasks = store
        .metadata
        .get_ready_tasks(store.conn.as_mut(), second_scheduler)
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);

    // Instance creation consumes the lease for good.
    let instance = TaskInstance::new(task_id);
    store
        .metadata
        .create_task_instance(store.conn.as_mut(), &instance)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let tasks = store
        .metadata
        .get_ready_tasks(store.conn.as_mut(), first_scheduler)
        .await
        .unwrap();
    assert!(tasks.is_empty());
}

#[tokio::test]
async fn timed_out_instances_become_dispatchable_again() {
    let mut store = setup().await;
    let mut graph = spider_core::graph::TaskGraph::new();
    let mut slow = int_task("sleepy", vec![int_input(1)]);
    slow.timeout = 0.05;
    let slow_id = slow.id;
    let mut eternal = int_task("sum", vec![int_input(1)]);
    eternal.timeout = 0.0;
    let eternal_id = eternal.id;
    graph.add_task(slow);
    graph.add_task(eternal);
    store
        .metadata
        .add_job(store.conn.as_mut(), Uuid::new_v4(), Uuid::new_v4(), &graph)
        .await
        .unwrap();

    for task_id in [slow_id, eternal_id] {
        store
            .metadata
            .create_task_instance(store.conn.as_mut(), &TaskInstance::new(task_id))
            .await
            .unwrap();
    }

    assert!(store
        .metadata
        .get_task_timeout(store.conn.as_mut())
        .await
        .unwrap()
        .is_empty());

    tokio::time::sleep(Duration::from_millis(80)).await;
    let timed_out = store
        .metadata
        .get_task_timeout(store.conn.as_mut())
        .await
        .unwrap();
    // A task with timeout 0 never times out.
    assert_eq!(timed_out.len(), 1);
    assert_eq!(timed_out[0].id, slow_id);

    // A speculative second instance is allowed once every prior instance
    // timed out, and the first success still wins.
    let speculative = TaskInstance::new(slow_id);
    store
        .metadata
        .create_task_instance(store.conn.as_mut(), &speculative)
        .await
        .unwrap();
    store
        .metadata
        .task_finish(
            store.conn.as_mut(),
            &speculative,
            &[TaskOutput::with_value(int_value(1), "int")],
        )
        .await
        .unwrap();
    assert_eq!(
        store
            .metadata
            .get_task_state(store.conn.as_mut(), slow_id)
            .await
            .unwrap(),
        TaskState::Succeed
    );
}

#[tokio::test]
async fn heartbeat_timeout_sweeps_drivers_and_cascades() {
    let mut store = setup().await;
    let stale_driver = Uuid::new_v4();
    let fresh_driver = Uuid::new_v4();
    store
        .metadata
        .add_driver(store.conn.as_mut(), &Driver::new(stale_driver, "10.0.0.1"))
        .await
        .unwrap();
    store
        .metadata
        .add_driver(store.conn.as_mut(), &Driver::new(fresh_driver, "10.0.0.2"))
        .await
        .unwrap();

    // The stale driver is also a scheduler holding a lease.
    store
        .metadata
        .add_scheduler(
            store.conn.as_mut(),
            &Scheduler::new(stale_driver, "10.0.0.1", 6000),
        )
        .await
        .unwrap();
    let (graph, task_id) = single_task_graph("sum");
    store
        .metadata
        .add_job(store.conn.as_mut(), Uuid::new_v4(), Uuid::new_v4(), &graph)
        .await
        .unwrap();
    let leased = store
        .metadata
        .get_ready_tasks(store.conn.as_mut(), stale_driver)
        .await
        .unwrap();
    assert_eq!(leased.len(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    store
        .metadata
        .update_heartbeat(store.conn.as_mut(), fresh_driver)
        .await
        .unwrap();

    let removed = store
        .metadata
        .heartbeat_timeout(store.conn.as_mut(), Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(removed, vec![stale_driver]);

    // Scheduler row gone with its driver; the lease aged out or cascaded,
    // so the task is claimable again.
    assert!(store
        .metadata
        .get_scheduler_addr(store.conn.as_mut(), stale_driver)
        .await
        .is_err());
    let tasks = store
        .metadata
        .get_ready_tasks(store.conn.as_mut(), fresh_driver)
        .await
        .unwrap();
    assert_eq!(tasks[0].id, task_id);

    // The surviving driver still heartbeats.
    store
        .metadata
        .update_heartbeat(store.conn.as_mut(), fresh_driver)
        .await
        .unwrap();
}

#[tokio::test]
async fn scheduler_registration_and_discovery() {
    let mut store = setup().await;
    let scheduler_id = Uuid::new_v4();
    store
        .metadata
        .add_scheduler(
            store.conn.as_mut(),
            &Scheduler::new(scheduler_id, "10.0.0.9", 6103),
        )
        .await
        .unwrap();

    let active = store
        .metadata
        .get_active_scheduler(store.conn.as_mut())
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, scheduler_id);
    assert_eq!(
        store
            .metadata
            .get_scheduler_addr(store.conn.as_mut(), scheduler_id)
            .await
            .unwrap(),
        ("10.0.0.9".to_string(), 6103)
    );
}
