//! Driver façade tests against the in-memory store. The worker side is
//! simulated by driving the storage operations directly.

use std::sync::Arc;
use std::time::Duration;

use spider_client::{literal, output, Driver, FunctionRegistry, TaskError, TaskGraphBuilder};
use spider_core::envelope::pack_value;
use spider_core::job::JobStatus;
use spider_core::task::{TaskInstance, TaskOutput};

use spider_storage::{MemoryStorageFactory, StorageFactory};

fn registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry.register("sum", |_ctx, (a, b): (i64, i64)| async move {
        Ok::<_, TaskError>(a + b)
    });
    registry
}

fn sum_graph(registry: &FunctionRegistry) -> spider_core::graph::TaskGraph {
    let sum = registry.get("sum").unwrap();
    let mut builder = TaskGraphBuilder::new();
    let parent = builder
        .add_task(sum, vec![literal(&1i64).unwrap(), literal(&2i64).unwrap()])
        .unwrap();
    let child = builder
        .add_task(sum, vec![output(parent, 0), literal(&3i64).unwrap()])
        .unwrap();
    builder.mark_output(child);
    builder.build().unwrap()
}

#[tokio::test]
async fn driver_registers_and_rejects_duplicate_ids() {
    let factory = Arc::new(MemoryStorageFactory::new());
    let driver = Driver::with_factory(factory.clone()).await.unwrap();

    let duplicate = Driver::with_factory_and_id(factory.clone(), driver.id()).await;
    assert!(matches!(
        duplicate,
        Err(spider_client::ClientError::DriverIdInUse(_))
    ));
}

#[tokio::test]
async fn submit_persists_the_graph() {
    let factory = Arc::new(MemoryStorageFactory::new());
    let driver = Driver::with_factory(factory.clone()).await.unwrap();
    let registry = registry();

    let job = driver.submit(sum_graph(&registry)).await.unwrap();
    assert_eq!(job.status().await.unwrap(), JobStatus::Running);
    assert!(driver.jobs().await.unwrap().contains(&job.id()));

    let metadata = factory.provide_metadata_storage();
    let mut conn = factory.provide_connection().await.unwrap();
    let graph = metadata
        .get_task_graph(conn.as_mut(), job.id())
        .await
        .unwrap();
    assert_eq!(graph.tasks().len(), 2);
    assert_eq!(graph.output_tasks().len(), 1);
}

#[tokio::test]
async fn resubmitting_the_same_graph_mints_fresh_ids() {
    let factory = Arc::new(MemoryStorageFactory::new());
    let driver = Driver::with_factory(factory.clone()).await.unwrap();
    let registry = registry();
    let graph = sum_graph(&registry);

    let first = driver.submit(graph.clone()).await.unwrap();
    // The second submission hits duplicate task ids and retries with new
    // ones instead of failing.
    let second = driver.submit(graph).await.unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(driver.jobs().await.unwrap().len(), 2);
}

#[tokio::test]
async fn finished_job_yields_its_decoded_result() {
    let factory = Arc::new(MemoryStorageFactory::new());
    let driver = Driver::with_factory(factory.clone()).await.unwrap();
    let registry = registry();
    let job = driver.submit(sum_graph(&registry)).await.unwrap();

    // Pretend to be the worker: run both tasks through storage.
    let metadata = factory.provide_metadata_storage();
    let mut conn = factory.provide_connection().await.unwrap();
    let graph = metadata
        .get_task_graph(conn.as_mut(), job.id())
        .await
        .unwrap();
    let parent_id = graph.input_tasks()[0];
    let child_id = graph.output_tasks()[0];
    for (task_id, value) in [(parent_id, 3i64), (child_id, 6i64)] {
        let instance = TaskInstance::new(task_id);
        metadata
            .create_task_instance(conn.as_mut(), &instance)
            .await
            .unwrap();
        metadata
            .task_finish(
                conn.as_mut(),
                &instance,
                &[TaskOutput::with_value(pack_value(&value).unwrap(), "int")],
            )
            .await
            .unwrap();
    }

    assert_eq!(job.wait_complete().await.unwrap(), JobStatus::Succeeded);
    assert_eq!(job.result::<i64>().await.unwrap(), 6);
}

#[tokio::test]
async fn cancel_is_terminal() {
    let factory = Arc::new(MemoryStorageFactory::new());
    let driver = Driver::with_factory(factory.clone()).await.unwrap();
    let registry = registry();
    let job = driver.submit(sum_graph(&registry)).await.unwrap();

    job.cancel().await.unwrap();
    assert_eq!(job.wait_complete().await.unwrap(), JobStatus::Cancelled);
}

#[tokio::test]
async fn kv_store_round_trips() {
    let factory = Arc::new(MemoryStorageFactory::new());
    let driver = Driver::with_factory(factory.clone()).await.unwrap();

    assert_eq!(driver.kv_get("missing").await.unwrap(), None);
    driver.kv_insert("key", "value").await.unwrap();
    assert_eq!(
        driver.kv_get("key").await.unwrap(),
        Some("value".to_string())
    );
}

#[tokio::test]
async fn dropped_data_handle_releases_its_reference() {
    let factory = Arc::new(MemoryStorageFactory::new());
    let driver = Driver::with_factory(factory.clone()).await.unwrap();

    let handle = driver.data_builder().build(&41i64).await.unwrap();
    let data_id = handle.id();
    assert_eq!(handle.decode::<i64>().unwrap(), 41);

    let data_store = factory.provide_data_storage();
    let mut conn = factory.provide_connection().await.unwrap();
    assert!(data_store.get_data(conn.as_mut(), data_id).await.is_ok());

    drop(handle);
    // The removal travels through the driver's cleanup task.
    tokio::time::sleep(Duration::from_millis(50)).await;
    data_store
        .remove_dangling_data(conn.as_mut())
        .await
        .unwrap();
    assert!(data_store.get_data(conn.as_mut(), data_id).await.is_err());
}

#[tokio::test]
async fn persisted_data_handle_keeps_its_reference() {
    let factory = Arc::new(MemoryStorageFactory::new());
    let driver = Driver::with_factory(factory.clone()).await.unwrap();

    let handle = driver.data_builder().build(&5i64).await.unwrap();
    let data_ref = handle.persist();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let data_store = factory.provide_data_storage();
    let mut conn = factory.provide_connection().await.unwrap();
    data_store
        .remove_dangling_data(conn.as_mut())
        .await
        .unwrap();
    assert!(data_store.get_data(conn.as_mut(), data_ref.0).await.is_ok());
}

#[tokio::test]
async fn clean_shutdown_removes_the_driver_row() {
    let factory = Arc::new(MemoryStorageFactory::new());
    let driver = Driver::with_factory(factory.clone()).await.unwrap();
    let driver_id = driver.id();
    driver.shutdown().await.unwrap();

    let metadata = factory.provide_metadata_storage();
    let mut conn = factory.provide_connection().await.unwrap();
    assert!(metadata
        .update_heartbeat(conn.as_mut(), driver_id)
        .await
        .is_err());
}
