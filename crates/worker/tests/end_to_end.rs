//! Full submit → schedule → execute → report loops against the in-memory
//! store, with an in-process scheduler and workers running real executor
//! child processes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use uuid::Uuid;

use spider_client::{literal, output, Driver, FunctionRegistry, TaskGraphBuilder, TaskOptions};
use spider_core::job::JobStatus;
use spider_core::stop::StopToken;
use spider_core::driver::Scheduler;

use spider_storage::{MemoryStorageFactory, StorageFactory};

use spider_scheduler::{FifoPolicy, SchedulerServer};
use spider_worker::{run_worker, WorkerConfig};

struct Cluster {
    factory: Arc<MemoryStorageFactory>,
    stop: Arc<StopToken>,
}

impl Cluster {
    /// Starts one scheduler plus `workers` worker loops sharing a fresh
    /// in-memory store.
    async fn start(workers: usize) -> Self {
        let factory = Arc::new(MemoryStorageFactory::new());
        let dyn_factory: Arc<dyn StorageFactory> = factory.clone();
        let metadata = factory.provide_metadata_storage();
        let mut conn = factory.provide_connection().await.unwrap();
        metadata.initialize(conn.as_mut()).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let scheduler_id = Uuid::new_v4();
        metadata
            .add_scheduler(
                conn.as_mut(),
                &Scheduler::new(scheduler_id, "127.0.0.1", port),
            )
            .await
            .unwrap();

        let stop = Arc::new(StopToken::new());
        let policy = FifoPolicy::new(scheduler_id, dyn_factory.clone(), metadata.clone());
        let server = SchedulerServer::new(
            listener,
            dyn_factory.clone(),
            metadata.clone(),
            Box::new(policy),
            stop.clone(),
        );
        tokio::spawn(server.run());

        for index in 0..workers {
            let config = WorkerConfig {
                worker_addr: format!("127.0.0.{}", index + 1),
                storage_url: "memory://".to_string(),
                libs: vec!["spider_tasklib".to_string()],
                executor_path: PathBuf::from(env!("CARGO_BIN_EXE_spider_task_executor")),
            };
            tokio::spawn(run_worker(config, dyn_factory.clone(), stop.clone()));
        }

        Self { factory, stop }
    }

    fn registry(&self) -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        spider_tasklib::register(&mut registry);
        registry
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.stop.request_stop();
    }
}

#[tokio::test]
async fn linear_graph_runs_to_success() {
    let cluster = Cluster::start(1).await;
    let registry = cluster.registry();
    let sum = registry.get("sum").unwrap();

    let mut builder = TaskGraphBuilder::new();
    let left = builder
        .add_task(sum, vec![literal(&1i64).unwrap(), literal(&2i64).unwrap()])
        .unwrap();
    let right = builder
        .add_task(sum, vec![literal(&3i64).unwrap(), literal(&4i64).unwrap()])
        .unwrap();
    let top = builder
        .add_task(sum, vec![output(left, 0), output(right, 0)])
        .unwrap();
    builder.mark_output(top);
    let graph = builder.build().unwrap();

    let driver = Driver::with_factory(cluster.factory.clone()).await.unwrap();
    let job = driver.submit(graph).await.unwrap();
    let status = job.wait_complete().await.unwrap();
    assert_eq!(status, JobStatus::Succeeded);
    assert_eq!(job.result::<i64>().await.unwrap(), 10);
}

#[tokio::test]
async fn mixed_type_fan_in_runs_to_success() {
    let cluster = Cluster::start(1).await;
    let registry = cluster.registry();
    let sum = registry.get("sum").unwrap();
    let mix = registry.get("mix").unwrap();

    let mut builder = TaskGraphBuilder::new();
    let ints = builder
        .add_task(sum, vec![literal(&1i64).unwrap(), literal(&1i64).unwrap()])
        .unwrap();
    let top = builder
        .add_task(mix, vec![literal(&1.1f64).unwrap(), output(ints, 0)])
        .unwrap();
    builder.mark_output(top);
    let graph = builder.build().unwrap();

    let driver = Driver::with_factory(cluster.factory.clone()).await.unwrap();
    let job = driver.submit(graph).await.unwrap();
    assert_eq!(job.wait_complete().await.unwrap(), JobStatus::Succeeded);
    let result = job.result::<f64>().await.unwrap();
    assert!((result - 3.1).abs() < 1e-9, "unexpected result {result}");
}

#[tokio::test]
async fn failing_task_exhausts_retries_and_fails_the_job() {
    let cluster = Cluster::start(1).await;
    let registry = cluster.registry();
    let error_test = registry.get("error_test").unwrap();

    let mut builder = TaskGraphBuilder::new();
    builder
        .add_task_with(
            error_test,
            vec![literal(&1i64).unwrap()],
            TaskOptions {
                timeout: 0.0,
                max_retries: 2,
            },
        )
        .unwrap();
    let graph = builder.build().unwrap();

    let driver = Driver::with_factory(cluster.factory.clone()).await.unwrap();
    let job = driver.submit(graph).await.unwrap();
    assert_eq!(job.wait_complete().await.unwrap(), JobStatus::Failed);
    let (function_name, message) = job.error().await.unwrap();
    assert_eq!(function_name, "error_test");
    assert_eq!(message, "Simulated error");
}

#[tokio::test]
async fn task_abort_cancels_the_job() {
    let cluster = Cluster::start(1).await;
    let registry = cluster.registry();
    let abort_test = registry.get("abort_test").unwrap();

    let mut builder = TaskGraphBuilder::new();
    builder
        .add_task(abort_test, vec![literal(&1i64).unwrap()])
        .unwrap();
    let graph = builder.build().unwrap();

    let driver = Driver::with_factory(cluster.factory.clone()).await.unwrap();
    let job = driver.submit(graph).await.unwrap();
    assert_eq!(job.wait_complete().await.unwrap(), JobStatus::Cancelled);
    let (function_name, message) = job.error().await.unwrap();
    assert_eq!(function_name, "abort_test");
    assert_eq!(message, "Abort test");
}

#[tokio::test]
async fn timed_out_task_is_speculatively_reissued() {
    let cluster = Cluster::start(2).await;
    let registry = cluster.registry();
    let sleepy = registry.get("sleepy").unwrap();

    let mut builder = TaskGraphBuilder::new();
    builder
        .add_task_with(
            sleepy,
            vec![literal(&400i64).unwrap(), literal(&7i64).unwrap()],
            TaskOptions {
                timeout: 0.1,
                max_retries: 0,
            },
        )
        .unwrap();
    let graph = builder.build().unwrap();

    let driver = Driver::with_factory(cluster.factory.clone()).await.unwrap();
    let job = driver.submit(graph).await.unwrap();
    // The first instance outlives its 100ms timeout; a second worker picks
    // the task up again and the first finish wins.
    assert_eq!(job.wait_complete().await.unwrap(), JobStatus::Succeeded);
    assert_eq!(job.result::<i64>().await.unwrap(), 7);
}

#[tokio::test]
async fn worker_discovers_scheduler_registered_after_start() {
    // Start with no scheduler row: the worker retries discovery until the
    // scheduler appears.
    let factory = Arc::new(MemoryStorageFactory::new());
    let dyn_factory: Arc<dyn StorageFactory> = factory.clone();
    let metadata = factory.provide_metadata_storage();
    let mut conn = factory.provide_connection().await.unwrap();
    metadata.initialize(conn.as_mut()).await.unwrap();

    let stop = Arc::new(StopToken::new());
    let config = WorkerConfig {
        worker_addr: "127.0.0.1".to_string(),
        storage_url: "memory://".to_string(),
        libs: vec!["spider_tasklib".to_string()],
        executor_path: PathBuf::from(env!("CARGO_BIN_EXE_spider_task_executor")),
    };
    tokio::spawn(run_worker(config, dyn_factory.clone(), stop.clone()));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let scheduler_id = Uuid::new_v4();
    metadata
        .add_scheduler(
            conn.as_mut(),
            &Scheduler::new(scheduler_id, "127.0.0.1", port),
        )
        .await
        .unwrap();
    let policy = FifoPolicy::new(scheduler_id, dyn_factory.clone(), metadata.clone());
    let server = SchedulerServer::new(
        listener,
        dyn_factory.clone(),
        metadata.clone(),
        Box::new(policy),
        stop.clone(),
    );
    tokio::spawn(server.run());

    let mut registry = FunctionRegistry::new();
    spider_tasklib::register(&mut registry);
    let sum = registry.get("sum").unwrap();
    let mut builder = TaskGraphBuilder::new();
    builder
        .add_task(sum, vec![literal(&20i64).unwrap(), literal(&22i64).unwrap()])
        .unwrap();
    let graph = builder.build().unwrap();

    let driver = Driver::with_factory(factory.clone()).await.unwrap();
    let job = driver.submit(graph).await.unwrap();
    assert_eq!(job.wait_complete().await.unwrap(), JobStatus::Succeeded);
    assert_eq!(job.result::<i64>().await.unwrap(), 42);

    stop.request_stop();
}
