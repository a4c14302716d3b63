use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use spider_core::driver::Scheduler;
use spider_core::stop::StopToken;
use spider_storage::factory_for_url;

use spider_scheduler::loops::{cleanup_loop, heartbeat_loop, sweep_loop};
use spider_scheduler::{FifoPolicy, SchedulerServer};

const EXIT_ARG_PARSE: i32 = 1;
const EXIT_STORAGE_CONNECT: i32 = 2;
const EXIT_ADDR: i32 = 3;
const EXIT_STORAGE: i32 = 4;

#[derive(Debug, Parser)]
#[command(name = "spider_scheduler", version, about = "Spider scheduler server")]
struct Cli {
    /// Address the scheduler listens on and registers with storage.
    #[arg(long, env = "SPIDER_SCHEDULER_HOST")]
    host: String,

    #[arg(long, env = "SPIDER_SCHEDULER_PORT")]
    port: u16,

    /// Storage backend url (e.g. `memory://`).
    #[arg(long, env = "SPIDER_STORAGE_URL")]
    storage_url: String,

    /// Seconds without a heartbeat before a driver is swept away.
    #[arg(long, env = "SPIDER_DRIVER_TIMEOUT", default_value_t = 30.0)]
    driver_timeout: f64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            std::process::exit(EXIT_ARG_PARSE);
        }
    };

    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let factory = match factory_for_url(&cli.storage_url) {
        Ok(factory) => factory,
        Err(err) => {
            tracing::error!(%err, "failed to connect to storage");
            return EXIT_STORAGE_CONNECT;
        }
    };
    let metadata = factory.provide_metadata_storage();
    let data = factory.provide_data_storage();

    let mut conn = match factory.provide_connection().await {
        Ok(conn) => conn,
        Err(err) => {
            tracing::error!(%err, "failed to connect to storage");
            return EXIT_STORAGE_CONNECT;
        }
    };
    if let Err(err) = metadata.initialize(conn.as_mut()).await {
        tracing::error!(%err, "failed to initialize metadata storage");
        return EXIT_STORAGE;
    }
    if let Err(err) = data.initialize(conn.as_mut()).await {
        tracing::error!(%err, "failed to initialize data storage");
        return EXIT_STORAGE;
    }

    let listener = match TcpListener::bind((cli.host.as_str(), cli.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, host = %cli.host, port = cli.port, "cannot bind scheduler address");
            return EXIT_ADDR;
        }
    };

    let scheduler_id = Uuid::new_v4();
    let scheduler = Scheduler::new(scheduler_id, cli.host.clone(), cli.port);
    if let Err(err) = metadata.add_scheduler(conn.as_mut(), &scheduler).await {
        tracing::error!(%err, "failed to register scheduler with storage");
        return EXIT_STORAGE;
    }
    tracing::info!(%scheduler_id, host = %cli.host, port = cli.port, "scheduler registered");

    let stop = Arc::new(StopToken::new());
    spawn_ctrl_c_handler(stop.clone());

    let heartbeat = tokio::spawn(heartbeat_loop(
        factory.clone(),
        metadata.clone(),
        scheduler_id,
        stop.clone(),
    ));
    let sweep = tokio::spawn(sweep_loop(
        factory.clone(),
        metadata.clone(),
        Duration::from_secs_f64(cli.driver_timeout),
        stop.clone(),
    ));
    let cleanup = tokio::spawn(cleanup_loop(factory.clone(), data.clone(), stop.clone()));

    let policy = FifoPolicy::new(scheduler_id, factory.clone(), metadata.clone());
    let server = SchedulerServer::new(
        listener,
        factory.clone(),
        metadata.clone(),
        Box::new(policy),
        stop.clone(),
    );
    server.run().await;

    let _ = heartbeat.await;
    let _ = sweep.await;
    let _ = cleanup.await;
    tracing::info!("scheduler stopped");
    0
}

fn spawn_ctrl_c_handler(stop: Arc<StopToken>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::info!("stop requested, finishing in-flight requests");
        stop.request_stop();
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("stop requested again, exiting immediately");
            std::process::exit(130);
        }
    });
}
