use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use spider_client::FunctionRegistry;
use spider_core::stop::StopToken;
use spider_storage::factory_for_url;

use spider_worker::{run_worker, LibraryTable, WorkerConfig};

const EXIT_ARG_PARSE: i32 = 1;
const EXIT_STORAGE_CONNECT: i32 = 2;
const EXIT_LIB: i32 = 3;
const EXIT_RUNTIME: i32 = 4;

#[derive(Debug, Parser)]
#[command(name = "spider_worker", version, about = "Spider task worker")]
struct Cli {
    /// Address this worker advertises for data-locality matching.
    #[arg(long, env = "SPIDER_WORKER_HOST")]
    host: String,

    /// Storage backend url (e.g. `memory://`).
    #[arg(long, env = "SPIDER_STORAGE_URL")]
    storage_url: String,

    /// Task libraries to load, by name or path.
    #[arg(long = "libs", num_args = 1..)]
    libs: Vec<String>,

    /// Path of the task executor binary; defaults to the sibling
    /// `spider_task_executor`.
    #[arg(long, env = "SPIDER_TASK_EXECUTOR")]
    task_executor: Option<PathBuf>,
}

fn default_executor_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| Some(exe.parent()?.join("spider_task_executor")))
        .unwrap_or_else(|| PathBuf::from("spider_task_executor"))
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

    // Fail fast on unknown task libraries; the executor children will load
    // the same set.
    let mut registry = FunctionRegistry::new();
    if let Err(err) = LibraryTable::builtin().load(&cli.libs, &mut registry) {
        tracing::error!(%err, "cannot load task libraries");
        std::process::exit(EXIT_LIB);
    }
    tracing::info!(functions = ?registry.names(), "task libraries loaded");

    let factory = match factory_for_url(&cli.storage_url) {
        Ok(factory) => factory,
        Err(err) => {
            tracing::error!(%err, "failed to connect to storage");
            std::process::exit(EXIT_STORAGE_CONNECT);
        }
    };

    let stop = Arc::new(StopToken::new());
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("stop requested, finishing current task");
                stop.request_stop();
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("stop requested again, exiting immediately");
                std::process::exit(130);
            }
        });
    }

    let config = WorkerConfig {
        worker_addr: cli.host,
        storage_url: cli.storage_url,
        libs: cli.libs,
        executor_path: cli.task_executor.unwrap_or_else(default_executor_path),
    };

    match run_worker(config, factory, stop).await {
        Ok(()) => {}
        Err(err) => {
            tracing::error!(%err, "worker stopped with an error");
            std::process::exit(EXIT_RUNTIME);
        }
    }
}
