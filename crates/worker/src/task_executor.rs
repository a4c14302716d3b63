use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use spider_client::{FunctionRegistry, InvokeOutcome, TaskContext};
use spider_core::envelope::{ExecutorRequest, ExecutorResponse};
use spider_core::error::FunctionInvokeError;
use spider_storage::factory_for_url;

use spider_worker::{pipe, LibraryTable};

const EXIT_ARG_PARSE: i32 = 1;
const EXIT_SIGNAL: i32 = 2;
const EXIT_STORAGE: i32 = 3;
const EXIT_LIB: i32 = 4;
const EXIT_FUNC_ARG_PARSE: i32 = 5;
const EXIT_RESULT_SEND: i32 = 6;
const EXIT_FUNC_FAILED: i32 = 7;

/// Single-task executor spawned by the worker supervisor; not a user
/// command.
#[derive(Debug, Parser)]
#[command(name = "spider_task_executor", version)]
struct Cli {
    /// Function to run.
    #[arg(long)]
    func: String,

    /// Task id of the function.
    #[arg(long = "task-id")]
    task_id: String,

    /// Storage backend url.
    #[arg(long)]
    storage_url: String,

    /// Task libraries to load, by name or path.
    #[arg(long = "libs", num_args = 1..)]
    libs: Vec<String>,
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

    // Ignore SIGTERM: the supervisor's forced kill is the authoritative
    // cancel path.
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(%err, "cannot install SIGTERM handler");
            std::process::exit(EXIT_SIGNAL);
        }
    };
    tokio::spawn(async move {
        loop {
            sigterm.recv().await;
            tracing::debug!("ignoring SIGTERM");
        }
    });

    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let mut registry = FunctionRegistry::new();
    if let Err(err) = LibraryTable::builtin().load(&cli.libs, &mut registry) {
        tracing::error!(%err, "cannot load task libraries");
        return EXIT_LIB;
    }

    let task_id = match Uuid::parse_str(&cli.task_id) {
        Ok(task_id) => task_id,
        Err(err) => {
            tracing::error!(%err, "invalid task id");
            return EXIT_ARG_PARSE;
        }
    };

    let factory = match factory_for_url(&cli.storage_url) {
        Ok(factory) => factory,
        Err(err) => {
            tracing::error!(%err, "cannot open storage");
            return EXIT_STORAGE;
        }
    };

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    let args = match pipe::receive_message(&mut stdin).await {
        Ok(Some(payload)) => match ExecutorRequest::decode(&payload) {
            Ok(ExecutorRequest::Arguments(args)) => args,
            Ok(other) => {
                tracing::error!(?other, "expected an arguments request");
                return EXIT_FUNC_ARG_PARSE;
            }
            Err(err) => {
                tracing::error!(%err, "cannot parse arguments request");
                return EXIT_FUNC_ARG_PARSE;
            }
        },
        Ok(None) | Err(_) => {
            tracing::error!("cannot read arguments request");
            return EXIT_FUNC_ARG_PARSE;
        }
    };
    tracing::debug!(function = %cli.func, "arguments parsed");

    let Some(function) = registry.get(&cli.func) else {
        let response = ExecutorResponse::Error(
            FunctionInvokeError::FunctionExecutionError,
            format!("Function {} not found.", cli.func),
        );
        let _ = pipe::send_message(&mut stdout, &response.encode()).await;
        return EXIT_RESULT_SEND;
    };

    let context = TaskContext::new(task_id, factory);
    let outcome = function.invoke(context, args).await;
    tracing::debug!(function = %cli.func, "function executed");

    let (response, exit_code) = match outcome {
        InvokeOutcome::Success(outputs) => (ExecutorResponse::Result(outputs), 0),
        InvokeOutcome::Error(code, message) => {
            (ExecutorResponse::Error(code, message), EXIT_FUNC_FAILED)
        }
        // The worker reconciles the abort with the store; the child only
        // acknowledges it on the pipe.
        InvokeOutcome::Abort(message) => (ExecutorResponse::Cancel(message), 0),
    };
    if let Err(err) = pipe::send_message(&mut stdout, &response.encode()).await {
        tracing::error!(%err, "cannot send result");
        return EXIT_RESULT_SEND;
    }
    exit_code
}
