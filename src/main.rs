//! CLI for msgrelay
//!
//! Subcommands:
//! - `api`: run the HTTP front door that publishes incoming messages
//! - `worker`: consume the queue and append every message to the log
//! - `publish`: publish a single message from the command line

use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use msgrelay::api::{self, ApiState};
use msgrelay::broker::{AmqpConnector, Message};
use msgrelay::config::{Settings, load_config};
use msgrelay::consumer::{ConsumerLoop, SinkProcessor};
use msgrelay::publisher::Publisher;
use msgrelay::sink::LogSink;
use msgrelay::supervisor::RetryPolicy;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "msgrelay", version, about = "Durable message intake and processing over RabbitMQ")]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server (POST /message, GET /health)
    Api,
    /// Start the queue worker
    Worker,
    /// Publish one message and exit
    Publish {
        /// Message content
        content: String,
        /// Message priority
        #[arg(long, default_value_t = 1, allow_hyphen_values = true)]
        priority: i64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    msgrelay::utils::logging::init(&cli.log_level);

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Api => run_api(settings).await,
        Command::Worker => run_worker(settings).await,
        Command::Publish { content, priority } => run_publish(settings, content, priority).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Cancels the returned token on Ctrl-C or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received. Exiting gracefully.");
        trigger.cancel();
    });
    cancel
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn run_api(settings: Settings) -> anyhow::Result<()> {
    let connector = AmqpConnector::new(settings.rabbitmq.clone(), "msgrelay-api");
    let state = ApiState {
        publisher: Publisher::new(connector, settings.rabbitmq.queue.clone()),
        auth: settings.auth.clone(),
    };

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    api::serve(listener, api::router(state), shutdown_token())
        .await
        .context("HTTP server failed")
}

async fn run_worker(settings: Settings) -> anyhow::Result<()> {
    let connector = AmqpConnector::new(settings.rabbitmq.clone(), "msgrelay-worker");
    let sink = LogSink::new(settings.worker.log_path.clone());
    info!(
        endpoint = %connector.endpoint(),
        queue = %settings.rabbitmq.queue,
        log = %sink.path().display(),
        "Starting worker"
    );

    let policy = RetryPolicy::new(settings.worker.max_retries, settings.worker.retry_delay());
    let mut consumer = ConsumerLoop::new(connector, settings.rabbitmq.queue.clone(), policy);
    let mut processor = SinkProcessor::new(sink);

    consumer
        .run(&mut processor, shutdown_token())
        .await
        .context("Worker failed")
}

async fn run_publish(settings: Settings, content: String, priority: i64) -> anyhow::Result<()> {
    let connector = AmqpConnector::new(settings.rabbitmq.clone(), "msgrelay-cli");
    let publisher = Publisher::new(connector, settings.rabbitmq.queue.clone());
    publisher.publish(&Message::new(content, priority)).await?;
    println!("Message published to queue '{}'", publisher.queue());
    Ok(())
}
