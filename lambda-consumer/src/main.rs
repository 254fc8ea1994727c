use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, routing::get, Router};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lambda_consumer::config::{CommitStoreKind, Config};
use lambda_consumer::kafka::{KafkaBroker, KafkaCommitStore};
use lambda_consumer::metrics::{serve, setup_metrics_router, track_metrics};
use lambda_consumer::store::{CommitStore, FileCommitStore};
use lambda_consumer::{
    ConsumerLoop, ConsumerReport, ConsumerState, LoggingHandler, OffsetTracker,
};

/// Exit status when every partition halted without a shutdown signal
const EXIT_ALL_PARTITIONS_HALTED: u8 = 2;

pub async fn index() -> &'static str {
    "lambda consumer"
}

async fn liveness(State(state): State<watch::Receiver<ConsumerState>>) -> StatusCode {
    match *state.borrow() {
        ConsumerState::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    }
}

async fn readiness(State(state): State<watch::Receiver<ConsumerState>>) -> StatusCode {
    match *state.borrow() {
        ConsumerState::Running => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn start_server(
    config: &Config,
    state: watch::Receiver<ConsumerState>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>> {
    let metrics_router = setup_metrics_router().context("failed to install metrics recorder")?;
    let router = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(liveness))
        .route("/_readiness", get(readiness))
        .with_state(state)
        .merge(metrics_router)
        .layer(axum::middleware::from_fn(track_metrics));

    let bind = config.bind();
    info!(address = bind.as_str(), "Starting HTTP server");

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind, shutdown).await {
            error!(error = ?e, "HTTP server failed");
        }
    }))
}

async fn shutdown_signal() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
}

async fn build_store(config: &Config) -> Result<Arc<dyn CommitStore>> {
    let store: Arc<dyn CommitStore> = match config.commit_store {
        CommitStoreKind::Kafka => Arc::new(
            KafkaCommitStore::new(&config.kafka_client_config(), config.store_op_timeout.0)
                .context("failed to create Kafka commit store")?,
        ),
        CommitStoreKind::File => Arc::new(
            FileCommitStore::open(&config.commit_store_path)
                .await
                .with_context(|| {
                    format!(
                        "failed to open commit file {}",
                        config.commit_store_path.display()
                    )
                })?,
        ),
    };
    Ok(store)
}

async fn run() -> Result<ConsumerReport> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    config.validate().context("Invalid configuration")?;

    let consumer_config = config.to_consumer_config();
    info!(
        topic = consumer_config.topic.as_str(),
        group_id = consumer_config.group_id.as_str(),
        commit_store = ?config.commit_store,
        "Configuration loaded"
    );

    let broker = KafkaBroker::new(
        config.kafka_client_config(),
        config.startup_deadline.0,
        config.kafka.kafka_consumer_offset_reset,
    )
    .context("failed to create Kafka client")?;
    let store = build_store(&config).await?;
    let offset_tracker = OffsetTracker::new(store, config.store_op_timeout.0);

    let consumer = ConsumerLoop::new(
        consumer_config,
        Arc::new(broker),
        Arc::new(LoggingHandler),
        Arc::new(offset_tracker),
    );

    let server_shutdown = CancellationToken::new();
    let server_handle = start_server(&config, consumer.state(), server_shutdown.clone())?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let report = consumer.run(shutdown).await;

    server_shutdown.cancel();
    if let Err(e) = server_handle.await {
        warn!(error = ?e, "HTTP server task did not finish cleanly");
    }

    report.context("Consumer failed to start")
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(EnvFilter::from_default_env())
        .init();

    info!("Starting lambda consumer");

    match run().await {
        Ok(report) if report.all_halted() => {
            warn!(
                halted_partitions = report.halted().count(),
                "Every partition halted, exiting"
            );
            ExitCode::from(EXIT_ALL_PARTITIONS_HALTED)
        }
        Ok(report) => {
            info!(
                partitions = report.partitions.len(),
                halted_partitions = report.halted().count(),
                "Lambda consumer stopped"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = ?e, "Lambda consumer exited with an error");
            ExitCode::FAILURE
        }
    }
}
