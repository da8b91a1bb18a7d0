//! homeflow: a reactive automation engine between an MQTT broker and a
//! user-defined dataflow graph.
//!
//! Startup order matters: configuration and logging first, then the
//! store, the hydrated registry, the strategy host and engine workers,
//! then the transport and system sources, and finally the management
//! API. Shutdown walks the same list backwards: stop the sources, emit
//! the shutdown event, drain the queue (30 s budget), close the link.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 fatal startup
//! error.

mod api;
mod config;
mod engine;
mod metrics;
mod mqtt;
mod store;
mod strategy;
mod topics;
mod value;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::AppState;
use crate::config::{Config, DatabaseKind, LogLevel};
use crate::engine::{sources, EngineCore, EngineHandle, Job, TRIGGER_MQTT, TRIGGER_SYSTEM};
use crate::metrics::Metrics;
use crate::mqtt::{InboundMessage, LinkSettings, LinkState, MqttHandle, MqttWorker};
use crate::store::SqliteStore;
use crate::strategy::StrategyHost;
use crate::topics::Registry;

const SHUTDOWN_DRAIN_BUDGET: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "homeflow", version, about = "MQTT dataflow automation engine")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "homeflow.yaml")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = color_eyre::install() {
        eprintln!("failed to install error reporting: {}", e);
        return ExitCode::from(2);
    }

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::from(1);
        }
    };

    let _log_guard = match setup_logging(&config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("logging setup failed: {}", e);
            return ExitCode::from(2);
        }
    };

    if config.database.kind == DatabaseKind::Postgres {
        error!("database.type = postgres is not available in this build, use sqlite");
        return ExitCode::from(1);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {}", e);
            return ExitCode::from(2);
        }
    };

    runtime.block_on(run(config))
}

fn setup_logging(
    config: &Config,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, String> {
    let level = match config.logging.level {
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Info => Level::INFO,
        LogLevel::Warn => Level::WARN,
        LogLevel::Error => Level::ERROR,
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false);

    match &config.logging.file {
        Some(path) => {
            let directory = path.parent().unwrap_or(std::path::Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| format!("logging.file '{}' has no file name", path.display()))?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            builder
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .map_err(|e| e.to_string())?;
            Ok(Some(guard))
        }
        None => {
            builder.try_init().map_err(|e| e.to_string())?;
            Ok(None)
        }
    }
}

async fn run(config: Config) -> ExitCode {
    info!("homeflow {} starting", env!("CARGO_PKG_VERSION"));

    let metrics = Arc::new(Metrics::new());

    let store = match SqliteStore::open(
        std::path::Path::new(&config.database.connection),
        metrics.clone(),
        config.engine.log_retention,
    ) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("cannot open database: {}", e);
            return ExitCode::from(2);
        }
    };
    let store: Arc<dyn store::Store> = store;

    let registry = Arc::new(Registry::new(store.clone()));
    if let Err(e) = registry.hydrate() {
        error!("cannot hydrate topic registry: {}", e);
        return ExitCode::from(2);
    }

    let ticker_intervals = match config.ticker_intervals() {
        Ok(intervals) => intervals,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(1);
        }
    };
    if let Err(e) = sources::ensure_system_topics(&registry, &ticker_intervals) {
        error!("cannot create system topics: {}", e);
        return ExitCode::from(2);
    }

    let strategy_timeout = match config.strategy_timeout() {
        Ok(timeout) => timeout,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(1);
        }
    };
    let host = Arc::new(StrategyHost::new(strategy_timeout));

    let cancel = CancellationToken::new();
    let worker_cancel = CancellationToken::new();

    // Transport
    let link_settings = match LinkSettings::from_config(&config.mqtt) {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(1);
        }
    };
    let (mqtt, transport_task) =
        MqttWorker::spawn(link_settings, cancel.clone(), metrics.clone());

    // Engine
    let (core, job_rx) = EngineCore::new(
        registry.clone(),
        store.clone(),
        host.clone(),
        mqtt.clone(),
        metrics.clone(),
        config.engine.queue_capacity,
        config.engine.chain_depth_limit,
    );
    let engine = core.handle();
    let workers = engine::spawn_workers(
        core,
        job_rx,
        config.engine.evaluators,
        worker_cancel.clone(),
    );

    // MQTT intake: inbound messages become root updates.
    let (intake_tx, mut intake_rx) = mpsc::channel::<InboundMessage>(config.engine.queue_capacity);
    {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = intake_rx.recv() => match message {
                        Some(message) => engine.submit(Job::Update {
                            topic: message.topic,
                            value: value::from_payload(&message.payload),
                            trigger: TRIGGER_MQTT.to_string(),
                            depth: 0,
                        }),
                        None => break,
                    }
                }
            }
        });
    }
    spawn_subscription_manager(
        mqtt.clone(),
        config.mqtt.topics.clone(),
        intake_tx,
        cancel.clone(),
    );

    // System sources
    let _tickers = sources::spawn_tickers(ticker_intervals, engine.clone(), cancel.clone());
    let _scheduler = sources::spawn_scheduler(registry.clone(), engine.clone(), cancel.clone());
    let _heartbeat = sources::spawn_heartbeat(engine.clone(), cancel.clone());

    engine.submit(Job::Update {
        topic: sources::STARTUP_TOPIC.to_string(),
        value: serde_json::json!(chrono::Utc::now().to_rfc3339()),
        trigger: TRIGGER_SYSTEM.to_string(),
        depth: 0,
    });

    // Management API
    let state = Arc::new(AppState {
        registry: registry.clone(),
        store: store.clone(),
        host,
        mqtt: mqtt.clone(),
        metrics: metrics.clone(),
        started_at: Instant::now(),
        database: format!("sqlite ({})", config.database.connection),
    });
    let bind = format!("{}:{}", config.web.bind, config.web.port);
    let listener = match tokio::net::TcpListener::bind(bind.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot bind management API to {}: {}", bind, e);
            return ExitCode::from(2);
        }
    };
    info!("management API listening on {}", bind);
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, api::router(state))
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
            {
                error!("management API failed: {}", e);
            }
        });
    }

    // Wait for the shutdown signal.
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!("cannot listen for shutdown signal: {}", e),
    }

    shutdown(cancel, worker_cancel, engine, mqtt, workers, transport_task).await;
    info!("homeflow stopped");
    ExitCode::SUCCESS
}

/// Re-issues the configured seed subscriptions every time the link comes
/// (back) up; routes all of them into the engine intake.
fn spawn_subscription_manager(
    mqtt: MqttHandle,
    patterns: Vec<String>,
    intake_tx: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
) {
    let mut state_rx = mqtt.state_watch();
    tokio::spawn(async move {
        loop {
            if *state_rx.borrow() == LinkState::Connected {
                for pattern in &patterns {
                    match mqtt.subscribe(pattern, intake_tx.clone()).await {
                        Ok(()) => info!("subscribed to '{}'", pattern),
                        Err(e) => warn!("subscription to '{}' failed: {}", pattern, e),
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Stop intake, emit the shutdown event, drain the queue within the
/// budget, then stop the workers and close the transport.
async fn shutdown(
    cancel: CancellationToken,
    worker_cancel: CancellationToken,
    engine: EngineHandle,
    mqtt: MqttHandle,
    workers: Vec<tokio::task::JoinHandle<()>>,
    transport_task: tokio::task::JoinHandle<()>,
) {
    cancel.cancel();

    engine.submit(Job::Update {
        topic: sources::SHUTDOWN_TOPIC.to_string(),
        value: serde_json::json!(chrono::Utc::now().to_rfc3339()),
        trigger: TRIGGER_SYSTEM.to_string(),
        depth: 0,
    });

    let deadline = Instant::now() + SHUTDOWN_DRAIN_BUDGET;
    while !engine.is_idle() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if !engine.is_idle() {
        warn!("pending queue not drained within {:?}", SHUTDOWN_DRAIN_BUDGET);
    }

    worker_cancel.cancel();
    for worker in workers {
        if tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .is_err()
        {
            warn!("evaluator worker did not stop in time");
        }
    }

    mqtt.disconnect().await;
    if tokio::time::timeout(Duration::from_secs(5), transport_task)
        .await
        .is_err()
    {
        warn!("transport worker did not stop in time");
    }
}
