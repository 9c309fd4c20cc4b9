#![forbid(unsafe_code)]

//! `session-relay`: session orchestrator server binary.
//!
//! Bootstraps configuration, the task store, the orchestrator, the HTTP
//! transport and the IPC server for `session-relay-ctl`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use session_relay::config::GlobalConfig;
use session_relay::engine::process::{ProcessEngineFactory, ProcessSpec};
use session_relay::engine::EngineFactory;
use session_relay::ipc::{server as ipc_server, TOKEN_FILE_NAME};
use session_relay::orchestrator::{Orchestrator, OrchestratorSettings};
use session_relay::persistence::task_store::{MemoryTaskStore, SqliteTaskStore};
use session_relay::persistence::{db, retention, TaskStore};
use session_relay::state::AppState;
use session_relay::{api, AppError, Result};

/// Time allowed for in-flight relays to checkpoint on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "session-relay", about = "Streaming agent session orchestrator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Keep tasks in memory instead of the configured database.
    #[arg(long)]
    memory: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("session-relay server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Err(err) = config.load_credentials().await {
        warn!(%err, "engine credential unavailable; submissions will be rejected");
    }
    let config = Arc::new(config);
    info!("configuration loaded");

    let ct = CancellationToken::new();

    // ── Initialize task store ───────────────────────────
    let pool = if args.memory {
        info!("using in-memory task store");
        None
    } else {
        let pool = Arc::new(db::connect(&config.db_path).await?);
        info!(path = %config.db_path.display(), "database connected");
        Some(pool)
    };

    let store: Arc<dyn TaskStore> = match &pool {
        Some(pool) => Arc::new(SqliteTaskStore::new(Arc::clone(pool))),
        None => Arc::new(MemoryTaskStore::new()),
    };

    // ── Start retention service ──────────────────────────
    let retention_handle = pool.map(|pool| {
        info!("retention service started");
        retention::spawn_retention_task(pool, config.retention_days, ct.clone())
    });

    // ── Build orchestrator and shared state ─────────────
    let factory: Arc<dyn EngineFactory> =
        Arc::new(ProcessEngineFactory::new(ProcessSpec::from_config(&config.engine)));
    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorSettings::from_config(&config),
        factory,
        store,
    ));
    let sweeper_handle = orchestrator.spawn_sweeper(ct.clone());

    let ipc_auth_token = uuid::Uuid::new_v4().to_string();
    ipc_server::write_token_file(&config.data_dir().join(TOKEN_FILE_NAME), &ipc_auth_token)?;

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        orchestrator: Arc::clone(&orchestrator),
        ipc_auth_token: Some(ipc_auth_token),
    });

    // ── Start transports ────────────────────────────────
    let ipc_handle = ipc_server::spawn_ipc_server(Arc::clone(&state), ct.clone())?;

    let http_ct = ct.clone();
    let http_state = Arc::clone(&state);
    let http_handle = tokio::spawn(async move {
        if let Err(err) = api::serve_http(http_state, http_ct).await {
            error!(%err, "http transport failed");
        }
    });

    info!("session-relay ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");

    orchestrator.shutdown(SHUTDOWN_GRACE).await;
    ct.cancel();

    let (http, ipc, sweeper) = tokio::join!(http_handle, ipc_handle, sweeper_handle);
    for (task, result) in [("http", http), ("ipc", ipc), ("sweeper", sweeper)] {
        if let Err(err) = result {
            warn!(task, %err, "background task ended abnormally");
        }
    }
    if let Some(handle) = retention_handle {
        if let Err(err) = handle.await {
            warn!(task = "retention", %err, "background task ended abnormally");
        }
    }
    info!("session-relay shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
