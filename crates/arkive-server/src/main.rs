//! Arkive host binary.
//!
//! Loads configuration, initializes structured logging, brings the database
//! layer up, and holds it until SIGTERM/SIGINT, then shuts it down.

mod config;

use arkive_db::{DatabaseLifecycleManager, PooledConnectionSource};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("ARKIVE_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn init_tracing(logging: &config::LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn report_ready(pool: &PooledConnectionSource) {
    match pool.get() {
        Ok(conn) => match arkive_db::driver::validate(&conn, pool.validation_query()) {
            Ok(()) => {
                let status = pool.status();
                tracing::info!(
                    name = pool.name(),
                    connections = status.connections,
                    idle = status.idle_connections,
                    "connection source ready"
                );
            }
            Err(e) => tracing::warn!(error = %e, "validation query failed on first borrow"),
        },
        Err(e) => tracing::warn!(error = %e, "could not borrow a connection after startup"),
    }
}

fn main() -> ExitCode {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("arkive.toml"));

    let config = match config::load_config(selected_config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.logging);

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );
    if config.origin == config::ConfigOrigin::Missing {
        tracing::info!(
            path = selected_config_path.unwrap_or("<none>"),
            "config file not found, using defaults"
        );
    }

    let mut manager = DatabaseLifecycleManager::new();
    let pool = match manager.on_startup(&config.database_source()) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "database startup failed, refusing to start");
            manager.on_shutdown();
            return ExitCode::FAILURE;
        }
    };
    report_ready(&pool);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to build signal runtime");
            manager.on_shutdown();
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(shutdown_signal());

    drop(pool);
    manager.on_shutdown();
    tracing::info!("arkive shut down");
    ExitCode::SUCCESS
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
