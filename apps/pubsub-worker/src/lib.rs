//! Pub/Sub Worker Service
//!
//! Subscribes one handler to every configured topic on whichever backend
//! `MESSAGING_BACKEND` selects, and serves health and metrics over HTTP.
//!
//! ```text
//! Redis Streams / NATS
//!   ↓ (Messaging::subscribe_multiple)
//! LoggingHandler
//!
//! axum: /health /ready /metrics
//! ```

pub mod config;
pub mod handlers;
pub mod routes;

use crate::config::WorkerConfig;
use crate::handlers::LoggingHandler;
use crate::routes::AppState;
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use pubsub::Messaging;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

/// Run the worker until SIGINT or SIGTERM.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    pubsub::init_metrics().wrap_err("Failed to install metrics recorder")?;

    let config = WorkerConfig::from_env().wrap_err("Failed to load worker configuration")?;
    info!(
        backend = %config.messaging.backend(),
        topics = ?config.topics,
        environment = ?environment,
        "Starting pubsub worker"
    );

    let messaging = Messaging::connect(config.messaging.clone())
        .await
        .wrap_err("Failed to connect to message broker")?;

    let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
    if let Err(e) = messaging
        .subscribe_multiple(&topics, Arc::new(LoggingHandler))
        .await
    {
        // Topics that did subscribe keep running; readiness reports the rest.
        if e.failures().len() == topics.len() {
            return Err(e).wrap_err("No topic could be subscribed");
        }
        warn!(error = %e, "Some topics failed to subscribe");
    }

    let state = AppState {
        messaging: messaging.clone(),
        health_timeout: config.health_timeout,
    };
    let addr = config.server.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;
    info!(addr = %addr, "Health server listening");

    let served = axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = shutdown_signal().await {
                error!(error = %e, "Error waiting for shutdown signal");
            }
        })
        .await;

    if let Err(e) = messaging.close().await {
        warn!(error = %e, "Messaging closed with errors");
    }
    served.wrap_err("Health server failed")?;

    info!("Pubsub worker stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .wrap_err("Failed to install SIGTERM handler")?;
    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = ctrl_c => {
            result.wrap_err("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
