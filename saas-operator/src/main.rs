//! The SaaS operator, managing Redis Sentinel topologies & sharded Redis backups.

mod app;
mod backup;
mod config;
mod error;
#[cfg(test)]
mod fixtures;
mod k8s;
mod redis;
mod sentinel;
mod threads;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true).with_ansi(true))
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    tracing::info!(
        namespace = %cfg.namespace,
        resync_seconds = %cfg.resync_seconds,
        error_requeue_seconds = %cfg.error_requeue_seconds,
        no_replica_requeue_seconds = %cfg.no_replica_requeue_seconds,
        redis_timeout_ms = %cfg.redis_timeout_ms,
        "starting SaaS operator",
    );
    if let Err(err) = App::new(cfg).await?.spawn().await {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
