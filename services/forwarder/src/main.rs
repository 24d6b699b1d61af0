//! Flowgate forwarder
//!
//! Reconfigurable TCP forwarding service.
//!
//! This service:
//! - Loads a rules file mapping named rules to source/backend pairs
//! - Binds a listener per rule and relays accepted connections
//! - Resolves dynamic backends from a service registry, round robin
//! - Reconciles the live listener set on rules-file changes
//! - Publishes active-pipe snapshots to a telemetry queue

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flowgate_forwarder::config::Config;
use flowgate_forwarder::discovery::{RegistryClient, Resolver, StaticResolver};
use flowgate_forwarder::reconciler::Reconciler;
use flowgate_forwarder::telemetry::TelemetrySink;
use flowgate_forwarder::watch;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FLOWGATE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting flowgate forwarder");
    info!(
        rules_file = %config.rules_file.display(),
        registry = config.registry_url.as_deref().unwrap_or("(none)"),
        reload_fallback_secs = config.reload_fallback.as_secs(),
        "Configuration loaded"
    );

    let resolver: Arc<dyn Resolver> = match &config.registry_url {
        Some(url) => Arc::new(
            RegistryClient::new(url, config.registry_token.as_deref())
                .context("Failed to build registry client")?,
        ),
        None => {
            warn!("No registry configured; discovery-enabled rules will use their static sinks");
            Arc::new(StaticResolver::new())
        }
    };

    let (telemetry, mut drain) = TelemetrySink::channel(config.telemetry_depth);
    tokio::spawn(async move {
        while let Some(definition) = drain.recv().await {
            debug!(
                rule = %definition.name,
                source = %definition.source,
                sink = %definition.sink,
                "pipe active"
            );
        }
    });

    let reconciler = Reconciler::new(
        config.rules_file.clone(),
        resolver,
        telemetry,
        config.reload_fallback,
    );

    // First load before the watcher: a missing or unparsable rules
    // file must fail the process, not just the watch registration.
    reconciler
        .reconcile()
        .await
        .context("Initial rules load failed")?;

    let (_watcher, reload_rx) = watch::spawn_rules_watcher(&config.rules_file)
        .context("Failed to watch rules file")?;

    reconciler
        .run(reload_rx)
        .await
        .context("Reconciliation loop failed")?;

    Ok(())
}
