//! GitHub Ingest Worker
//!
//! Consumes GitHub webhook events from NATS JetStream, one ordered consumer per
//! monitored scope plus a shared installation consumer.
//!
//! ## Architecture
//!
//! ```text
//! NATS JetStream (github stream)
//!   ↓ (durable pull consumer per scope: <prefix>-scope-<id>)
//! IngestService (nats-ingest)
//!   ↓ (strictly ordered, one message at a time per scope)
//! GithubEventHandler<E> (handlers)
//! ```
//!
//! Scopes come from a JSON file (`SCOPES_FILE`); `SIGHUP` re-reads it and starts,
//! updates or stops consumers to match.

mod config;
mod handlers;
mod provider;

pub use config::WorkerConfig;
pub use provider::{FileSubscriptionProvider, ScopeChanges};

use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::FromEnv;
use eyre::{Result, WrapErr};
use futures::future::join_all;
use nats_ingest::{HealthServer, IngestService};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Run the ingest worker until SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns an error if the configuration or the scopes file is invalid, or if the
/// JetStream stream does not exist.
pub async fn run() -> Result<()> {
    install_color_eyre();

    let config = WorkerConfig::from_env().wrap_err("Invalid worker configuration")?;
    init_tracing(&config.environment);

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        environment = ?config.environment,
        "Starting GitHub ingest worker"
    );

    if !config.nats.enabled {
        info!("NATS is disabled (NATS_ENABLED=false), nothing to consume");
        return Ok(());
    }

    let metrics_handle =
        nats_ingest::init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    let provider = Arc::new(FileSubscriptionProvider::load(&config.scopes_file)?);
    info!(
        path = %provider.path().display(),
        scopes = provider.scope_ids().len(),
        "Scopes loaded"
    );

    let service = Arc::new(IngestService::with_nats(
        config.nats.clone(),
        Arc::new(handlers::registry()),
        provider.clone(),
    ));

    let health_server =
        HealthServer::new(config.health_port, service.clone()).with_metrics(metrics_handle);
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            error!(error = %e, "Health server failed");
        }
    });

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {:?}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    info!(url = %config.nats.url, stream = %config.nats.stream_name, "Connecting to NATS...");
    tokio::select! {
        result = service.start() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to start ingestion");
                service.shutdown().await;
                return Err(e).wrap_err("Failed to start ingestion");
            }
        }
        _ = shutdown_rx.wait_for(|stop| *stop) => {
            service.shutdown().await;
            info!("GitHub ingest worker stopped before connecting");
            return Ok(());
        }
    }

    for scope_id in provider.scope_ids() {
        service.start_scope(scope_id);
    }

    #[cfg(unix)]
    let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())
        .wrap_err("Failed to install SIGHUP handler")?;

    loop {
        #[cfg(unix)]
        let reload = hangup.recv();
        #[cfg(not(unix))]
        let reload = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
            _ = reload => {
                info!(path = %provider.path().display(), "Reloading scopes");
                match provider.reload() {
                    Ok(changes) => apply_reload(&service, &changes).await,
                    Err(e) => warn!("Scopes reload failed, keeping current scopes: {:?}", e),
                }
            }
        }
    }

    service.shutdown().await;
    info!("GitHub ingest worker stopped");
    Ok(())
}

/// Bring running consumers in line with a reloaded scopes file
pub async fn apply_reload(service: &IngestService, changes: &ScopeChanges) {
    info!(
        added = changes.added.len(),
        removed = changes.removed.len(),
        retained = changes.retained.len(),
        "Applying scope changes"
    );

    let mut pending = Vec::new();
    pending.extend(changes.removed.iter().filter_map(|id| service.stop_scope(*id)));

    for &scope_id in &changes.retained {
        if service.registry().contains(scope_id) {
            if let Err(e) = service.update_scope_subjects(scope_id).await {
                warn!(scope_id = %scope_id, error = %e, "Failed to update scope subjects");
            }
        } else {
            pending.extend(service.start_scope(scope_id));
        }
    }

    pending.extend(changes.added.iter().filter_map(|id| service.start_scope(*id)));

    for result in join_all(pending).await {
        if let Err(e) = result {
            warn!(error = %e, "Scope task panicked");
        }
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install signal handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_config::nats::NatsConfig;
    use messaging::ScopeId;
    use nats_ingest::testing::InMemoryBackend;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn write(file: &NamedTempFile, json: &str) {
        std::fs::write(file.path(), json).unwrap();
    }

    #[tokio::test]
    async fn test_apply_reload_starts_updates_and_stops_scopes() {
        let file = NamedTempFile::new().unwrap();
        write(
            &file,
            r#"{"scopes": {"1": {"repositories": ["acme/api"]}, "2": {"repositories": ["acme/web"]}}}"#,
        );
        let provider = Arc::new(FileSubscriptionProvider::load(file.path()).unwrap());
        let backend = InMemoryBackend::new();
        let service = IngestService::new(
            NatsConfig::new("nats://unused:4222")
                .with_durable_prefix("ingest")
                .with_shutdown_timeout(Duration::from_secs(2)),
            Arc::new(backend.clone()),
            Arc::new(handlers::registry()),
            provider.clone(),
        );

        let initial = ScopeChanges {
            added: provider.scope_ids(),
            ..Default::default()
        };
        apply_reload(&service, &initial).await;
        assert_eq!(service.registry().scope_ids().len(), 2);

        write(
            &file,
            r#"{"scopes": {"2": {"repositories": ["acme/web", "acme/docs"]}, "3": {"organization": "acme"}}}"#,
        );
        let changes = provider.reload().unwrap();
        apply_reload(&service, &changes).await;

        assert!(!service.registry().contains(ScopeId(1)));
        assert!(service.registry().contains(ScopeId(2)));
        assert!(service.registry().contains(ScopeId(3)));
        assert_eq!(backend.deleted(), vec!["ingest-scope-1".to_string()]);

        let updated = backend.updated();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].0, "ingest-scope-2");
        assert!(updated[0]
            .1
            .iter()
            .any(|s| s == "github.acme.docs.push"));

        service.shutdown().await;
    }
}
