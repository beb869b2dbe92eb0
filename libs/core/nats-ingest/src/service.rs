//! Entry point used by the application: lifecycle of the whole ingestion core.

use crate::backend::{ConnectionEvent, ConsumerBackend, NatsBackend};
use crate::dispatch::Dispatcher;
use crate::error::IngestError;
use crate::installation::InstallationConsumer;
use crate::metrics::{self, IngestMetrics};
use crate::registry::ScopeRegistry;
use crate::scoped::scope_label;
use crate::subjects::EventKeys;
use core_config::nats::NatsConfig;
use messaging::{HandlerRegistry, ScopeId, SubscriptionProvider};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Ingestion service: connection, installation consumer and scope registry.
pub struct IngestService {
    backend: Arc<dyn ConsumerBackend>,
    registry: ScopeRegistry,
    installation: Arc<InstallationConsumer>,
    has_installation_events: bool,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl IngestService {
    pub fn new(
        config: NatsConfig,
        backend: Arc<dyn ConsumerBackend>,
        handlers: Arc<dyn HandlerRegistry>,
        provider: Arc<dyn SubscriptionProvider>,
    ) -> Self {
        let keys = EventKeys::from_registry(handlers.as_ref());
        let has_installation_events = !keys.installation.is_empty();

        let dispatch = Arc::new(Dispatcher::new(
            handlers.clone(),
            IngestMetrics::new(scope_label(None)),
        ));
        let installation = Arc::new(InstallationConsumer::new(
            backend.clone(),
            dispatch,
            keys,
            config.clone(),
        ));
        let registry = ScopeRegistry::new(backend.clone(), handlers, provider, config);

        Self {
            backend,
            registry,
            installation,
            has_installation_events,
            shutdown: CancellationToken::new(),
            supervisor: Mutex::new(None),
        }
    }

    /// Service backed by a JetStream connection to `config.url`.
    pub fn with_nats(
        config: NatsConfig,
        handlers: Arc<dyn HandlerRegistry>,
        provider: Arc<dyn SubscriptionProvider>,
    ) -> Self {
        let backend = Arc::new(NatsBackend::new(&config));
        Self::new(config, backend, handlers, provider)
    }

    /// Connect (retrying until connected or shut down) and start the installation
    /// consumer.
    ///
    /// Also starts the supervisor that rebuilds the installation consumer whenever the
    /// connection comes back after a disconnect.
    pub async fn start(&self) -> Result<(), IngestError> {
        let events = self.backend.connection_events();
        self.backend.connect(&self.shutdown).await?;

        if let Err(e) = self.installation.start().await {
            error!(error = %e, "Failed to start installation consumer");
        }

        let handle = tokio::spawn(supervise(
            events,
            self.installation.clone(),
            self.shutdown.clone(),
        ));
        if let Some(previous) = self
            .supervisor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(handle)
        {
            previous.abort();
        }

        info!("Ingestion service started");
        Ok(())
    }

    /// Start consuming for a scope. See [`ScopeRegistry::start`].
    pub fn start_scope(&self, scope_id: ScopeId) -> Option<JoinHandle<()>> {
        self.registry.start(scope_id)
    }

    /// Re-read the scope's subscription info and apply changed subjects.
    pub async fn update_scope_subjects(&self, scope_id: ScopeId) -> Result<bool, IngestError> {
        self.registry.update_subjects(scope_id).await
    }

    /// Stop consuming for a scope and delete its broker-side consumer.
    pub fn stop_scope(&self, scope_id: ScopeId) -> Option<JoinHandle<()>> {
        self.registry.stop(scope_id)
    }

    /// Stop all consumers and close the connection. Individual failures are logged and
    /// do not interrupt the sequence.
    pub async fn shutdown(&self) {
        info!("Shutting down ingestion service");
        self.shutdown.cancel();

        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }

        self.registry.stop_all().await;
        self.installation.stop().await;
        self.backend.close().await;
        info!("Ingestion service stopped");
    }

    pub fn registry(&self) -> &ScopeRegistry {
        &self.registry
    }

    pub fn is_connected(&self) -> bool {
        self.backend.is_connected()
    }

    pub async fn installation_running(&self) -> bool {
        self.installation.is_running().await
    }

    /// Connected, and the installation consumer is running when there is one to run.
    pub async fn is_ready(&self) -> bool {
        if !self.backend.is_connected() {
            return false;
        }
        !self.has_installation_events || self.installation.is_running().await
    }
}

async fn supervise(
    mut events: broadcast::Receiver<ConnectionEvent>,
    installation: Arc<InstallationConsumer>,
    shutdown: CancellationToken,
) {
    let mut disconnected = false;
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(ConnectionEvent::Disconnected) => disconnected = true,
            Ok(ConnectionEvent::Reconnected) if disconnected => {
                disconnected = false;
                metrics::reconnected();
                info!("Connection restored, rebuilding installation consumer");
                if let Err(e) = installation.restart().await {
                    error!(error = %e, "Failed to rebuild installation consumer");
                }
            }
            Ok(ConnectionEvent::Reconnected) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed connection events");
                disconnected = true;
            }
            Err(RecvError::Closed) => break,
        }
    }
}
