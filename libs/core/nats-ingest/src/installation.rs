//! The always-on consumer for installation-scoped events.

use crate::backend::{consumer_name, ensure_consumer, ConsumerBackend, ConsumerSpec};
use crate::dispatch::Dispatch;
use crate::error::IngestError;
use crate::scoped::ScopedConsumer;
use crate::subjects::{installation_subjects, EventKeys};
use core_config::nats::NatsConfig;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Holds the single [`ScopedConsumer`] without a scope id.
pub struct InstallationConsumer {
    backend: Arc<dyn ConsumerBackend>,
    dispatch: Arc<dyn Dispatch>,
    keys: EventKeys,
    config: NatsConfig,
    current: Mutex<Option<Arc<ScopedConsumer>>>,
}

impl InstallationConsumer {
    pub fn new(
        backend: Arc<dyn ConsumerBackend>,
        dispatch: Arc<dyn Dispatch>,
        keys: EventKeys,
        config: NatsConfig,
    ) -> Self {
        Self {
            backend,
            dispatch,
            keys,
            config,
            current: Mutex::new(None),
        }
    }

    /// Create (or reuse) the consumer and start it. No-op while one is running.
    pub async fn start(&self) -> Result<(), IngestError> {
        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|c| c.is_running()) {
            return Ok(());
        }

        let subjects = installation_subjects(&self.keys);
        if subjects.is_empty() {
            info!("No installation event handlers registered, skipping installation consumer");
            return Ok(());
        }

        let spec = ConsumerSpec {
            durable_name: consumer_name(self.config.durable_prefix.as_deref(), None),
            filter_subjects: subjects.clone(),
            replay_window_days: self.config.replay_window_days,
            ack_wait: self.config.ack_wait,
            max_ack_pending: self.config.max_ack_pending,
        };

        self.backend.ensure_connected().await?;
        let handle = ensure_consumer(self.backend.as_ref(), &spec).await?;
        let consumer = Arc::new(ScopedConsumer::new(
            None,
            handle,
            subjects,
            self.backend.clone(),
            self.dispatch.clone(),
        ));
        consumer.start().await?;
        *current = Some(consumer);
        Ok(())
    }

    /// Tear the consumer down and build it again on the current connection.
    pub async fn restart(&self) -> Result<(), IngestError> {
        self.stop().await;
        self.start().await
    }

    pub async fn stop(&self) {
        let consumer = self.current.lock().await.take();
        if let Some(consumer) = consumer {
            let drained = consumer.stop().await;
            if drained > 0 {
                info!(drained, "Installation consumer stopped, queued messages returned for redelivery");
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| c.is_running())
    }
}
