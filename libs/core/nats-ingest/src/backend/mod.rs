//! Broker seam: what the ingestion core needs from JetStream.
//!
//! [`NatsBackend`] talks to a real server; `testing::InMemoryBackend` implements the same
//! trait for tests.

mod nats;

pub use nats::NatsBackend;

use crate::delivery::Delivery;
use crate::error::IngestError;
use crate::subjects::same_subjects;
use async_trait::async_trait;
use futures::stream::BoxStream;
use messaging::ScopeId;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Messages pushed by the broker for one consumer, in delivery order.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Connection state changes observed on the broker link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Disconnected,
    /// The link is back after a disconnect (or first established)
    Reconnected,
}

/// Desired broker-side consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSpec {
    /// `None` creates an ephemeral consumer
    pub durable_name: Option<String>,
    pub filter_subjects: Vec<String>,
    pub replay_window_days: u32,
    pub ack_wait: Duration,
    pub max_ack_pending: i64,
}

/// Broker-side consumer the core subscribes through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerHandle {
    /// Durable name, or the server-assigned name of an ephemeral consumer
    pub name: String,
    pub durable: bool,
}

/// Broker operations used by the ingestion core.
#[async_trait]
pub trait ConsumerBackend: Send + Sync + 'static {
    /// Connect, retrying until connected or `shutdown` is cancelled.
    async fn connect(&self, shutdown: &CancellationToken) -> Result<(), IngestError>;

    /// Idempotent: return once a live connection exists.
    async fn ensure_connected(&self) -> Result<(), IngestError>;

    /// Filter subjects of an existing consumer, `None` when it does not exist.
    async fn consumer_subjects(&self, name: &str) -> Result<Option<Vec<String>>, IngestError>;

    async fn create_consumer(&self, spec: &ConsumerSpec) -> Result<ConsumerHandle, IngestError>;

    /// Replace the filter subjects of an existing consumer, keeping its identity.
    async fn update_filter_subjects(
        &self,
        name: &str,
        subjects: &[String],
    ) -> Result<(), IngestError>;

    /// Delete a consumer. Deleting one that does not exist succeeds.
    async fn delete_consumer(&self, name: &str) -> Result<(), IngestError>;

    /// Start receiving messages of a consumer.
    async fn subscribe(&self, consumer: &ConsumerHandle) -> Result<DeliveryStream, IngestError>;

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;

    fn is_connected(&self) -> bool;

    async fn close(&self);
}

/// Reuse the durable consumer named in `spec` or create it.
///
/// An existing durable whose filter differs is updated in place so its redelivery cursor
/// survives; without a durable name an ephemeral consumer is always created.
pub async fn ensure_consumer(
    backend: &dyn ConsumerBackend,
    spec: &ConsumerSpec,
) -> Result<ConsumerHandle, IngestError> {
    let Some(name) = spec.durable_name.as_deref() else {
        debug!(subjects = spec.filter_subjects.len(), "Creating ephemeral consumer");
        return backend.create_consumer(spec).await;
    };

    match backend.consumer_subjects(name).await? {
        Some(current) if same_subjects(&current, &spec.filter_subjects) => {
            debug!(consumer = %name, "Reusing durable consumer");
        }
        Some(_) => {
            info!(
                consumer = %name,
                subjects = spec.filter_subjects.len(),
                "Updating filter subjects of durable consumer"
            );
            backend
                .update_filter_subjects(name, &spec.filter_subjects)
                .await?;
        }
        None => {
            info!(consumer = %name, "Creating durable consumer");
            return backend.create_consumer(spec).await;
        }
    }

    Ok(ConsumerHandle {
        name: name.to_string(),
        durable: true,
    })
}

/// Stable durable name for a scope (`None` = installation consumer).
///
/// Returns `None` when no prefix is configured, i.e. consumers are ephemeral.
pub fn consumer_name(prefix: Option<&str>, scope_id: Option<ScopeId>) -> Option<String> {
    let prefix = prefix?;
    Some(match scope_id {
        Some(id) => format!("{}-scope-{}", prefix, id),
        None => format!("{}-installation", prefix),
    })
}
