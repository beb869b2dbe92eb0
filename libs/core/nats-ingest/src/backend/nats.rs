//! JetStream pull-consumer backend.

use super::{ConnectionEvent, ConsumerBackend, ConsumerHandle, ConsumerSpec, DeliveryStream};
use crate::connection::ConnectionManager;
use crate::delivery::{Acknowledger, Delivery};
use crate::error::IngestError;
use async_nats::jetstream::consumer::{self, pull, AckPolicy, DeliverPolicy};
use async_nats::jetstream::response::Response;
use async_nats::jetstream::stream::{ConsumerError, ConsumerErrorKind, Stream};
use async_nats::jetstream::{AckKind, ErrorCode};
use async_trait::async_trait;
use core_config::nats::NatsConfig;
use futures::StreamExt;
use messaging::EventMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ephemeral consumers are reaped by the server after this much inactivity.
const EPHEMERAL_INACTIVE_THRESHOLD: Duration = Duration::from_secs(300);

/// [`ConsumerBackend`] over a JetStream stream.
pub struct NatsBackend {
    connection: Arc<ConnectionManager>,
    stream_name: String,
}

impl NatsBackend {
    pub fn new(config: &NatsConfig) -> Self {
        Self {
            connection: Arc::new(ConnectionManager::new(config)),
            stream_name: config.stream_name.clone(),
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    async fn stream(&self) -> Result<Stream, IngestError> {
        let context = self.connection.jetstream().await?;
        context
            .get_stream(&self.stream_name)
            .await
            .map_err(IngestError::from_jetstream_error)
    }

    /// Server-side info for a consumer, `None` when it does not exist.
    async fn consumer_info(&self, name: &str) -> Result<Option<consumer::Info>, IngestError> {
        let context = self.connection.jetstream().await?;
        let subject = format!("CONSUMER.INFO.{}.{}", self.stream_name, name);
        let response: Response<consumer::Info> = context
            .request(subject, &serde_json::json!({}))
            .await
            .map_err(IngestError::from_jetstream_error)?;
        consumer_info_from(response)
    }
}

fn consumer_info_from(
    response: Response<consumer::Info>,
) -> Result<Option<consumer::Info>, IngestError> {
    match response {
        Response::Ok(info) => Ok(Some(info)),
        Response::Err { error } if error.error_code() == ErrorCode::CONSUMER_NOT_FOUND => Ok(None),
        Response::Err { error } => Err(IngestError::from_jetstream_error(error)),
    }
}

fn filter_of(config: &consumer::Config) -> Vec<String> {
    if config.filter_subjects.is_empty() && !config.filter_subject.is_empty() {
        vec![config.filter_subject.clone()]
    } else {
        config.filter_subjects.clone()
    }
}

fn is_consumer_not_found(error: &ConsumerError) -> bool {
    matches!(
        error.kind(),
        ConsumerErrorKind::JetStream(err) if err.error_code() == ErrorCode::CONSUMER_NOT_FOUND
    )
}

/// Start of the replay window for a freshly created consumer.
fn replay_start(replay_window_days: u32) -> time::OffsetDateTime {
    time::OffsetDateTime::now_utc() - time::Duration::days(i64::from(replay_window_days))
}

fn pull_config(spec: &ConsumerSpec) -> pull::Config {
    let inactive_threshold = if spec.durable_name.is_some() {
        Duration::ZERO
    } else {
        EPHEMERAL_INACTIVE_THRESHOLD
    };

    pull::Config {
        durable_name: spec.durable_name.clone(),
        name: spec.durable_name.clone(),
        filter_subjects: spec.filter_subjects.clone(),
        deliver_policy: DeliverPolicy::ByStartTime {
            start_time: replay_start(spec.replay_window_days),
        },
        ack_policy: AckPolicy::Explicit,
        ack_wait: spec.ack_wait,
        max_ack_pending: spec.max_ack_pending,
        inactive_threshold,
        ..Default::default()
    }
}

#[async_trait]
impl ConsumerBackend for NatsBackend {
    async fn connect(&self, shutdown: &CancellationToken) -> Result<(), IngestError> {
        self.connection.connect_with_retry(shutdown).await?;
        // Fail early when the stream is missing; consumers cannot exist without it.
        self.stream().await?;
        info!(stream = %self.stream_name, "JetStream stream available");
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<(), IngestError> {
        self.connection.acquire().await.map(|_| ())
    }

    async fn consumer_subjects(&self, name: &str) -> Result<Option<Vec<String>>, IngestError> {
        Ok(self
            .consumer_info(name)
            .await?
            .map(|info| filter_of(&info.config)))
    }

    async fn create_consumer(&self, spec: &ConsumerSpec) -> Result<ConsumerHandle, IngestError> {
        let stream = self.stream().await?;
        let consumer = stream
            .create_consumer(pull_config(spec))
            .await
            .map_err(IngestError::from_jetstream_error)?;

        let name = consumer.cached_info().name.clone();
        debug!(
            consumer = %name,
            subjects = spec.filter_subjects.len(),
            replay_days = spec.replay_window_days,
            "Consumer created"
        );
        Ok(ConsumerHandle {
            name,
            durable: spec.durable_name.is_some(),
        })
    }

    async fn update_filter_subjects(
        &self,
        name: &str,
        subjects: &[String],
    ) -> Result<(), IngestError> {
        let info = self
            .consumer_info(name)
            .await?
            .ok_or_else(|| IngestError::consumer_error(format!("consumer {} not found", name)))?;

        let stream = self.stream().await?;
        let mut config = info.config;
        config.filter_subject = String::new();
        config.filter_subjects = subjects.to_vec();

        stream
            .update_consumer(config)
            .await
            .map_err(IngestError::from_jetstream_error)?;
        debug!(consumer = %name, subjects = subjects.len(), "Consumer filter updated");
        Ok(())
    }

    async fn delete_consumer(&self, name: &str) -> Result<(), IngestError> {
        let stream = self.stream().await?;
        match stream.delete_consumer(name).await {
            Ok(_) => {
                debug!(consumer = %name, "Consumer deleted");
                Ok(())
            }
            Err(e) if is_consumer_not_found(&e) => {
                debug!(consumer = %name, "Consumer already gone");
                Ok(())
            }
            Err(e) => Err(IngestError::from_jetstream_error(e)),
        }
    }

    async fn subscribe(&self, handle: &ConsumerHandle) -> Result<DeliveryStream, IngestError> {
        let stream = self.stream().await?;
        let consumer = stream
            .get_consumer::<pull::Config>(&handle.name)
            .await
            .map_err(IngestError::from_jetstream_error)?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| IngestError::consumer_error(e.to_string()))?;

        let label = handle.name.clone();
        Ok(messages
            .filter_map(move |result| {
                let label = label.clone();
                async move {
                    match result {
                        Ok(message) => Some(into_delivery(message)),
                        Err(e) => {
                            warn!(consumer = %label, error = %e, "Error receiving message");
                            None
                        }
                    }
                }
            })
            .boxed())
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    async fn close(&self) {
        self.connection.close().await;
    }
}

fn into_delivery(message: async_nats::jetstream::Message) -> Delivery {
    let info = message
        .info()
        .ok()
        .map(|info| (info.stream_sequence, info.delivered.max(1) as u64));

    let mut event = EventMessage::new(message.subject.to_string(), message.payload.to_vec());
    if let Some((sequence, delivered)) = info {
        event = event.with_delivery_info(sequence, delivered);
    }

    Delivery::new(event, Box::new(JetStreamAcker { message }))
}

struct JetStreamAcker {
    message: async_nats::jetstream::Message,
}

#[async_trait]
impl Acknowledger for JetStreamAcker {
    async fn ack(&self) -> Result<(), IngestError> {
        self.message
            .ack()
            .await
            .map_err(|e| IngestError::consumer_error(format!("ack failed: {}", e)))
    }

    async fn nak(&self) -> Result<(), IngestError> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| IngestError::consumer_error(format!("nak failed: {}", e)))
    }
}
