//! Prometheus metrics for the ingestion core.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Metrics for one consumer (a scope or the installation consumer).
#[derive(Clone, Debug)]
pub struct IngestMetrics {
    consumer: String,
}

impl IngestMetrics {
    pub fn new(consumer: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Record a message handed to the consumer queue.
    pub fn message_received(&self) {
        counter!("ingest_messages_received_total", "consumer" => self.consumer.clone())
            .increment(1);
    }

    /// Record a message acknowledged after a successful handler run.
    pub fn message_acked(&self, duration: Duration) {
        counter!("ingest_messages_acked_total", "consumer" => self.consumer.clone())
            .increment(1);

        histogram!(
            "ingest_handler_duration_seconds",
            "consumer" => self.consumer.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a message negatively acknowledged after a handler failure.
    pub fn message_nacked(&self, event_key: &str) {
        counter!(
            "ingest_messages_nacked_total",
            "consumer" => self.consumer.clone(),
            "event_key" => event_key.to_string()
        )
        .increment(1);
    }

    /// Record a message acknowledged without a handler.
    pub fn message_unhandled(&self, event_key: &str) {
        counter!(
            "ingest_messages_unhandled_total",
            "consumer" => self.consumer.clone(),
            "event_key" => event_key.to_string()
        )
        .increment(1);
    }

    /// Record messages negatively acknowledged while a consumer was stopping.
    pub fn messages_drained(&self, count: usize) {
        counter!("ingest_messages_drained_total", "consumer" => self.consumer.clone())
            .increment(count as u64);
    }
}

/// Update the number of running scope consumers.
pub fn active_consumers(count: usize) {
    gauge!("ingest_active_consumers").set(count as f64);
}

/// Record a broker reconnect that rebuilt the installation consumer.
pub fn reconnected() {
    counter!("ingest_reconnects_total").increment(1);
}

/// Initialize Prometheus metrics.
pub fn init_metrics(
) -> Result<metrics_exporter_prometheus::PrometheusHandle, metrics_exporter_prometheus::BuildError>
{
    metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()
}
