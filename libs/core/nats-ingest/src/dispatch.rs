//! Handler dispatch: settle each delivery exactly once.

use crate::delivery::Delivery;
use crate::metrics::IngestMetrics;
use async_trait::async_trait;
use futures::FutureExt;
use messaging::{HandlerRegistry, ProcessingError};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Processes one delivery to completion, including its ack or nak.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, delivery: Delivery);
}

/// Routes a delivery to the handler registered for its event key.
pub struct Dispatcher {
    registry: Arc<dyn HandlerRegistry>,
    metrics: IngestMetrics,
}

impl Dispatcher {
    pub fn new(registry: Arc<dyn HandlerRegistry>, metrics: IngestMetrics) -> Self {
        Self { registry, metrics }
    }
}

#[async_trait]
impl Dispatch for Dispatcher {
    async fn dispatch(&self, delivery: Delivery) {
        let event_key = delivery.message().event_key().to_ascii_lowercase();
        let subject = delivery.subject().to_string();

        let Some(handler) = self.registry.handler_for(&event_key) else {
            debug!(subject = %subject, event_key = %event_key, "No handler for event, acknowledging");
            self.metrics.message_unhandled(&event_key);
            if let Err(e) = delivery.ack().await {
                warn!(subject = %subject, error = %e, "Failed to ack unhandled message");
            }
            return;
        };

        let start = Instant::now();
        let outcome = AssertUnwindSafe(handler.handle(delivery.message()))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(ProcessingError::failed(format!(
                    "handler panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });

        match outcome {
            Ok(()) => {
                debug!(
                    subject = %subject,
                    event_key = %event_key,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Event handled"
                );
                self.metrics.message_acked(start.elapsed());
                if let Err(e) = delivery.ack().await {
                    warn!(subject = %subject, error = %e, "Failed to ack message");
                }
            }
            Err(e) => {
                error!(
                    subject = %subject,
                    event_key = %event_key,
                    delivered = delivery.message().delivered,
                    error = %e,
                    "Handler failed, message will be redelivered"
                );
                self.metrics.message_nacked(&event_key);
                if let Err(e) = delivery.nak().await {
                    warn!(subject = %subject, error = %e, "Failed to nak message");
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(format!("scope {}", 7));
        assert_eq!(panic_message(payload.as_ref()), "scope 7");

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
