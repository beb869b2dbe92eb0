//! A broker-delivered message awaiting exactly one disposition.

use crate::error::IngestError;
use async_trait::async_trait;
use messaging::EventMessage;
use std::fmt;

/// Settles a delivered message with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), IngestError>;

    async fn nak(&self) -> Result<(), IngestError>;
}

/// A delivered message. `ack` and `nak` consume it, so a delivery can be settled once.
///
/// Dropping a delivery without settling it leaves redelivery to the broker's ack-wait.
pub struct Delivery {
    message: EventMessage,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(message: EventMessage, acker: Box<dyn Acknowledger>) -> Self {
        Self { message, acker }
    }

    pub fn message(&self) -> &EventMessage {
        &self.message
    }

    pub fn subject(&self) -> &str {
        &self.message.subject
    }

    pub async fn ack(self) -> Result<(), IngestError> {
        self.acker.ack().await
    }

    pub async fn nak(self) -> Result<(), IngestError> {
        self.acker.nak().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.message.subject)
            .field("stream_sequence", &self.message.stream_sequence)
            .field("delivered", &self.message.delivered)
            .finish()
    }
}
