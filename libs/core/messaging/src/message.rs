//! Inbound event message handed to handlers.

use crate::subject;
use serde::de::DeserializeOwned;

/// An event delivered for one scope.
///
/// Acknowledgement is handled by the ingestion core; handlers only see the data.
#[derive(Debug, Clone)]
pub struct EventMessage {
    /// Subject the message was published on
    pub subject: String,
    /// Raw payload bytes (webhook JSON)
    pub payload: Vec<u8>,
    /// Broker stream sequence, when the backend exposes one
    pub stream_sequence: Option<u64>,
    /// Number of times the broker has delivered this message
    pub delivered: u64,
}

impl EventMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            stream_sequence: None,
            delivered: 1,
        }
    }

    pub fn with_delivery_info(mut self, stream_sequence: u64, delivered: u64) -> Self {
        self.stream_sequence = Some(stream_sequence);
        self.delivered = delivered;
        self
    }

    /// Event-type key (final subject segment).
    pub fn event_key(&self) -> &str {
        subject::event_key(&self.subject)
    }

    /// Unescaped owner segment, `None` for wildcard-published or malformed subjects.
    pub fn owner(&self) -> Option<String> {
        self.segment(1)
    }

    /// Unescaped repository segment, `None` for organization or installation events.
    pub fn repository(&self) -> Option<String> {
        self.segment(2)
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivered > 1
    }

    /// Deserialize the payload.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    fn segment(&self, index: usize) -> Option<String> {
        let segments: Vec<&str> = self.subject.split('.').collect();
        if segments.len() != 4 {
            return None;
        }
        match segments[index] {
            "*" | "?" | "" => None,
            raw => Some(subject::unescape_segment(raw)),
        }
    }
}
