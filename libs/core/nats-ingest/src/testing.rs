//! In-memory [`ConsumerBackend`] for tests.
//!
//! Routes published messages to subscribed consumers with NATS subject matching, records
//! every consumer API call and every ack/nak per stream sequence, and can simulate a
//! connection drop and recovery.

use crate::backend::{ConnectionEvent, ConsumerBackend, ConsumerHandle, ConsumerSpec, DeliveryStream};
use crate::delivery::{Acknowledger, Delivery};
use crate::error::IngestError;
use async_trait::async_trait;
use futures::StreamExt;
use messaging::EventMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

/// Disposition recorded for a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Nak,
}

/// Does `subject` match the NATS filter `filter` (`*` one token, `>` the rest)?
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(f), Some(s)) if f == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[derive(Default)]
struct ConsumerState {
    subjects: Vec<String>,
    durable: bool,
    subscriber: Option<mpsc::UnboundedSender<Delivery>>,
}

#[derive(Default)]
struct State {
    next_sequence: u64,
    next_ephemeral: u64,
    consumers: HashMap<String, ConsumerState>,
    outcomes: HashMap<u64, Vec<Outcome>>,
    created: Vec<ConsumerSpec>,
    updated: Vec<(String, Vec<String>)>,
    deleted: Vec<String>,
}

struct Shared {
    state: Mutex<State>,
    connected: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn record(&self, sequence: u64, outcome: Outcome) -> Result<(), IngestError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(IngestError::Connection("disconnected".to_string()));
        }
        self.lock().outcomes.entry(sequence).or_default().push(outcome);
        Ok(())
    }
}

/// Broker stand-in; clones share the same state.
#[derive(Clone)]
pub struct InMemoryBackend {
    shared: Arc<Shared>,
    api_delay: Duration,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// A connected backend without consumers.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                connected: AtomicBool::new(true),
                events,
            }),
            api_delay: Duration::ZERO,
        }
    }

    /// Delay every consumer API call, widening race windows in tests.
    pub fn with_api_delay(mut self, delay: Duration) -> Self {
        self.api_delay = delay;
        self
    }

    /// Publish to the stream, delivering to every subscribed consumer whose filter
    /// matches. Returns the stream sequence.
    pub fn publish(&self, subject: &str, payload: impl Into<Vec<u8>>) -> u64 {
        let payload = payload.into();
        let mut state = self.shared.lock();
        state.next_sequence += 1;
        let sequence = state.next_sequence;

        for consumer in state.consumers.values_mut() {
            if !consumer.subjects.iter().any(|f| subject_matches(f, subject)) {
                continue;
            }
            if let Some(tx) = &consumer.subscriber {
                let delivery = self.delivery_for(sequence, subject, payload.clone());
                if tx.send(delivery).is_err() {
                    consumer.subscriber = None;
                }
            }
        }
        sequence
    }

    /// A delivery that bypasses routing, for exercising dispatch directly.
    pub fn detached_delivery(&self, subject: &str, payload: impl Into<Vec<u8>>) -> (u64, Delivery) {
        let sequence = {
            let mut state = self.shared.lock();
            state.next_sequence += 1;
            state.next_sequence
        };
        (sequence, self.delivery_for(sequence, subject, payload.into()))
    }

    /// Dispositions recorded for a stream sequence, in order.
    pub fn outcomes(&self, sequence: u64) -> Vec<Outcome> {
        self.shared
            .lock()
            .outcomes
            .get(&sequence)
            .cloned()
            .unwrap_or_default()
    }

    pub fn created(&self) -> Vec<ConsumerSpec> {
        self.shared.lock().created.clone()
    }

    pub fn updated(&self) -> Vec<(String, Vec<String>)> {
        self.shared.lock().updated.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.shared.lock().deleted.clone()
    }

    pub fn consumer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.lock().consumers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a message on `subject` would reach a live subscription right now.
    pub fn is_routable(&self, subject: &str) -> bool {
        self.shared.lock().consumers.values().any(|c| {
            c.subscriber.as_ref().is_some_and(|tx| !tx.is_closed())
                && c.subjects.iter().any(|f| subject_matches(f, subject))
        })
    }

    /// Drop the connection: subscriptions end and ephemeral consumers are lost.
    pub fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::Release);
        {
            let mut state = self.shared.lock();
            state.consumers.retain(|_, c| c.durable);
            for consumer in state.consumers.values_mut() {
                consumer.subscriber = None;
            }
        }
        let _ = self.shared.events.send(ConnectionEvent::Disconnected);
    }

    pub fn reconnect(&self) {
        self.shared.connected.store(true, Ordering::Release);
        let _ = self.shared.events.send(ConnectionEvent::Reconnected);
    }

    fn delivery_for(&self, sequence: u64, subject: &str, payload: Vec<u8>) -> Delivery {
        let message = EventMessage::new(subject, payload).with_delivery_info(sequence, 1);
        Delivery::new(
            message,
            Box::new(InMemoryAcker {
                sequence,
                shared: self.shared.clone(),
            }),
        )
    }

    fn check_connected(&self) -> Result<(), IngestError> {
        if self.shared.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(IngestError::Connection("disconnected".to_string()))
        }
    }

    async fn api_call(&self) -> Result<(), IngestError> {
        if !self.api_delay.is_zero() {
            tokio::time::sleep(self.api_delay).await;
        }
        self.check_connected()
    }
}

struct InMemoryAcker {
    sequence: u64,
    shared: Arc<Shared>,
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self) -> Result<(), IngestError> {
        self.shared.record(self.sequence, Outcome::Ack)
    }

    async fn nak(&self) -> Result<(), IngestError> {
        self.shared.record(self.sequence, Outcome::Nak)
    }
}

#[async_trait]
impl ConsumerBackend for InMemoryBackend {
    async fn connect(&self, _shutdown: &CancellationToken) -> Result<(), IngestError> {
        self.check_connected()
    }

    async fn ensure_connected(&self) -> Result<(), IngestError> {
        self.check_connected()
    }

    async fn consumer_subjects(&self, name: &str) -> Result<Option<Vec<String>>, IngestError> {
        self.api_call().await?;
        Ok(self
            .shared
            .lock()
            .consumers
            .get(name)
            .map(|c| c.subjects.clone()))
    }

    async fn create_consumer(&self, spec: &ConsumerSpec) -> Result<ConsumerHandle, IngestError> {
        self.api_call().await?;
        let mut state = self.shared.lock();
        state.created.push(spec.clone());

        let name = match &spec.durable_name {
            Some(name) => name.clone(),
            None => {
                state.next_ephemeral += 1;
                format!("ephemeral-{}", state.next_ephemeral)
            }
        };
        state.consumers.insert(
            name.clone(),
            ConsumerState {
                subjects: spec.filter_subjects.clone(),
                durable: spec.durable_name.is_some(),
                subscriber: None,
            },
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
        self.api_call().await?;
        let mut state = self.shared.lock();
        state.updated.push((name.to_string(), subjects.to_vec()));
        let consumer = state
            .consumers
            .get_mut(name)
            .ok_or_else(|| IngestError::consumer_error(format!("consumer {} not found", name)))?;
        consumer.subjects = subjects.to_vec();
        Ok(())
    }

    async fn delete_consumer(&self, name: &str) -> Result<(), IngestError> {
        self.api_call().await?;
        let mut state = self.shared.lock();
        state.deleted.push(name.to_string());
        state.consumers.remove(name);
        Ok(())
    }

    async fn subscribe(&self, handle: &ConsumerHandle) -> Result<DeliveryStream, IngestError> {
        self.check_connected()?;
        let mut state = self.shared.lock();
        let consumer = state.consumers.get_mut(&handle.name).ok_or_else(|| {
            IngestError::consumer_error(format!("consumer {} not found", handle.name))
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        consumer.subscriber = Some(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.shared.connected.store(false, Ordering::Release);
        let mut state = self.shared.lock();
        for consumer in state.consumers.values_mut() {
            consumer.subscriber = None;
        }
    }
}
