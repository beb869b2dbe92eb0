//! Owner of the single NATS connection.
//!
//! Callers never keep a raw client across suspension points: they `acquire()` a clone
//! for one operation. The manager can `invalidate()` the handle, after which the next
//! `acquire()` connects again.

use crate::backend::ConnectionEvent;
use crate::backoff::Backoff;
use crate::error::IngestError;
use async_nats::{Client, ConnectOptions, Event};
use core_config::nats::NatsConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Supervised NATS connection.
pub struct ConnectionManager {
    url: String,
    client_name: String,
    request_timeout: Duration,
    backoff: Backoff,
    /// Shared with the client event callback
    connected: Arc<AtomicBool>,
    client: RwLock<Option<Client>>,
    connect_lock: Mutex<()>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(config: &NatsConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            url: config.url.clone(),
            client_name: config.client_name.clone(),
            request_timeout: config.request_timeout,
            backoff: Backoff::new(config.reconnect_delay, config.reconnect_max_delay),
            connected: Arc::new(AtomicBool::new(false)),
            client: RwLock::new(None),
            connect_lock: Mutex::new(()),
            events,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Connection state changes reported by the client.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Return the live client, connecting once if there is none.
    ///
    /// Concurrent callers never open two connections: the slow path re-checks under
    /// `connect_lock` before connecting.
    pub async fn acquire(&self) -> Result<Client, IngestError> {
        if self.is_connected() {
            if let Some(client) = self.current() {
                return Ok(client);
            }
        }

        let _guard = self.connect_lock.lock().await;
        if let Some(client) = self.current() {
            return Ok(client);
        }

        let client = self.connect_once().await?;
        *self.client.write().unwrap_or_else(|p| p.into_inner()) = Some(client.clone());
        self.connected.store(true, Ordering::Release);
        info!(url = %self.url, "Connected to NATS");
        Ok(client)
    }

    /// Connect, retrying with exponential backoff until connected or `shutdown` fires.
    ///
    /// Only connection-level failures are retried; a bad URL is returned at once.
    pub async fn connect_with_retry(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Client, IngestError> {
        let mut attempt: u32 = 0;
        loop {
            if shutdown.is_cancelled() {
                return Err(IngestError::ShuttingDown);
            }

            match self.acquire().await {
                Ok(client) => {
                    if attempt > 0 {
                        info!(attempts = attempt + 1, "NATS connection established after retries");
                    }
                    return Ok(client);
                }
                Err(e) if !e.is_connection() => return Err(e),
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        url = %self.url,
                        error = %e,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "NATS connection failed, retrying"
                    );
                    attempt = attempt.saturating_add(1);

                    tokio::select! {
                        _ = shutdown.cancelled() => return Err(IngestError::ShuttingDown),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// JetStream context on the live connection.
    pub async fn jetstream(&self) -> Result<async_nats::jetstream::Context, IngestError> {
        let client = self.acquire().await?;
        let mut context = async_nats::jetstream::new(client);
        context.set_timeout(self.request_timeout);
        Ok(context)
    }

    /// Forget the current client; the next `acquire()` reconnects.
    pub fn invalidate(&self) -> Option<Client> {
        self.connected.store(false, Ordering::Release);
        self.client.write().unwrap_or_else(|p| p.into_inner()).take()
    }

    /// Flush and drop the connection.
    pub async fn close(&self) {
        if let Some(client) = self.invalidate() {
            if let Err(e) = client.flush().await {
                debug!(error = %e, "Flush before close failed");
            }
            info!(url = %self.url, "NATS connection closed");
        }
    }

    fn current(&self) -> Option<Client> {
        self.client.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    async fn connect_once(&self) -> Result<Client, IngestError> {
        let events = self.events.clone();
        let connected = self.connected.clone();
        let options = ConnectOptions::new()
            .name(&self.client_name)
            .request_timeout(Some(self.request_timeout))
            .connection_timeout(self.request_timeout.min(Duration::from_secs(10)))
            .event_callback(move |event| {
                let events = events.clone();
                let connected = connected.clone();
                async move { apply_event(&event, &connected, &events) }
            });

        Ok(options.connect(self.url.as_str()).await?)
    }
}

/// Track a client event in the connected flag and forward it to subscribers.
fn apply_event(
    event: &Event,
    connected: &AtomicBool,
    events: &broadcast::Sender<ConnectionEvent>,
) {
    match event {
        Event::Disconnected => {
            connected.store(false, Ordering::Release);
            warn!("NATS connection lost");
            let _ = events.send(ConnectionEvent::Disconnected);
        }
        Event::Connected => {
            connected.store(true, Ordering::Release);
            info!("NATS connection (re)established");
            let _ = events.send(ConnectionEvent::Reconnected);
        }
        other => debug!(event = %other, "NATS client event"),
    }
}
