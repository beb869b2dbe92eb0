//! Per-scope consumer: one queue, one worker, strictly ordered dispatch.
//!
//! The subscription pump only enqueues. A single worker task drains the queue and runs
//! [`Dispatch`] one delivery at a time, so dispatch order is queue order no matter how
//! the subscription is swapped underneath.

use crate::backend::{ConsumerBackend, ConsumerHandle, DeliveryStream};
use crate::delivery::Delivery;
use crate::dispatch::Dispatch;
use crate::error::IngestError;
use crate::metrics::IngestMetrics;
use crate::subjects::same_subjects;
use futures::{FutureExt, StreamExt};
use messaging::ScopeId;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Log/metric label of a consumer: `scope-<id>` or `installation`.
pub fn scope_label(scope_id: Option<ScopeId>) -> String {
    match scope_id {
        Some(id) => format!("scope-{}", id),
        None => "installation".to_string(),
    }
}

/// Consumer owned by exactly one registry entry (or the installation slot).
pub struct ScopedConsumer {
    scope_id: Option<ScopeId>,
    handle: ConsumerHandle,
    backend: Arc<dyn ConsumerBackend>,
    dispatch: Arc<dyn Dispatch>,
    metrics: IngestMetrics,
    running: Arc<AtomicBool>,
    state: Mutex<State>,
}

struct State {
    subjects: Vec<String>,
    /// Present while running
    queue: Option<Queue>,
}

struct Queue {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Delivery>>>,
    worker: JoinHandle<()>,
    pump: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl ScopedConsumer {
    pub fn new(
        scope_id: Option<ScopeId>,
        handle: ConsumerHandle,
        subjects: Vec<String>,
        backend: Arc<dyn ConsumerBackend>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Self {
        Self {
            scope_id,
            handle,
            backend,
            dispatch,
            metrics: IngestMetrics::new(scope_label(scope_id)),
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(State {
                subjects,
                queue: None,
            }),
        }
    }

    pub fn scope_id(&self) -> Option<ScopeId> {
        self.scope_id
    }

    /// Broker-side consumer name.
    pub fn name(&self) -> &str {
        &self.handle.name
    }

    pub fn handle(&self) -> &ConsumerHandle {
        &self.handle
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn subjects(&self) -> Vec<String> {
        self.state.lock().await.subjects.clone()
    }

    /// Subscribe, then spawn the worker and the pump. Returns immediately when already
    /// running.
    ///
    /// Nothing is spawned before the subscription exists, so dropping this future part
    /// way leaves no task behind.
    pub async fn start(&self) -> Result<(), IngestError> {
        let mut state = self.state.lock().await;
        if state.queue.is_some() {
            return Ok(());
        }

        let stream = self.backend.subscribe(&self.handle).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));
        let cancel = CancellationToken::new();

        self.running.store(true, Ordering::Release);
        let worker = tokio::spawn(run_worker(
            rx.clone(),
            self.dispatch.clone(),
            cancel.clone(),
            self.metrics.consumer().to_string(),
        ));
        let pump = self.spawn_pump(stream, tx.clone());

        state.queue = Some(Queue {
            tx,
            rx,
            worker,
            pump: Some(pump),
            cancel,
        });

        info!(
            consumer = %self.handle.name,
            scope = %self.metrics.consumer(),
            subjects = state.subjects.len(),
            "Consumer started"
        );
        Ok(())
    }

    /// Stop consuming and nak every delivery still queued.
    ///
    /// Idempotent. The worker is interrupted rather than awaited; a delivery it was
    /// processing is left to the broker's ack-wait. Returns the number of queued
    /// deliveries that were negatively acknowledged.
    pub async fn stop(&self) -> usize {
        let mut state = self.state.lock().await;
        let Some(queue) = state.queue.take() else {
            return 0;
        };

        self.running.store(false, Ordering::Release);

        if let Some(pump) = queue.pump {
            pump.abort();
            let _ = pump.await;
        }

        queue.cancel.cancel();
        queue.worker.abort();
        let _ = queue.worker.await;
        drop(queue.tx);

        let mut rx = queue.rx.lock().await;
        rx.close();

        let mut drained = 0;
        while let Ok(delivery) = rx.try_recv() {
            let subject = delivery.subject().to_string();
            if let Err(e) = delivery.nak().await {
                debug!(subject = %subject, error = %e, "Nak during drain failed");
            }
            drained += 1;
        }

        if drained > 0 {
            self.metrics.messages_drained(drained);
        }
        debug!(consumer = %self.handle.name, drained, "Consumer stopped");
        drained
    }

    /// Swap the filter subjects in place.
    ///
    /// Returns `Ok(false)` without touching the broker when the set is unchanged. The
    /// queue and worker survive the swap, so deliveries from the old and new
    /// subscription are never dispatched concurrently. The new subscription is opened
    /// before the old pump is stopped; if that fails the old pump and the cached subjects
    /// stay, and a retry repeats the whole update.
    pub async fn update_subjects(&self, subjects: Vec<String>) -> Result<bool, IngestError> {
        let mut state = self.state.lock().await;
        if same_subjects(&state.subjects, &subjects) {
            debug!(consumer = %self.handle.name, "Subjects unchanged");
            return Ok(false);
        }

        self.backend
            .update_filter_subjects(&self.handle.name, &subjects)
            .await?;

        if let Some(queue) = state.queue.as_mut() {
            let stream = self.backend.subscribe(&self.handle).await?;
            if let Some(pump) = queue.pump.take() {
                pump.abort();
                let _ = pump.await;
            }
            queue.pump = Some(self.spawn_pump(stream, queue.tx.clone()));
        }
        state.subjects = subjects;

        info!(
            consumer = %self.handle.name,
            subjects = state.subjects.len(),
            "Consumer subjects updated"
        );
        Ok(true)
    }

    fn spawn_pump(
        &self,
        mut stream: DeliveryStream,
        tx: mpsc::UnboundedSender<Delivery>,
    ) -> JoinHandle<()> {
        let running = self.running.clone();
        let metrics = self.metrics.clone();
        let name = self.handle.name.clone();

        tokio::spawn(async move {
            while let Some(delivery) = stream.next().await {
                enqueue(&tx, &running, &metrics, delivery).await;
            }
            debug!(consumer = %name, "Subscription ended");
        })
    }
}

/// Queue a delivery, or nak it when the consumer is not accepting work.
async fn enqueue(
    tx: &mpsc::UnboundedSender<Delivery>,
    running: &AtomicBool,
    metrics: &IngestMetrics,
    delivery: Delivery,
) {
    let rejected = if running.load(Ordering::Acquire) {
        metrics.message_received();
        match tx.send(delivery) {
            Ok(()) => return,
            Err(mpsc::error::SendError(delivery)) => delivery,
        }
    } else {
        delivery
    };

    let subject = rejected.subject().to_string();
    if let Err(e) = rejected.nak().await {
        warn!(subject = %subject, error = %e, "Failed to nak message for stopped consumer");
    }
}

async fn run_worker(
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Delivery>>>,
    dispatch: Arc<dyn Dispatch>,
    cancel: CancellationToken,
    label: String,
) {
    let mut rx = rx.lock().await;
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };
        if AssertUnwindSafe(dispatch.dispatch(delivery))
            .catch_unwind()
            .await
            .is_err()
        {
            error!(scope = %label, "Dispatch panicked, delivery left for redelivery after ack-wait");
        }
    }
    debug!(scope = %label, "Worker exited");
}
