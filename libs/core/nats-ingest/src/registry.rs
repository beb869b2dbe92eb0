//! Scope consumer registry.
//!
//! At most one consumer and at most one in-flight setup exist per scope. Setup and
//! teardown run on tracked tasks so a slow broker round trip for one scope never holds
//! up the caller or any other scope.

use crate::backend::{consumer_name, ensure_consumer, ConsumerBackend, ConsumerSpec};
use crate::dispatch::Dispatcher;
use crate::error::IngestError;
use crate::metrics::{self, IngestMetrics};
use crate::scoped::{scope_label, ScopedConsumer};
use crate::subjects::{scope_subjects, EventKeys};
use core_config::nats::NatsConfig;
use dashmap::{DashMap, DashSet};
use messaging::{HandlerRegistry, ScopeId, SubscriptionProvider};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Registry of running scope consumers.
#[derive(Clone)]
pub struct ScopeRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn ConsumerBackend>,
    handlers: Arc<dyn HandlerRegistry>,
    provider: Arc<dyn SubscriptionProvider>,
    keys: EventKeys,
    config: NatsConfig,
    consumers: DashMap<ScopeId, Arc<ScopedConsumer>>,
    /// Scopes with a setup in flight
    pending: DashSet<ScopeId>,
    /// Scopes stopped while their setup was in flight
    cancelled: DashSet<ScopeId>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// Clears the pending marker of a scope however its setup ends.
struct PendingGuard<'a> {
    pending: &'a DashSet<ScopeId>,
    scope_id: ScopeId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.scope_id);
    }
}

impl ScopeRegistry {
    pub fn new(
        backend: Arc<dyn ConsumerBackend>,
        handlers: Arc<dyn HandlerRegistry>,
        provider: Arc<dyn SubscriptionProvider>,
        config: NatsConfig,
    ) -> Self {
        let keys = EventKeys::from_registry(handlers.as_ref());
        Self {
            inner: Arc::new(Inner {
                backend,
                handlers,
                provider,
                keys,
                config,
                consumers: DashMap::new(),
                pending: DashSet::new(),
                cancelled: DashSet::new(),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Start consuming for a scope in the background.
    ///
    /// Returns `None` when a consumer already exists, a setup is already in flight, or
    /// the registry is shutting down. Otherwise returns the setup task; its failures are
    /// logged and leave the scope unconsumed until the next call.
    pub fn start(&self, scope_id: ScopeId) -> Option<JoinHandle<()>> {
        let inner = &self.inner;
        if inner.tasks.is_closed() {
            debug!(scope_id = %scope_id, "Registry shutting down, ignoring start");
            return None;
        }
        if inner.consumers.contains_key(&scope_id) {
            debug!(scope_id = %scope_id, "Scope consumer already running");
            return None;
        }
        if !inner.pending.insert(scope_id) {
            debug!(scope_id = %scope_id, "Scope consumer setup already in progress");
            return None;
        }
        // A setup may have completed between the first check and the marker insert.
        if inner.consumers.contains_key(&scope_id) {
            inner.pending.remove(&scope_id);
            return None;
        }
        inner.cancelled.remove(&scope_id);

        let inner = inner.clone();
        Some(self.inner.tasks.spawn(async move {
            let _pending = PendingGuard {
                pending: &inner.pending,
                scope_id,
            };

            match inner.setup(scope_id).await {
                Ok(()) => {}
                Err(IngestError::ShuttingDown) => {
                    debug!(scope_id = %scope_id, "Scope setup abandoned for shutdown");
                }
                Err(e @ IngestError::ScopeNotFound(_)) => {
                    warn!(scope_id = %scope_id, error = %e, "No subscription info for scope");
                }
                Err(e) => {
                    error!(scope_id = %scope_id, error = %e, "Failed to start scope consumer");
                }
            }
        }))
    }

    /// Recompute the subjects of a running scope and apply them in place.
    ///
    /// A scope without a consumer has nothing to update: returns `Ok(false)`. Also
    /// `Ok(false)` when the subject set is unchanged.
    pub async fn update_subjects(&self, scope_id: ScopeId) -> Result<bool, IngestError> {
        let Some(consumer) = self.consumer(scope_id) else {
            debug!(scope_id = %scope_id, "No consumer for scope, nothing to update");
            return Ok(false);
        };

        let subjects = self.inner.subjects_for(scope_id).await?;
        consumer.update_subjects(subjects).await
    }

    /// Remove a scope and tear its consumer down in the background, deleting the
    /// broker-side consumer.
    ///
    /// A stop that arrives while the scope is still being set up is honoured once the
    /// setup finishes. Returns the teardown task when there was a consumer to stop.
    pub fn stop(&self, scope_id: ScopeId) -> Option<JoinHandle<()>> {
        let inner = &self.inner;
        if inner.pending.contains(&scope_id) {
            inner.cancelled.insert(scope_id);
        }

        let Some((_, consumer)) = inner.consumers.remove(&scope_id) else {
            debug!(scope_id = %scope_id, "No running consumer for scope");
            return None;
        };
        inner.cancelled.remove(&scope_id);
        metrics::active_consumers(inner.consumers.len());

        let inner = inner.clone();
        Some(
            self.inner
                .tasks
                .spawn(async move { inner.teardown(consumer, true).await }),
        )
    }

    /// Stop every consumer, then wait for outstanding setup and teardown tasks.
    ///
    /// Broker-side durable consumers are kept so the next process resumes from their
    /// cursor. The wait is bounded by the configured shutdown timeout, after which
    /// in-flight setups are cancelled.
    pub async fn stop_all(&self) {
        let inner = &self.inner;
        inner.tasks.close();

        let ids: Vec<ScopeId> = inner.consumers.iter().map(|entry| *entry.key()).collect();
        let consumers: Vec<Arc<ScopedConsumer>> = ids
            .into_iter()
            .filter_map(|id| inner.consumers.remove(&id).map(|(_, consumer)| consumer))
            .collect();
        metrics::active_consumers(inner.consumers.len());

        info!(consumers = consumers.len(), "Stopping all scope consumers");
        futures::future::join_all(
            consumers
                .into_iter()
                .map(|consumer| inner.teardown(consumer, false)),
        )
        .await;

        if tokio::time::timeout(inner.config.shutdown_timeout, inner.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                timeout_secs = inner.config.shutdown_timeout.as_secs(),
                "Timed out waiting for scope tasks, cancelling"
            );
        }
        inner.shutdown.cancel();
    }

    pub fn contains(&self, scope_id: ScopeId) -> bool {
        self.inner.consumers.contains_key(&scope_id)
    }

    pub fn is_pending(&self, scope_id: ScopeId) -> bool {
        self.inner.pending.contains(&scope_id)
    }

    pub fn consumer(&self, scope_id: ScopeId) -> Option<Arc<ScopedConsumer>> {
        self.inner
            .consumers
            .get(&scope_id)
            .map(|entry| entry.value().clone())
    }

    pub fn scope_ids(&self) -> Vec<ScopeId> {
        self.inner.consumers.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.consumers.is_empty()
    }
}

impl Inner {
    async fn subjects_for(&self, scope_id: ScopeId) -> Result<Vec<String>, IngestError> {
        let info = self
            .provider
            .subscription_info(scope_id)
            .await
            .ok_or(IngestError::ScopeNotFound(scope_id))?;

        let subjects = scope_subjects(&self.keys, &info)?;
        if subjects.is_empty() {
            return Err(IngestError::NoSubjects(scope_id));
        }
        Ok(subjects)
    }

    async fn setup(&self, scope_id: ScopeId) -> Result<(), IngestError> {
        // Everything up to a running consumer is abandoned when shutdown fires;
        // `ScopedConsumer::start` spawns nothing until its subscription exists.
        let build = async {
            self.backend.ensure_connected().await?;
            let subjects = self.subjects_for(scope_id).await?;
            let spec = ConsumerSpec {
                durable_name: consumer_name(self.config.durable_prefix.as_deref(), Some(scope_id)),
                filter_subjects: subjects.clone(),
                replay_window_days: self.config.replay_window_days,
                ack_wait: self.config.ack_wait,
                max_ack_pending: self.config.max_ack_pending,
            };
            let handle = ensure_consumer(self.backend.as_ref(), &spec).await?;

            let dispatch = Arc::new(Dispatcher::new(
                self.handlers.clone(),
                IngestMetrics::new(scope_label(Some(scope_id))),
            ));
            let consumer = Arc::new(ScopedConsumer::new(
                Some(scope_id),
                handle,
                subjects,
                self.backend.clone(),
                dispatch,
            ));
            consumer.start().await?;
            Ok::<_, IngestError>(consumer)
        };

        let consumer = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(IngestError::ShuttingDown),
            built = build => built?,
        };

        self.consumers.insert(scope_id, consumer.clone());
        metrics::active_consumers(self.consumers.len());

        // Honour a stop or shutdown that arrived while the setup was running.
        let stopped = self.cancelled.remove(&scope_id).is_some();
        if stopped || self.tasks.is_closed() {
            if self.consumers.remove(&scope_id).is_some() {
                metrics::active_consumers(self.consumers.len());
                debug!(scope_id = %scope_id, "Scope stopped during setup");
                self.teardown(consumer, stopped).await;
            }
            return Ok(());
        }

        info!(
            scope_id = %scope_id,
            consumer = %consumer.name(),
            "Scope consumer registered"
        );
        Ok(())
    }

    async fn teardown(&self, consumer: Arc<ScopedConsumer>, delete: bool) {
        let label = scope_label(consumer.scope_id());
        let drained = consumer.stop().await;
        if drained > 0 {
            info!(
                scope = %label,
                drained,
                "Consumer stopped, queued messages returned for redelivery"
            );
        }

        if delete {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(scope = %label, "Consumer delete skipped for shutdown");
                }
                result = self.backend.delete_consumer(consumer.name()) => {
                    if let Err(e) = result {
                        warn!(scope = %label, consumer = %consumer.name(), error = %e, "Failed to delete consumer");
                    }
                }
            }
        }

        info!(scope = %label, "Consumer stopped");
    }
}
