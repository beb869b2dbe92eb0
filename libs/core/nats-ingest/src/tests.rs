//! Scenario tests against the in-memory backend.

use crate::backend::{
    ensure_consumer, ConnectionEvent, ConsumerBackend, ConsumerHandle, ConsumerSpec,
    DeliveryStream,
};
use crate::dispatch::{Dispatch, Dispatcher};
use crate::error::IngestError;
use crate::metrics::IngestMetrics;
use crate::registry::ScopeRegistry;
use crate::scoped::ScopedConsumer;
use crate::service::IngestService;
use crate::testing::{InMemoryBackend, Outcome};
use async_trait::async_trait;
use core_config::nats::NatsConfig;
use messaging::{
    EventHandler, EventMessage, HandlerMap, HandlerRegistry, HandlerScope, ProcessingError,
    ScopeId, StaticSubscriptionProvider, SubscriptionInfo,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Barrier};
use tokio_util::sync::CancellationToken;

/// Records payloads of handled messages. Payload `slow` sleeps first, `block` never
/// returns, `fail` returns an error, `panic` panics.
#[derive(Clone)]
struct Recorder {
    key: &'static str,
    scope: HandlerScope,
    handled: Arc<Mutex<Vec<String>>>,
    entered: Arc<AtomicUsize>,
}

impl Recorder {
    fn new(key: &'static str, scope: HandlerScope) -> Self {
        Self {
            key,
            scope,
            handled: Arc::new(Mutex::new(Vec::new())),
            entered: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn handled(&self) -> Vec<String> {
        self.handled.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for Recorder {
    fn event_key(&self) -> &str {
        self.key
    }

    fn scope(&self) -> HandlerScope {
        self.scope
    }

    async fn handle(&self, message: &EventMessage) -> Result<(), ProcessingError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let payload = String::from_utf8_lossy(&message.payload).to_string();
        match payload.as_str() {
            "slow" => tokio::time::sleep(Duration::from_millis(200)).await,
            "block" => futures::future::pending::<()>().await,
            "fail" => return Err(ProcessingError::failed("boom")),
            "panic" => panic!("handler exploded"),
            _ => {}
        }
        self.handled.lock().unwrap().push(payload);
        Ok(())
    }
}

/// In-memory broker whose `subscribe` can be made to fail or stall.
struct FaultyBackend {
    inner: InMemoryBackend,
    failing_subscribes: AtomicUsize,
    subscribe_delay: Duration,
}

impl FaultyBackend {
    fn new(inner: InMemoryBackend) -> Self {
        Self {
            inner,
            failing_subscribes: AtomicUsize::new(0),
            subscribe_delay: Duration::ZERO,
        }
    }

    fn with_subscribe_delay(mut self, delay: Duration) -> Self {
        self.subscribe_delay = delay;
        self
    }

    fn fail_next_subscribe(&self) {
        self.failing_subscribes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConsumerBackend for FaultyBackend {
    async fn connect(&self, shutdown: &CancellationToken) -> Result<(), IngestError> {
        self.inner.connect(shutdown).await
    }

    async fn ensure_connected(&self) -> Result<(), IngestError> {
        self.inner.ensure_connected().await
    }

    async fn consumer_subjects(&self, name: &str) -> Result<Option<Vec<String>>, IngestError> {
        self.inner.consumer_subjects(name).await
    }

    async fn create_consumer(&self, spec: &ConsumerSpec) -> Result<ConsumerHandle, IngestError> {
        self.inner.create_consumer(spec).await
    }

    async fn update_filter_subjects(
        &self,
        name: &str,
        subjects: &[String],
    ) -> Result<(), IngestError> {
        self.inner.update_filter_subjects(name, subjects).await
    }

    async fn delete_consumer(&self, name: &str) -> Result<(), IngestError> {
        self.inner.delete_consumer(name).await
    }

    async fn subscribe(&self, consumer: &ConsumerHandle) -> Result<DeliveryStream, IngestError> {
        if !self.subscribe_delay.is_zero() {
            tokio::time::sleep(self.subscribe_delay).await;
        }
        let failing = self
            .failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(IngestError::consumer_error("transient"));
        }
        self.inner.subscribe(consumer).await
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.connection_events()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

struct Fixture {
    backend: InMemoryBackend,
    provider: Arc<StaticSubscriptionProvider>,
    push: Recorder,
    installation: Recorder,
    handlers: Arc<HandlerMap>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_backend(InMemoryBackend::new())
    }

    fn with_backend(backend: InMemoryBackend) -> Self {
        let push = Recorder::new("push", HandlerScope::Repository);
        let installation = Recorder::new("installation", HandlerScope::Installation);
        let handlers = Arc::new(
            HandlerMap::builder()
                .register(push.clone())
                .register(installation.clone())
                .build(),
        );

        let provider = Arc::new(StaticSubscriptionProvider::new());
        provider.set(ScopeId(1), SubscriptionInfo::new(vec!["acme/api".into()], None));
        provider.set(ScopeId(2), SubscriptionInfo::new(vec!["other/web".into()], None));

        Self {
            backend,
            provider,
            push,
            installation,
            handlers,
        }
    }

    fn config() -> NatsConfig {
        NatsConfig::new("nats://unused:4222")
            .with_durable_prefix("ingest")
            .with_shutdown_timeout(Duration::from_secs(2))
    }

    fn registry(&self) -> ScopeRegistry {
        ScopeRegistry::new(
            Arc::new(self.backend.clone()),
            self.handlers.clone(),
            self.provider.clone(),
            Self::config(),
        )
    }

    fn service(&self, config: NatsConfig) -> IngestService {
        IngestService::new(
            config,
            Arc::new(self.backend.clone()),
            self.handlers.clone(),
            self.provider.clone(),
        )
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn start_scope(registry: &ScopeRegistry, id: i64) {
    registry
        .start(ScopeId(id))
        .expect("setup should be spawned")
        .await
        .unwrap();
    assert!(registry.contains(ScopeId(id)));
}

#[tokio::test]
async fn test_scope_dispatches_in_delivery_order() {
    let fixture = Fixture::new();
    let registry = fixture.registry();
    start_scope(&registry, 1).await;

    let first = fixture.backend.publish("github.acme.api.push", "slow");
    let second = fixture.backend.publish("github.acme.api.push", "fast");

    wait_until("both messages", || fixture.push.handled().len() == 2).await;
    assert_eq!(fixture.push.handled(), vec!["slow", "fast"]);
    assert_eq!(fixture.backend.outcomes(first), vec![Outcome::Ack]);
    assert_eq!(fixture.backend.outcomes(second), vec![Outcome::Ack]);
}

#[tokio::test]
async fn test_blocked_scope_does_not_stall_other_scopes() {
    let fixture = Fixture::new();
    let registry = fixture.registry();
    start_scope(&registry, 1).await;
    start_scope(&registry, 2).await;

    fixture.backend.publish("github.other.web.push", "block");
    wait_until("blocked handler", || {
        fixture.push.entered.load(Ordering::SeqCst) == 1
    })
    .await;

    let sequence = fixture.backend.publish("github.acme.api.push", "x");
    wait_until("other scope", || {
        fixture.backend.outcomes(sequence) == vec![Outcome::Ack]
    })
    .await;
    assert_eq!(fixture.push.handled(), vec!["x"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_start_creates_one_consumer() {
    let fixture = Fixture::with_backend(InMemoryBackend::new().with_api_delay(Duration::from_millis(50)));
    let registry = fixture.registry();
    let barrier = Arc::new(Barrier::new(2));

    let attempts: Vec<_> = (0..2)
        .map(|_| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                registry.start(ScopeId(1))
            })
        })
        .collect();

    let mut setups = Vec::new();
    for attempt in attempts {
        setups.extend(attempt.await.unwrap());
    }
    assert_eq!(setups.len(), 1);
    assert!(registry.start(ScopeId(1)).is_none());

    for setup in setups {
        setup.await.unwrap();
    }

    assert!(registry.start(ScopeId(1)).is_none());
    assert!(!registry.is_pending(ScopeId(1)));
    assert_eq!(registry.len(), 1);
    assert_eq!(fixture.backend.created().len(), 1);
    assert_eq!(fixture.backend.consumer_names(), vec!["ingest-scope-1"]);
}

#[tokio::test]
async fn test_stop_naks_queued_messages() {
    let fixture = Fixture::new();
    let registry = fixture.registry();
    start_scope(&registry, 1).await;

    let blocked = fixture.backend.publish("github.acme.api.push", "block");
    wait_until("blocked handler", || {
        fixture.push.entered.load(Ordering::SeqCst) == 1
    })
    .await;
    let queued: Vec<u64> = (0..3)
        .map(|i| fixture.backend.publish("github.acme.api.push", format!("q{}", i)))
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    registry
        .stop(ScopeId(1))
        .expect("consumer should be stopped")
        .await
        .unwrap();

    for sequence in queued {
        assert_eq!(fixture.backend.outcomes(sequence), vec![Outcome::Nak]);
    }
    assert!(fixture.backend.outcomes(blocked).is_empty());
    assert!(fixture.push.handled().is_empty());
    assert!(!registry.contains(ScopeId(1)));
    assert_eq!(fixture.backend.deleted(), vec!["ingest-scope-1"]);
}

#[tokio::test]
async fn test_scoped_consumer_stop_reports_drained_count() {
    let fixture = Fixture::new();
    let backend: Arc<dyn ConsumerBackend> = Arc::new(fixture.backend.clone());
    let subjects = vec!["github.acme.api.push".to_string()];
    let spec = ConsumerSpec {
        durable_name: None,
        filter_subjects: subjects.clone(),
        replay_window_days: 7,
        ack_wait: Duration::from_secs(30),
        max_ack_pending: 100,
    };
    let handle = ensure_consumer(backend.as_ref(), &spec).await.unwrap();
    let dispatch = Arc::new(Dispatcher::new(fixture.handlers.clone(), IngestMetrics::new("test")));
    let consumer = ScopedConsumer::new(None, handle, subjects, backend, dispatch);

    consumer.start().await.unwrap();
    consumer.start().await.unwrap();
    assert!(consumer.is_running());

    fixture.backend.publish("github.acme.api.push", "block");
    wait_until("blocked handler", || {
        fixture.push.entered.load(Ordering::SeqCst) == 1
    })
    .await;
    fixture.backend.publish("github.acme.api.push", "a");
    fixture.backend.publish("github.acme.api.push", "b");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(consumer.stop().await, 2);
    assert!(!consumer.is_running());
    assert_eq!(consumer.stop().await, 0);
}

#[tokio::test]
async fn test_update_subjects_noop_when_unchanged() {
    let fixture = Fixture::new();
    let registry = fixture.registry();
    start_scope(&registry, 1).await;

    assert!(!registry.update_subjects(ScopeId(1)).await.unwrap());
    assert!(fixture.backend.updated().is_empty());

    fixture.provider.set(
        ScopeId(1),
        SubscriptionInfo::new(vec!["acme/api".into(), "acme/web".into()], None),
    );
    assert!(registry.update_subjects(ScopeId(1)).await.unwrap());
    let updated = fixture.backend.updated();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].0, "ingest-scope-1");
    assert_eq!(
        updated[0].1,
        vec!["github.acme.api.push", "github.acme.web.push"]
    );

    let sequence = fixture.backend.publish("github.acme.web.push", "new-repo");
    wait_until("message on new subject", || {
        fixture.backend.outcomes(sequence) == vec![Outcome::Ack]
    })
    .await;
    assert_eq!(fixture.push.handled(), vec!["new-repo"]);
}

#[tokio::test]
async fn test_update_subjects_retries_after_failed_resubscribe() {
    let fixture = Fixture::new();
    let backend = Arc::new(FaultyBackend::new(fixture.backend.clone()));
    let registry = ScopeRegistry::new(
        backend.clone(),
        fixture.handlers.clone(),
        fixture.provider.clone(),
        Fixture::config(),
    );
    start_scope(&registry, 1).await;
    let consumer = registry.consumer(ScopeId(1)).unwrap();

    fixture.provider.set(
        ScopeId(1),
        SubscriptionInfo::new(vec!["acme/api".into(), "acme/web".into()], None),
    );
    backend.fail_next_subscribe();
    assert!(registry.update_subjects(ScopeId(1)).await.is_err());

    assert_eq!(consumer.subjects().await, vec!["github.acme.api.push"]);
    assert!(consumer.is_running());
    let before_retry = fixture.backend.publish("github.acme.api.push", "still-flowing");
    wait_until("message on the old subscription", || {
        fixture.backend.outcomes(before_retry) == vec![Outcome::Ack]
    })
    .await;

    assert!(registry.update_subjects(ScopeId(1)).await.unwrap());
    assert_eq!(consumer.subjects().await.len(), 2);
    let sequence = fixture.backend.publish("github.acme.web.push", "new-repo");
    wait_until("message on new subject", || {
        fixture.backend.outcomes(sequence) == vec![Outcome::Ack]
    })
    .await;
    assert_eq!(fixture.push.handled(), vec!["still-flowing", "new-repo"]);
}

#[tokio::test]
async fn test_handler_panic_naks_and_worker_survives() {
    let fixture = Fixture::new();
    let registry = fixture.registry();
    start_scope(&registry, 1).await;

    let panicked = fixture.backend.publish("github.acme.api.push", "panic");
    let after = fixture.backend.publish("github.acme.api.push", "after");
    wait_until("message after the panic", || {
        fixture.backend.outcomes(after) == vec![Outcome::Ack]
    })
    .await;

    assert_eq!(fixture.backend.outcomes(panicked), vec![Outcome::Nak]);
    assert_eq!(fixture.push.handled(), vec!["after"]);
    assert!(registry.consumer(ScopeId(1)).unwrap().is_running());
}

#[tokio::test]
async fn test_stop_all_cancels_setup_stuck_in_subscribe() {
    let fixture = Fixture::new();
    let backend = FaultyBackend::new(fixture.backend.clone())
        .with_subscribe_delay(Duration::from_secs(30));
    let registry = ScopeRegistry::new(
        Arc::new(backend),
        fixture.handlers.clone(),
        fixture.provider.clone(),
        Fixture::config().with_shutdown_timeout(Duration::from_millis(100)),
    );

    let setup = registry.start(ScopeId(1)).expect("setup should be spawned");
    wait_until("consumer created", || !fixture.backend.created().is_empty()).await;

    tokio::time::timeout(Duration::from_secs(5), registry.stop_all())
        .await
        .expect("stop_all should give up on the stuck setup");
    setup.await.unwrap();

    assert!(!registry.contains(ScopeId(1)));
    assert!(!registry.is_pending(ScopeId(1)));
    assert!(!fixture.backend.is_routable("github.acme.api.push"));
}

#[tokio::test]
async fn test_update_subjects_without_consumer_is_noop() {
    let fixture = Fixture::new();
    let registry = fixture.registry();

    assert!(!registry.update_subjects(ScopeId(1)).await.unwrap());
    assert!(!registry.contains(ScopeId(1)));
    assert!(fixture.backend.created().is_empty());
}

#[tokio::test]
async fn test_unknown_event_acked_once() {
    let fixture = Fixture::new();
    let dispatcher = Dispatcher::new(fixture.handlers.clone(), IngestMetrics::new("test"));

    let (sequence, delivery) = fixture
        .backend
        .detached_delivery("github.acme.api.star", "{}");
    dispatcher.dispatch(delivery).await;

    assert_eq!(fixture.backend.outcomes(sequence), vec![Outcome::Ack]);
    assert!(fixture.push.handled().is_empty());
}

#[tokio::test]
async fn test_handler_failure_naks() {
    let fixture = Fixture::new();
    let dispatcher = Dispatcher::new(fixture.handlers.clone(), IngestMetrics::new("test"));

    let (failed, delivery) = fixture.backend.detached_delivery("github.acme.api.push", "fail");
    dispatcher.dispatch(delivery).await;
    let (ok, delivery) = fixture.backend.detached_delivery("github.acme.api.PUSH", "ok");
    dispatcher.dispatch(delivery).await;

    assert_eq!(fixture.backend.outcomes(failed), vec![Outcome::Nak]);
    assert_eq!(fixture.backend.outcomes(ok), vec![Outcome::Ack]);
}

#[tokio::test]
async fn test_malformed_repository_leaves_scope_unconsumed() {
    let fixture = Fixture::new();
    fixture.provider.set(
        ScopeId(3),
        SubscriptionInfo::new(vec!["acme/api".into(), "not-a-repo".into()], None),
    );
    let registry = fixture.registry();

    registry.start(ScopeId(3)).unwrap().await.unwrap();

    assert!(!registry.contains(ScopeId(3)));
    assert!(!registry.is_pending(ScopeId(3)));
    assert!(fixture.backend.created().is_empty());
}

#[tokio::test]
async fn test_unknown_scope_is_not_started() {
    let fixture = Fixture::new();
    let registry = fixture.registry();

    registry.start(ScopeId(404)).unwrap().await.unwrap();

    assert!(!registry.contains(ScopeId(404)));
    assert!(registry.start(ScopeId(404)).is_some());
}

#[tokio::test]
async fn test_stop_during_setup_is_honoured() {
    let fixture = Fixture::with_backend(InMemoryBackend::new().with_api_delay(Duration::from_millis(50)));
    let registry = fixture.registry();

    let setup = registry.start(ScopeId(1)).unwrap();
    assert!(registry.stop(ScopeId(1)).is_none());
    setup.await.unwrap();

    assert!(!registry.contains(ScopeId(1)));
    assert_eq!(fixture.backend.deleted(), vec!["ingest-scope-1"]);
    assert!(!fixture.backend.is_routable("github.acme.api.push"));
}

#[tokio::test]
async fn test_ensure_consumer_reuses_and_updates_durable() {
    let backend = InMemoryBackend::new();
    let mut spec = ConsumerSpec {
        durable_name: Some("ingest-scope-1".to_string()),
        filter_subjects: vec!["github.acme.api.push".to_string()],
        replay_window_days: 7,
        ack_wait: Duration::from_secs(30),
        max_ack_pending: 100,
    };

    let created = ensure_consumer(&backend, &spec).await.unwrap();
    let reused = ensure_consumer(&backend, &spec).await.unwrap();
    assert_eq!(created, reused);
    assert_eq!(backend.created().len(), 1);
    assert!(backend.updated().is_empty());

    spec.filter_subjects.push("github.acme.web.push".to_string());
    let updated = ensure_consumer(&backend, &spec).await.unwrap();
    assert_eq!(updated.name, "ingest-scope-1");
    assert_eq!(backend.created().len(), 1);
    assert_eq!(backend.updated().len(), 1);
}

#[tokio::test]
async fn test_ensure_consumer_ephemeral_always_creates() {
    let backend = InMemoryBackend::new();
    let spec = ConsumerSpec {
        durable_name: None,
        filter_subjects: vec!["github.acme.api.push".to_string()],
        replay_window_days: 7,
        ack_wait: Duration::from_secs(30),
        max_ack_pending: 100,
    };

    let first = ensure_consumer(&backend, &spec).await.unwrap();
    let second = ensure_consumer(&backend, &spec).await.unwrap();
    assert_ne!(first.name, second.name);
    assert!(!first.durable);
    assert_eq!(backend.created().len(), 2);
}

#[tokio::test]
async fn test_reconnect_restores_installation_consumer() {
    let fixture = Fixture::new();
    // Ephemeral consumers do not survive the simulated disconnect.
    let service = fixture.service(NatsConfig::new("nats://unused:4222"));
    service.start().await.unwrap();
    assert!(service.is_ready().await);

    let subject = "github.acme.api.installation";
    fixture.backend.publish(subject, "before");
    wait_until("first installation event", || {
        fixture.installation.handled().len() == 1
    })
    .await;

    fixture.backend.disconnect();
    wait_until("subscription lost", || !fixture.backend.is_routable(subject)).await;
    fixture.backend.reconnect();
    wait_until("installation consumer rebuilt", || {
        fixture.backend.is_routable(subject)
    })
    .await;

    fixture.backend.publish(subject, "after");
    wait_until("second installation event", || {
        fixture.installation.handled().len() == 2
    })
    .await;
    assert_eq!(fixture.installation.handled(), vec!["before", "after"]);
    assert_eq!(fixture.backend.created().len(), 2);

    service.shutdown().await;
}

#[tokio::test]
async fn test_service_shutdown_keeps_durable_consumers() {
    let fixture = Fixture::new();
    let service = fixture.service(Fixture::config());
    service.start().await.unwrap();
    service.start_scope(ScopeId(1)).unwrap().await.unwrap();
    service.start_scope(ScopeId(2)).unwrap().await.unwrap();
    assert_eq!(service.registry().len(), 2);

    service.shutdown().await;

    assert!(service.registry().is_empty());
    assert!(fixture.backend.deleted().is_empty());
    assert!(!service.is_ready().await);
    assert!(service.start_scope(ScopeId(1)).is_none());
    assert_eq!(
        fixture.backend.consumer_names(),
        vec!["ingest-installation", "ingest-scope-1", "ingest-scope-2"]
    );
}

#[test]
fn test_fixture_keys() {
    let fixture = Fixture::new();
    assert_eq!(fixture.handlers.supported_repository_event_keys(), vec!["push"]);
    assert_eq!(
        fixture.handlers.supported_installation_event_keys(),
        vec!["installation"]
    );
}
