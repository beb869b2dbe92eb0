//! JetStream-enabled NATS container for end-to-end tests.

use async_nats::jetstream::{self, consumer::pull, stream};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;

const CLIENT_PORT: u16 = 4222;

/// Running `nats -js` container plus a JetStream context for arranging fixtures.
///
/// The container is removed when this value is dropped, so keep it alive for the whole
/// test.
pub struct TestNats {
    _container: ContainerAsync<Nats>,
    jetstream: jetstream::Context,
    url: String,
}

impl TestNats {
    pub async fn new() -> Self {
        let container = Nats::default()
            .with_tag("latest")
            .with_cmd(["-js"])
            .start()
            .await
            .expect("Failed to start NATS container");
        let port = container
            .get_host_port_ipv4(CLIENT_PORT)
            .await
            .expect("Failed to get NATS port");

        let url = format!("nats://127.0.0.1:{}", port);
        let client = async_nats::connect(&url)
            .await
            .expect("Failed to connect to NATS");
        tracing::info!(%url, "Test NATS ready with JetStream");

        Self {
            _container: container,
            jetstream: jetstream::new(client),
            url,
        }
    }

    /// URL for the code under test to open its own connection
    pub fn connection_string(&self) -> &str {
        &self.url
    }

    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }

    /// Create an in-memory stream capturing `subjects`
    pub async fn create_stream(&self, name: &str, subjects: &[&str]) {
        self.jetstream
            .create_stream(stream::Config {
                name: name.to_string(),
                subjects: subjects.iter().map(|s| s.to_string()).collect(),
                storage: stream::StorageType::Memory,
                ..Default::default()
            })
            .await
            .expect("Failed to create stream");
    }

    /// Publish and wait for the stream ack. Returns the stream sequence.
    pub async fn publish(&self, subject: &str, payload: &str) -> u64 {
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload.to_string().into())
            .await
            .expect("Failed to publish");
        ack.await.expect("Publish was not acknowledged").sequence
    }

    /// Filter subjects of a consumer, `None` when it does not exist
    pub async fn consumer_filter(&self, stream: &str, consumer: &str) -> Option<Vec<String>> {
        let consumer = self
            .jetstream
            .get_stream(stream)
            .await
            .ok()?
            .get_consumer::<pull::Config>(consumer)
            .await
            .ok()?;
        Some(consumer.cached_info().config.filter_subjects.clone())
    }
}
