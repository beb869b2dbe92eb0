//! NATS JetStream ingestion core for GitHub activity events.
//!
//! Every monitored scope (an organization or workspace) gets its own consumer over a
//! subject set derived from its repositories. Events are processed strictly in order
//! within a scope and concurrently across scopes. One extra consumer without a scope
//! handles installation-wide events.
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────────────┐
//!                    │    NATS JetStream    │
//!                    │   (stream "github")  │
//!                    └──────────┬───────────┘
//!            ┌──────────────────┼──────────────────┐
//!            ▼                  ▼                  ▼
//!   ┌────────────────┐ ┌────────────────┐ ┌────────────────┐
//!   │ ScopedConsumer │ │ ScopedConsumer │ │  Installation  │
//!   │   (scope 1)    │ │   (scope 2)    │ │    Consumer    │
//!   │ queue + worker │ │ queue + worker │ │ queue + worker │
//!   └───────┬────────┘ └───────┬────────┘ └───────┬────────┘
//!           └──────────────────┼──────────────────┘
//!                              ▼
//!                    ┌──────────────────────┐
//!                    │ Dispatcher → handler │
//!                    │    ack / nak once    │
//!                    └──────────────────────┘
//! ```
//!
//! # Key Features
//!
//! - **Durable per-scope consumers**: stable names, filter subjects updated in place
//! - **Strict per-scope ordering**: a single worker per scope drains a FIFO queue
//! - **Reconnect supervision**: the installation consumer is rebuilt after a reconnect
//! - **Graceful shutdown**: queued deliveries are nak'd for redelivery
//! - **Health Endpoints** and **Prometheus Metrics**
//!
//! # Example
//!
//! ```rust,ignore
//! use nats_ingest::IngestService;
//!
//! let service = IngestService::with_nats(config, handlers, provider);
//! service.start().await?;
//! service.start_scope(ScopeId(42));
//! // ...
//! service.shutdown().await;
//! ```

pub mod backend;
mod backoff;
mod connection;
mod delivery;
mod dispatch;
mod error;
mod health;
mod installation;
pub mod metrics;
mod registry;
mod scoped;
mod service;
pub mod subjects;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod tests;

pub use backend::{
    consumer_name, ensure_consumer, ConnectionEvent, ConsumerBackend, ConsumerHandle,
    ConsumerSpec, DeliveryStream, NatsBackend,
};
pub use backoff::Backoff;
pub use connection::ConnectionManager;
pub use delivery::{Acknowledger, Delivery};
pub use dispatch::{Dispatch, Dispatcher};
pub use error::IngestError;
pub use health::{HealthServer, HealthStatus};
pub use installation::InstallationConsumer;
pub use metrics::{init_metrics, IngestMetrics};
pub use registry::ScopeRegistry;
pub use scoped::{scope_label, ScopedConsumer};
pub use service::IngestService;
