//! Contracts between the event ingestion core and the rest of the system.
//!
//! The ingestion core (`nats-ingest`) only needs two things from its surroundings:
//!
//! - a [`HandlerRegistry`] mapping event-type keys (the last segment of a subject) to
//!   [`EventHandler`]s, grouped by the scope the event is published under
//! - a [`SubscriptionProvider`] returning, per [`ScopeId`], the repositories and the
//!   organization whose activity that scope monitors
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐      ┌────────────────────┐      ┌──────────────────┐
//! │ SubscriptionProvider │─────▶│    nats-ingest     │─────▶│ HandlerRegistry  │
//! │ (repos, org login)   │      │ (per-scope consumer│      │ key -> handler   │
//! └──────────────────────┘      │  + ordered worker) │      └──────────────────┘
//!                               └────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use messaging::{EventHandler, EventMessage, HandlerMap, HandlerScope, ProcessingError};
//!
//! struct PushHandler;
//!
//! #[async_trait]
//! impl EventHandler for PushHandler {
//!     fn event_key(&self) -> &str { "push" }
//!     fn scope(&self) -> HandlerScope { HandlerScope::Repository }
//!     async fn handle(&self, message: &EventMessage) -> Result<(), ProcessingError> { ... }
//! }
//!
//! let registry = HandlerMap::builder().register(PushHandler).build();
//! ```

mod error;
mod handler;
mod message;
mod scope;
pub mod subject;

pub use error::ProcessingError;
pub use handler::{EventHandler, HandlerMap, HandlerMapBuilder, HandlerRegistry, HandlerScope};
pub use message::EventMessage;
pub use scope::{ScopeId, StaticSubscriptionProvider, SubscriptionInfo, SubscriptionProvider};
