//! Event handler trait and the registry the ingestion core dispatches through.

use crate::error::ProcessingError;
use crate::message::EventMessage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Where an event type is published, which decides the subjects a scope subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerScope {
    /// `github.<owner>.<repo>.<key>`
    Repository,
    /// `github.<org>.*.<key>`
    Organization,
    /// `github.*.*.<key>`, consumed once for the whole installation
    Installation,
}

/// Handles one event type.
///
/// # Error Handling
///
/// Any `Err` makes the core negatively acknowledge the message; the broker redelivers it
/// after its ack-wait. Because a scope processes strictly in order, nothing behind a
/// failing message for the same scope runs until the redelivery succeeds.
///
/// # Example
///
/// ```rust,ignore
/// struct IssuesHandler { store: Arc<IssueStore> }
///
/// #[async_trait]
/// impl EventHandler for IssuesHandler {
///     fn event_key(&self) -> &str { "issues" }
///     fn scope(&self) -> HandlerScope { HandlerScope::Repository }
///
///     async fn handle(&self, message: &EventMessage) -> Result<(), ProcessingError> {
///         let event: IssuesEvent = message.parse_payload()?;
///         self.store.upsert(&event).await
///             .map_err(|e| ProcessingError::failed_with_source("upsert issue", e))
///     }
/// }
/// ```
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Event-type key as it appears in the subject's last segment (lowercase).
    fn event_key(&self) -> &str;

    fn scope(&self) -> HandlerScope;

    async fn handle(&self, message: &EventMessage) -> Result<(), ProcessingError>;
}

/// Lookup used by the ingestion core.
pub trait HandlerRegistry: Send + Sync {
    fn supported_repository_event_keys(&self) -> Vec<String>;

    fn supported_organization_event_keys(&self) -> Vec<String>;

    fn supported_installation_event_keys(&self) -> Vec<String>;

    /// Handler for an event-type key, matched case-insensitively.
    fn handler_for(&self, event_key: &str) -> Option<Arc<dyn EventHandler>>;
}

/// [`HandlerRegistry`] backed by a map from lowercase key to handler.
#[derive(Default, Clone)]
pub struct HandlerMap {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerMap {
    pub fn builder() -> HandlerMapBuilder {
        HandlerMapBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn keys_for(&self, scope: HandlerScope) -> Vec<String> {
        let mut keys: Vec<String> = self
            .handlers
            .iter()
            .filter(|(_, handler)| handler.scope() == scope)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl HandlerRegistry for HandlerMap {
    fn supported_repository_event_keys(&self) -> Vec<String> {
        self.keys_for(HandlerScope::Repository)
    }

    fn supported_organization_event_keys(&self) -> Vec<String> {
        self.keys_for(HandlerScope::Organization)
    }

    fn supported_installation_event_keys(&self) -> Vec<String> {
        self.keys_for(HandlerScope::Installation)
    }

    fn handler_for(&self, event_key: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(&event_key.to_ascii_lowercase()).cloned()
    }
}

/// Builder for [`HandlerMap`].
#[derive(Default)]
pub struct HandlerMapBuilder {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerMapBuilder {
    pub fn register(self, handler: impl EventHandler + 'static) -> Self {
        self.register_arc(Arc::new(handler))
    }

    /// Register a shared handler. A later registration for the same key wins.
    pub fn register_arc(mut self, handler: Arc<dyn EventHandler>) -> Self {
        let key = handler.event_key().to_ascii_lowercase();
        if self.handlers.insert(key.clone(), handler).is_some() {
            warn!(event_key = %key, "Handler registered twice, keeping the last one");
        }
        self
    }

    pub fn build(self) -> HandlerMap {
        HandlerMap {
            handlers: self.handlers,
        }
    }
}
