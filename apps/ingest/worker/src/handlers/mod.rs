//! GitHub event handlers
//!
//! Each webhook payload type implements [`GithubEvent`]; [`GithubEventHandler`] turns it
//! into a [`messaging::EventHandler`] that decodes the payload and records it.
//! Persistence lives in the services downstream of this worker.

mod installation;
mod organization;
mod repository;

pub mod events;

use async_trait::async_trait;
use messaging::{EventHandler, EventMessage, HandlerMap, HandlerScope, ProcessingError};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use tracing::instrument;

/// A webhook payload with its subject key and publication scope
pub trait GithubEvent: DeserializeOwned + Send + 'static {
    /// Last subject segment (`github.<owner>.<repo>.<KEY>`)
    const KEY: &'static str;
    const SCOPE: HandlerScope;

    /// Record the decoded event
    fn record(&self, message: &EventMessage);
}

/// Decodes `E` from the message payload and records it
pub struct GithubEventHandler<E> {
    _event: PhantomData<fn() -> E>,
}

impl<E> Default for GithubEventHandler<E> {
    fn default() -> Self {
        Self {
            _event: PhantomData,
        }
    }
}

#[async_trait]
impl<E: GithubEvent> EventHandler for GithubEventHandler<E> {
    fn event_key(&self) -> &str {
        E::KEY
    }

    fn scope(&self) -> HandlerScope {
        E::SCOPE
    }

    #[instrument(skip(self, message), fields(subject = %message.subject, event_key = E::KEY))]
    async fn handle(&self, message: &EventMessage) -> Result<(), ProcessingError> {
        let event: E = message.parse_payload()?;
        event.record(message);
        Ok(())
    }
}

fn handler<E: GithubEvent>() -> GithubEventHandler<E> {
    GithubEventHandler::default()
}

/// Registry with every GitHub event the worker handles
pub fn registry() -> HandlerMap {
    use events::*;

    HandlerMap::builder()
        // Repository scope
        .register(handler::<PushEvent>())
        .register(handler::<PullRequestEvent>())
        .register(handler::<PullRequestReviewEvent>())
        .register(handler::<PullRequestReviewCommentEvent>())
        .register(handler::<IssuesEvent>())
        .register(handler::<IssueCommentEvent>())
        .register(handler::<LabelEvent>())
        .register(handler::<MilestoneEvent>())
        .register(handler::<RepositoryEvent>())
        // Organization scope
        .register(handler::<OrganizationEvent>())
        .register(handler::<MemberEvent>())
        .register(handler::<MembershipEvent>())
        .register(handler::<TeamEvent>())
        // Installation scope
        .register(handler::<InstallationEvent>())
        .register(handler::<InstallationRepositoriesEvent>())
        .register(handler::<InstallationTargetEvent>())
        .build()
}
