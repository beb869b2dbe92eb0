//! Scopes (monitored workspaces) and the provider of their subscription metadata.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// Identifier of a monitored workspace or organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(pub i64);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ScopeId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// What a scope subscribes to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    /// Monitored repositories as `owner/name`
    #[serde(default)]
    pub repositories: Vec<String>,
    /// Organization login, when the scope is backed by an organization
    #[serde(default)]
    pub organization: Option<String>,
}

impl SubscriptionInfo {
    pub fn new(repositories: Vec<String>, organization: Option<String>) -> Self {
        Self {
            repositories,
            organization,
        }
    }
}

/// Source of per-scope subscription metadata.
#[async_trait]
pub trait SubscriptionProvider: Send + Sync {
    /// `None` when the scope is unknown or no longer active.
    async fn subscription_info(&self, scope_id: ScopeId) -> Option<SubscriptionInfo>;
}

/// In-memory provider, mutable at runtime. Used by tests and small deployments.
#[derive(Default)]
pub struct StaticSubscriptionProvider {
    scopes: RwLock<HashMap<ScopeId, SubscriptionInfo>>,
}

impl StaticSubscriptionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a scope, returning the previous entry.
    pub fn set(&self, scope_id: ScopeId, info: SubscriptionInfo) -> Option<SubscriptionInfo> {
        self.scopes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(scope_id, info)
    }

    pub fn remove(&self, scope_id: ScopeId) -> Option<SubscriptionInfo> {
        self.scopes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&scope_id)
    }

    pub fn scope_ids(&self) -> Vec<ScopeId> {
        let mut ids: Vec<ScopeId> = self
            .scopes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl SubscriptionProvider for StaticSubscriptionProvider {
    async fn subscription_info(&self, scope_id: ScopeId) -> Option<SubscriptionInfo> {
        self.scopes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&scope_id)
            .cloned()
    }
}
