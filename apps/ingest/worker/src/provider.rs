//! Scope subscriptions read from a JSON file
//!
//! ```json
//! {
//!   "scopes": {
//!     "42": { "repositories": ["acme/api", "acme/web"], "organization": "acme" }
//!   }
//! }
//! ```

use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use messaging::{ScopeId, SubscriptionInfo, SubscriptionProvider};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug, Deserialize)]
struct ScopesFile {
    #[serde(default)]
    scopes: HashMap<String, SubscriptionInfo>,
}

/// Scope ids touched by a reload
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScopeChanges {
    pub added: Vec<ScopeId>,
    pub removed: Vec<ScopeId>,
    pub retained: Vec<ScopeId>,
}

/// [`SubscriptionProvider`] backed by a JSON file, re-read on `reload()`
pub struct FileSubscriptionProvider {
    path: PathBuf,
    scopes: RwLock<HashMap<ScopeId, SubscriptionInfo>>,
}

impl FileSubscriptionProvider {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let scopes = read_scopes(&path)?;
        Ok(Self {
            path,
            scopes: RwLock::new(scopes),
        })
    }

    /// Re-read the file. On error the previous scopes stay in place.
    pub fn reload(&self) -> Result<ScopeChanges> {
        let fresh = read_scopes(&self.path)?;
        let mut scopes = self.scopes.write().unwrap_or_else(|p| p.into_inner());

        let before: BTreeSet<ScopeId> = scopes.keys().copied().collect();
        let after: BTreeSet<ScopeId> = fresh.keys().copied().collect();
        let changes = ScopeChanges {
            added: after.difference(&before).copied().collect(),
            removed: before.difference(&after).copied().collect(),
            retained: after.intersection(&before).copied().collect(),
        };

        *scopes = fresh;
        Ok(changes)
    }

    pub fn scope_ids(&self) -> Vec<ScopeId> {
        let scopes = self.scopes.read().unwrap_or_else(|p| p.into_inner());
        let mut ids: Vec<ScopeId> = scopes.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SubscriptionProvider for FileSubscriptionProvider {
    async fn subscription_info(&self, scope_id: ScopeId) -> Option<SubscriptionInfo> {
        self.scopes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&scope_id)
            .cloned()
    }
}

fn read_scopes(path: &Path) -> Result<HashMap<ScopeId, SubscriptionInfo>> {
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read scopes file {}", path.display()))?;
    let file: ScopesFile = serde_json::from_str(&raw)
        .wrap_err_with(|| format!("Invalid scopes file {}", path.display()))?;

    file.scopes
        .into_iter()
        .map(|(id, info)| {
            let id: i64 = id
                .trim()
                .parse()
                .map_err(|_| eyre!("Scope id '{}' is not an integer", id))?;
            Ok((ScopeId(id), info))
        })
        .collect()
}
