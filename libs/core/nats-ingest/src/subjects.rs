//! Subject construction for scope and installation consumers.
//!
//! ```text
//! repository:    github.<owner>.<repo>.<event_key>
//! organization:  github.<org>.*.<event_key>
//! installation:  github.*.*.<event_key>
//! ```
//!
//! Literal dots in owner, repository and organization segments are escaped to `~`
//! because `.` separates subject tokens.

use crate::error::IngestError;
use messaging::subject::{escape_segment, DOMAIN};
use messaging::{HandlerRegistry, SubscriptionInfo};
use std::collections::{BTreeSet, HashSet};

/// Single-token wildcard.
pub const WILDCARD: &str = "*";

/// Event keys per publication scope, as taken from a [`HandlerRegistry`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventKeys {
    pub repository: Vec<String>,
    pub organization: Vec<String>,
    pub installation: Vec<String>,
}

impl EventKeys {
    pub fn from_registry(registry: &dyn HandlerRegistry) -> Self {
        Self {
            repository: registry.supported_repository_event_keys(),
            organization: registry.supported_organization_event_keys(),
            installation: registry.supported_installation_event_keys(),
        }
    }
}

/// Build the deduplicated subject list for one scope.
///
/// Any repository identifier that is not exactly `owner/name` fails the whole scope.
pub fn scope_subjects(
    keys: &EventKeys,
    info: &SubscriptionInfo,
) -> Result<Vec<String>, IngestError> {
    let mut subjects = SubjectList::default();

    for repository in &info.repositories {
        let (owner, name) = split_repository(repository)?;
        let owner = escape_segment(owner);
        let name = escape_segment(name);
        for key in &keys.repository {
            subjects.push(subject(&owner, &name, key));
        }
    }

    if let Some(org) = info.organization.as_deref().map(str::trim) {
        if !org.is_empty() {
            let org = escape_segment(org);
            for key in &keys.organization {
                subjects.push(subject(&org, WILDCARD, key));
            }
        }
    }

    Ok(subjects.into_vec())
}

/// Build the subject list of the installation-wide consumer.
pub fn installation_subjects(keys: &EventKeys) -> Vec<String> {
    let mut subjects = SubjectList::default();
    for key in &keys.installation {
        subjects.push(subject(WILDCARD, WILDCARD, key));
    }
    subjects.into_vec()
}

/// Order-insensitive comparison of two subject lists.
pub fn same_subjects(a: &[String], b: &[String]) -> bool {
    let a: BTreeSet<&str> = a.iter().map(String::as_str).collect();
    let b: BTreeSet<&str> = b.iter().map(String::as_str).collect();
    a == b
}

fn split_repository(identifier: &str) -> Result<(&str, &str), IngestError> {
    let mut parts = identifier.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => {
            Ok((owner, name))
        }
        _ => Err(IngestError::InvalidRepository(identifier.to_string())),
    }
}

fn subject(owner: &str, repository: &str, key: &str) -> String {
    format!(
        "{}.{}.{}.{}",
        DOMAIN,
        owner,
        repository,
        key.to_ascii_lowercase()
    )
}

/// Insertion-ordered set
#[derive(Default)]
struct SubjectList {
    seen: HashSet<String>,
    ordered: Vec<String>,
}

impl SubjectList {
    fn push(&mut self, subject: String) {
        if self.seen.insert(subject.clone()) {
            self.ordered.push(subject);
        }
    }

    fn into_vec(self) -> Vec<String> {
        self.ordered
    }
}
