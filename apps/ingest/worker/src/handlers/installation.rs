//! Events published under `github.?.?.<key>`

use super::events::*;
use super::GithubEvent;
use messaging::{EventMessage, HandlerScope};
use tracing::info;

impl GithubEvent for InstallationEvent {
    const KEY: &'static str = "installation";
    const SCOPE: HandlerScope = HandlerScope::Installation;

    fn record(&self, _message: &EventMessage) {
        let account = self.installation.account.as_ref().map(|a| a.login.as_str());
        info!(
            installation_id = self.installation.id,
            account,
            repositories = self.repositories.len(),
            action = %self.action,
            "Installation event"
        );
    }
}

impl GithubEvent for InstallationRepositoriesEvent {
    const KEY: &'static str = "installation_repositories";
    const SCOPE: HandlerScope = HandlerScope::Installation;

    fn record(&self, _message: &EventMessage) {
        info!(
            installation_id = self.installation.id,
            added = self.repositories_added.len(),
            removed = self.repositories_removed.len(),
            action = %self.action,
            "Installation repositories changed"
        );
    }
}

impl GithubEvent for InstallationTargetEvent {
    const KEY: &'static str = "installation_target";
    const SCOPE: HandlerScope = HandlerScope::Installation;

    fn record(&self, _message: &EventMessage) {
        info!(
            account = %self.account.login,
            target_type = %self.target_type,
            action = %self.action,
            "Installation target event"
        );
    }
}
