//! Events published under `github.<org>.?.<key>`

use super::events::*;
use super::GithubEvent;
use messaging::{EventMessage, HandlerScope};
use tracing::info;

impl GithubEvent for OrganizationEvent {
    const KEY: &'static str = "organization";
    const SCOPE: HandlerScope = HandlerScope::Organization;

    fn record(&self, _message: &EventMessage) {
        info!(
            organization = %self.organization.login,
            action = %self.action,
            "Organization event"
        );
    }
}

impl GithubEvent for MemberEvent {
    const KEY: &'static str = "member";
    const SCOPE: HandlerScope = HandlerScope::Organization;

    fn record(&self, message: &EventMessage) {
        // Org login is missing from repository-level member payloads
        let organization = self
            .organization
            .as_ref()
            .map(|o| o.login.clone())
            .or_else(|| message.owner());
        info!(
            organization = ?organization,
            member = %self.member.login,
            action = %self.action,
            "Member event"
        );
    }
}

impl GithubEvent for MembershipEvent {
    const KEY: &'static str = "membership";
    const SCOPE: HandlerScope = HandlerScope::Organization;

    fn record(&self, _message: &EventMessage) {
        info!(
            organization = %self.organization.login,
            team = %self.team.slug,
            member = %self.member.login,
            action = %self.action,
            "Team membership event"
        );
    }
}

impl GithubEvent for TeamEvent {
    const KEY: &'static str = "team";
    const SCOPE: HandlerScope = HandlerScope::Organization;

    fn record(&self, _message: &EventMessage) {
        info!(
            organization = %self.organization.login,
            team_id = self.team.id,
            team = %self.team.name,
            action = %self.action,
            "Team event"
        );
    }
}
