//! Events published under `github.<owner>.<repo>.<key>`

use super::events::*;
use super::GithubEvent;
use messaging::{EventMessage, HandlerScope};
use tracing::info;

impl GithubEvent for PushEvent {
    const KEY: &'static str = "push";
    const SCOPE: HandlerScope = HandlerScope::Repository;

    fn record(&self, message: &EventMessage) {
        let sender = self.sender.as_ref().map(|s| s.login.as_str());
        info!(
            repository = %self.repository.full_name,
            git_ref = %self.git_ref,
            head = %self.after,
            commits = self.commits.len(),
            sender,
            redelivery = message.is_redelivery(),
            "Push received"
        );
    }
}

impl GithubEvent for PullRequestEvent {
    const KEY: &'static str = "pull_request";
    const SCOPE: HandlerScope = HandlerScope::Repository;

    fn record(&self, _message: &EventMessage) {
        info!(
            repository = %self.repository.full_name,
            number = self.number,
            action = %self.action,
            state = %self.pull_request.state,
            merged = self.pull_request.merged.unwrap_or(false),
            "Pull request event"
        );
    }
}

impl GithubEvent for PullRequestReviewEvent {
    const KEY: &'static str = "pull_request_review";
    const SCOPE: HandlerScope = HandlerScope::Repository;

    fn record(&self, _message: &EventMessage) {
        info!(
            repository = %self.repository.full_name,
            number = self.pull_request.number,
            review_id = self.review.id,
            state = %self.review.state,
            action = %self.action,
            "Pull request review event"
        );
    }
}

impl GithubEvent for PullRequestReviewCommentEvent {
    const KEY: &'static str = "pull_request_review_comment";
    const SCOPE: HandlerScope = HandlerScope::Repository;

    fn record(&self, _message: &EventMessage) {
        info!(
            repository = %self.repository.full_name,
            number = self.pull_request.number,
            comment_id = self.comment.id,
            action = %self.action,
            "Pull request review comment event"
        );
    }
}

impl GithubEvent for IssuesEvent {
    const KEY: &'static str = "issues";
    const SCOPE: HandlerScope = HandlerScope::Repository;

    fn record(&self, _message: &EventMessage) {
        info!(
            repository = %self.repository.full_name,
            number = self.issue.number,
            action = %self.action,
            state = %self.issue.state,
            "Issue event"
        );
    }
}

impl GithubEvent for IssueCommentEvent {
    const KEY: &'static str = "issue_comment";
    const SCOPE: HandlerScope = HandlerScope::Repository;

    fn record(&self, _message: &EventMessage) {
        info!(
            repository = %self.repository.full_name,
            number = self.issue.number,
            comment_id = self.comment.id,
            action = %self.action,
            "Issue comment event"
        );
    }
}

impl GithubEvent for LabelEvent {
    const KEY: &'static str = "label";
    const SCOPE: HandlerScope = HandlerScope::Repository;

    fn record(&self, _message: &EventMessage) {
        info!(
            repository = %self.repository.full_name,
            label = %self.label.name,
            action = %self.action,
            "Label event"
        );
    }
}

impl GithubEvent for MilestoneEvent {
    const KEY: &'static str = "milestone";
    const SCOPE: HandlerScope = HandlerScope::Repository;

    fn record(&self, _message: &EventMessage) {
        info!(
            repository = %self.repository.full_name,
            milestone = self.milestone.number,
            title = %self.milestone.title,
            action = %self.action,
            "Milestone event"
        );
    }
}

impl GithubEvent for RepositoryEvent {
    const KEY: &'static str = "repository";
    const SCOPE: HandlerScope = HandlerScope::Repository;

    fn record(&self, _message: &EventMessage) {
        info!(
            repository = %self.repository.full_name,
            private = self.repository.private,
            action = %self.action,
            "Repository event"
        );
    }
}
