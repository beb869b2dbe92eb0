//! Subject vocabulary shared by publishers, the ingestion core and handlers.
//!
//! Subjects are dot-delimited: `github.<owner>.<repo>.<event_key>`. Owner and repository
//! names may themselves contain dots, so those are replaced with [`DOT_ESCAPE`] before
//! being placed into a subject.

/// Leading segment of every subject.
pub const DOMAIN: &str = "github";

/// Stand-in for a literal `.` inside a subject segment.
pub const DOT_ESCAPE: char = '~';

/// Escape a repository owner, repository name or organization login for use as a
/// single subject segment.
pub fn escape_segment(segment: &str) -> String {
    segment.replace('.', &DOT_ESCAPE.to_string())
}

/// Reverse [`escape_segment`].
pub fn unescape_segment(segment: &str) -> String {
    segment.replace(DOT_ESCAPE, ".")
}

/// The event-type key of a subject: its final dot-delimited segment.
pub fn event_key(subject: &str) -> &str {
    subject.rsplit('.').next().unwrap_or(subject)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_segment() {
        assert_eq!(escape_segment("my.org"), "my~org");
        assert_eq!(escape_segment("plain"), "plain");
    }

    #[test]
    fn test_unescape_reverses_escape() {
        for raw in ["my.org", "repo.name.with.dots", "no-dots", ".leading"] {
            assert_eq!(unescape_segment(&escape_segment(raw)), raw);
        }
    }

    #[test]
    fn test_event_key() {
        assert_eq!(event_key("github.ls1intum.Artemis.pull_request"), "pull_request");
        assert_eq!(event_key("github.*.*.installation"), "installation");
        assert_eq!(event_key("push"), "push");
    }
}
