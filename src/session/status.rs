use serde::Serialize;

/// Approval/resolution outcome recorded for a session.
///
/// A session with no status at all is represented as `None` by the store;
/// that is the "new session" case and is distinct from
/// [`SessionStatus::AwaitingApproval`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum SessionStatus {
    /// The user has been asked to approve; outcome still pending
    AwaitingApproval,
    /// Upstream resolved; the pipe is about to start
    Approved,
    /// An upstream failure was already reported once; the next attempt is refused
    CredentialRejected,
    /// Terminal error text to surface to the approving user
    Failed(String),
}

impl SessionStatus {
    pub fn failed<S: Into<String>>(msg: S) -> Self {
        Self::Failed(msg.into())
    }

    /// Whether a concurrent observer can stop waiting on this status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::AwaitingApproval)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitingApproval => f.write_str("awaiting approval"),
            Self::Approved => f.write_str("ssh pipe approved"),
            Self::CredentialRejected => f.write_str("bad upstream credential"),
            Self::Failed(msg) => f.write_str(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_text_never_collides_with_sentinels() {
        let text = SessionStatus::failed("bad upstream credential");
        assert_ne!(text, SessionStatus::CredentialRejected);
        assert_eq!(text.to_string(), SessionStatus::CredentialRejected.to_string());

        let ok = SessionStatus::failed("ok");
        assert_ne!(ok, SessionStatus::Approved);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SessionStatus::AwaitingApproval.is_terminal());
        assert!(SessionStatus::Approved.is_terminal());
        assert!(SessionStatus::CredentialRejected.is_terminal());
        assert!(SessionStatus::failed("boom").is_terminal());
    }

    #[test]
    fn test_status_json() {
        let json = serde_json::to_value(SessionStatus::failed("denied")).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["message"], "denied");

        let json = serde_json::to_value(SessionStatus::Approved).unwrap();
        assert_eq!(json["state"], "approved");
    }
}
