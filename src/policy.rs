//! Fallback behaviour when no script entry applies.

use crate::error::ApiError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What to do with a request that no script entry matched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedPolicy {
    /// Respond with a 500 "no matching rule" error envelope.
    #[default]
    Error,
    /// Serve `defaults.content` as a regular completion.
    Default,
}

/// What happens once every entry of an ordered response list was consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedPolicy {
    /// Further requests are unmatched.
    #[default]
    Error,
    /// Start over at the first entry.
    Wrap,
}

/// Why a request ended up unmatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmatchedReason {
    NoScript,
    NoMatch,
    Exhausted,
}

impl fmt::Display for UnmatchedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnmatchedReason::NoScript => write!(f, "no script loaded for this token"),
            UnmatchedReason::NoMatch => write!(f, "no script entry matched the request"),
            UnmatchedReason::Exhausted => {
                write!(f, "all scripted responses have been consumed")
            }
        }
    }
}

/// Outcome decided by the policy.
#[derive(Debug)]
pub enum Fallback {
    Content(String),
    Error(ApiError),
}

impl UnmatchedPolicy {
    pub fn decide(self, reason: UnmatchedReason, default_content: Option<&str>) -> Fallback {
        match (self, default_content) {
            (UnmatchedPolicy::Default, Some(content)) => Fallback::Content(content.to_string()),
            _ => Fallback::Error(ApiError::Unmatched(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_policy() {
        match UnmatchedPolicy::Error.decide(UnmatchedReason::NoMatch, Some("ignored")) {
            Fallback::Error(err) => {
                assert_eq!(err.status(), 500);
                assert!(err.to_string().contains("no script entry matched"));
            }
            Fallback::Content(_) => panic!("Expected error fallback"),
        }
    }

    #[test]
    fn test_default_policy() {
        match UnmatchedPolicy::Default.decide(UnmatchedReason::Exhausted, Some("fallback")) {
            Fallback::Content(content) => assert_eq!(content, "fallback"),
            Fallback::Error(_) => panic!("Expected default content"),
        }
    }

    #[test]
    fn test_policy_names() {
        let policy: UnmatchedPolicy = serde_json::from_str(r#""error""#).unwrap();
        assert_eq!(policy, UnmatchedPolicy::Error);
        let exhausted: ExhaustedPolicy = serde_json::from_str(r#""wrap""#).unwrap();
        assert_eq!(exhausted, ExhaustedPolicy::Wrap);
        assert!(serde_json::from_str::<UnmatchedPolicy>(r#""passthrough""#).is_err());
    }
}
