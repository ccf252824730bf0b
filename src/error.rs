//! Error types for script loading and request handling.

use crate::openai::{ErrorBody, ErrorResponse};
use crate::policy::UnmatchedReason;
use thiserror::Error;

/// A script could not be loaded. The previously active script stays in place.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("invalid script JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid path glob `{pattern}`: {source}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("invalid JSON path `{expr}`: {reason}")]
    InvalidJsonPath { expr: String, reason: String },

    #[error("{location}: invalid template: {source}")]
    InvalidTemplate {
        location: String,
        #[source]
        source: handlebars::TemplateError,
    },

    #[error("{location}: {reason}")]
    Invalid { location: String, reason: String },
}

impl ScriptError {
    pub(crate) fn invalid(location: impl Into<String>, reason: impl Into<String>) -> Self {
        ScriptError::Invalid {
            location: location.into(),
            reason: reason.into(),
        }
    }
}

/// A request-time failure, always rendered as a provider-style error envelope.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Missing or invalid authorization")]
    Unauthorized,

    #[error("Debug mode not enabled")]
    Forbidden,

    #[error("{0}")]
    BadRequest(String),

    #[error("No matching rule: {0}")]
    Unmatched(UnmatchedReason),

    /// An operator-declared failure. Not a defect.
    #[error("{message}")]
    Simulated {
        status: u16,
        message: String,
        error_type: Option<String>,
        param: Option<String>,
        code: Option<String>,
    },

    #[error("failed to render response template: {0}")]
    Template(#[from] handlebars::RenderError),

    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ApiError {
    /// HTTP status the error is served with.
    pub fn status(&self) -> u16 {
        match self {
            ApiError::Unauthorized => 401,
            ApiError::Forbidden => 403,
            ApiError::BadRequest(_) => 400,
            ApiError::Unmatched(_) => 500,
            ApiError::Simulated { status, .. } => *status,
            ApiError::Template(_) | ApiError::Encode(_) => 500,
        }
    }

    /// Value of the envelope's `error.type` field.
    pub fn error_type(&self) -> String {
        match self {
            ApiError::Unauthorized => "auth_error".to_string(),
            ApiError::Forbidden => "forbidden".to_string(),
            ApiError::BadRequest(_) => "invalid_request_error".to_string(),
            ApiError::Simulated {
                status, error_type, ..
            } => error_type
                .clone()
                .unwrap_or_else(|| default_error_type(*status).to_string()),
            ApiError::Unmatched(_) | ApiError::Template(_) | ApiError::Encode(_) => {
                "server_error".to_string()
            }
        }
    }

    /// Render the error as the provider's error envelope.
    pub fn to_body(&self) -> ErrorResponse {
        let (param, code) = match self {
            ApiError::Simulated { param, code, .. } => (param.clone(), code.clone()),
            ApiError::Unmatched(_) => (None, Some("no_matching_rule".to_string())),
            _ => (None, None),
        };

        ErrorResponse {
            error: ErrorBody {
                message: self.to_string(),
                error_type: self.error_type(),
                param,
                code,
            },
        }
    }
}

/// Stable `error.type` used when a simulated error does not name one.
pub fn default_error_type(status: u16) -> &'static str {
    match status {
        401 => "authentication_error",
        403 => "permission_error",
        429 => "rate_limit_error",
        s if s >= 500 => "server_error",
        _ => "invalid_request_error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_error_types() {
        assert_eq!(default_error_type(401), "authentication_error");
        assert_eq!(default_error_type(404), "invalid_request_error");
        assert_eq!(default_error_type(429), "rate_limit_error");
        assert_eq!(default_error_type(503), "server_error");
    }

    #[test]
    fn test_simulated_error_body() {
        let err = ApiError::Simulated {
            status: 500,
            message: "Something went wrong".to_string(),
            error_type: None,
            param: None,
            code: None,
        };

        let body = err.to_body();
        assert_eq!(err.status(), 500);
        assert_eq!(body.error.message, "Something went wrong");
        assert_eq!(body.error.error_type, "server_error");
        assert!(body.error.param.is_none());
    }

    #[test]
    fn test_unmatched_error_body() {
        let err = ApiError::Unmatched(UnmatchedReason::NoMatch);
        let body = err.to_body();

        assert_eq!(err.status(), 500);
        assert!(body.error.message.starts_with("No matching rule"));
        assert_eq!(body.error.code.as_deref(), Some("no_matching_rule"));
    }

    #[test]
    fn test_unauthorized_is_401() {
        let err = ApiError::Unauthorized;
        assert_eq!(err.status(), 401);
        assert_eq!(err.to_body().error.error_type, "auth_error");
    }
}
