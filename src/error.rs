//! Error types for Steward

use thiserror::Error;

use crate::types::{ExecutionMode, Platform};

/// Result type alias for Steward operations
pub type Result<T> = std::result::Result<T, StewardError>;

/// Main error type for Steward
#[derive(Error, Debug)]
pub enum StewardError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    #[cfg(feature = "openai")]
    Http(#[from] reqwest::Error),

    #[error("HTTP request error: {0}")]
    #[cfg(not(feature = "openai"))]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limiting, timeouts, flaky networks
    #[error("Transient platform error on {platform}: {message}")]
    Transient { platform: Platform, message: String },

    #[error("Rate limited by {platform}: retry after {retry_after_secs} seconds")]
    RateLimited {
        platform: Platform,
        retry_after_secs: u64,
    },

    /// Expired or revoked platform credential
    #[error("Authentication required for {platform}")]
    AuthRequired { platform: Platform },

    #[error("{platform} does not support {intent}")]
    UnsupportedIntent { platform: Platform, intent: String },

    /// No memory is visible under the requested scope
    #[error("Nothing is known yet for this scope")]
    EmptyScope,

    /// Live, cache and a fresh sync all came back empty
    #[error("No content available from {platform}")]
    NoContent { platform: Platform },

    #[error("Primitive '{primitive}' is not permitted in {mode} mode")]
    PrimitiveNotPermitted {
        primitive: String,
        mode: ExecutionMode,
    },

    #[error("Unknown primitive: {0}")]
    UnknownPrimitive(String),

    #[error("Model call failed: {0}")]
    Model(String),

    #[error("Model call timed out after {0} seconds")]
    ModelTimeout(u64),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Generation already in flight for deliverable {0}")]
    GenerationInFlight(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used to decide retry, fallback and user messaging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with backoff, then degraded to cache
    TransientPlatform,
    /// Never retried; surfaced as a reconnect prompt
    Authentication,
    /// A valid, negative answer
    EmptyResult,
    /// Fed back to the model as a tool error
    PrimitivePermission,
    /// Fatal to the current run
    ModelFailure,
    Internal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::TransientPlatform => "transient_platform",
            ErrorClass::Authentication => "authentication",
            ErrorClass::EmptyResult => "empty_result",
            ErrorClass::PrimitivePermission => "primitive_permission",
            ErrorClass::ModelFailure => "model_failure",
            ErrorClass::Internal => "internal",
        }
    }
}

impl StewardError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StewardError::Transient { .. }
                | StewardError::RateLimited { .. }
                | StewardError::Http(_)
                | StewardError::Sync(_)
        )
    }

    /// `EmptyScope` and `NoContent` are answers, not failures
    pub fn is_empty_result(&self) -> bool {
        matches!(
            self,
            StewardError::EmptyScope | StewardError::NoContent { .. }
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, StewardError::AuthRequired { .. })
    }

    /// Map onto the error taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            StewardError::Transient { .. }
            | StewardError::RateLimited { .. }
            | StewardError::Http(_)
            | StewardError::Sync(_) => ErrorClass::TransientPlatform,
            StewardError::AuthRequired { .. } => ErrorClass::Authentication,
            StewardError::EmptyScope | StewardError::NoContent { .. } => ErrorClass::EmptyResult,
            StewardError::PrimitiveNotPermitted { .. } | StewardError::UnknownPrimitive(_) => {
                ErrorClass::PrimitivePermission
            }
            StewardError::Model(_) | StewardError::ModelTimeout(_) | StewardError::Cancelled => {
                ErrorClass::ModelFailure
            }
            _ => ErrorClass::Internal,
        }
    }

    /// Conversational explanation for chat mode
    pub fn user_message(&self) -> String {
        match self {
            StewardError::AuthRequired { platform } => format!(
                "My connection to {} has expired or was revoked. Please reconnect {} in your settings and I'll pick up where we left off.",
                platform.display_name(),
                platform.display_name()
            ),
            StewardError::EmptyScope => {
                "I don't have anything saved about this yet. Tell me a bit about it and I'll remember it.".to_string()
            }
            StewardError::NoContent { platform } => format!(
                "I checked {} directly and ran a fresh sync, but there's nothing there matching that request.",
                platform.display_name()
            ),
            StewardError::Transient { platform, .. } | StewardError::RateLimited { platform, .. } => format!(
                "{} isn't responding reliably right now and I have no saved copy to fall back on. Try again in a few minutes.",
                platform.display_name()
            ),
            StewardError::UnsupportedIntent { platform, intent } => format!(
                "I can't {} on {} yet.",
                intent,
                platform.display_name()
            ),
            StewardError::ModelTimeout(secs) => format!(
                "I took longer than {} seconds to think this through and stopped. Could you narrow the question down?",
                secs
            ),
            StewardError::Model(msg) => format!(
                "The reasoning service returned an error ({}). Your data is unchanged; please try again.",
                msg
            ),
            StewardError::GenerationInFlight(_) => {
                "That deliverable is being generated right now. I'll have the new version shortly.".to_string()
            }
            StewardError::NotFound(what) => format!("I couldn't find {}.", what),
            StewardError::InvalidInput(msg) => format!("That request didn't look right: {}.", msg),
            other => format!("I hit an internal problem while working on that: {}.", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let transient = StewardError::Transient {
            platform: Platform::Slack,
            message: "timeout".to_string(),
        };
        assert!(transient.is_retryable());
        assert_eq!(transient.class(), ErrorClass::TransientPlatform);

        let auth = StewardError::AuthRequired {
            platform: Platform::Gmail,
        };
        assert!(!auth.is_retryable());
        assert!(auth.is_auth());
        assert_eq!(auth.class(), ErrorClass::Authentication);

        assert!(StewardError::EmptyScope.is_empty_result());
        assert!(StewardError::NoContent {
            platform: Platform::Notion
        }
        .is_empty_result());

        let denied = StewardError::PrimitiveNotPermitted {
            primitive: "send_message".to_string(),
            mode: ExecutionMode::Headless,
        };
        assert_eq!(denied.class(), ErrorClass::PrimitivePermission);
    }

    #[test]
    fn test_user_messages_are_specific() {
        let msg = StewardError::AuthRequired {
            platform: Platform::Slack,
        }
        .user_message();
        assert!(msg.contains("reconnect"));
        assert!(msg.contains("Slack"));

        let msg = StewardError::ModelTimeout(120).user_message();
        assert!(!msg.to_lowercase().contains("something went wrong"));
    }
}
