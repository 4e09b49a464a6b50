//! Billing error taxonomy

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

/// Coarse error class, used by the HTTP layer to pick a status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Forbidden,
    Conflict,
    Gateway,
    Internal,
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid state transition: {0}")]
    Conflict(String),

    #[error("Concurrent modification of {0}")]
    ConcurrentModification(String),

    #[error("Gateway error {code}: {message}")]
    Gateway {
        code: String,
        message: String,
        retryable: bool,
    },

    #[error("Gateway call timed out")]
    Timeout,

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// Another delivery of the same event holds the processing claim
    #[error("Webhook event is already being processed")]
    WebhookInProgress,

    #[error("Malformed webhook payload: {0}")]
    WebhookMalformed(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::Validation(_) | BillingError::WebhookMalformed(_) => {
                ErrorKind::Validation
            }
            BillingError::NotFound(_) => ErrorKind::NotFound,
            BillingError::Forbidden(_) | BillingError::WebhookSignatureInvalid => {
                ErrorKind::Forbidden
            }
            BillingError::Conflict(_)
            | BillingError::ConcurrentModification(_)
            | BillingError::WebhookInProgress => ErrorKind::Conflict,
            BillingError::Gateway { .. } | BillingError::Timeout => ErrorKind::Gateway,
            BillingError::Database(_) | BillingError::Config(_) | BillingError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether repeating the same gateway call may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::Gateway { retryable, .. } => *retryable,
            BillingError::Timeout => true,
            _ => false,
        }
    }

    pub fn gateway(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        BillingError::Gateway {
            code: code.into(),
            message: message.into(),
            retryable,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        let retryable = e.is_timeout() || e.is_connect() || e.is_request();
        if e.is_timeout() {
            return BillingError::Timeout;
        }
        BillingError::Gateway {
            code: "TRANSPORT_ERROR".to_string(),
            message: e.to_string(),
            retryable,
        }
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::Internal(format!("JSON error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            BillingError::Validation("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            BillingError::WebhookSignatureInvalid.kind(),
            ErrorKind::Forbidden
        );
        assert_eq!(
            BillingError::ConcurrentModification("sub".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(BillingError::WebhookInProgress.kind(), ErrorKind::Conflict);
        assert_eq!(
            BillingError::WebhookMalformed("eof".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(BillingError::Timeout.kind(), ErrorKind::Gateway);
        assert_eq!(
            BillingError::Database("down".into()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_retryable_only_for_gateway_failures() {
        assert!(BillingError::Timeout.is_retryable());
        assert!(BillingError::gateway("PROVIDER_ERROR", "busy", true).is_retryable());
        assert!(!BillingError::gateway("REJECT_CARD_PAYMENT", "declined", false).is_retryable());
        assert!(!BillingError::Validation("bad".into()).is_retryable());
    }
}
