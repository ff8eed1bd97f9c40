// Error handling for the payment core.
//
// This module defines the crate-wide error type and utility constructors.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::result;
use thiserror::Error;

/// Result type for payment core operations.
pub type Result<T> = result::Result<T, PaymentCoreError>;

/// Error taxonomy for the payment core, one variant family per failure domain
/// (see SPEC_FULL.md §7).
#[derive(Debug, Error, Clone)]
pub enum PaymentCoreError {
    /// Malformed input that was never persisted: bad email, non-positive amount,
    /// unknown currency/protocol/provider.
    #[error("validation error: {0}")]
    Validation(String),

    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A provider adapter failed (network, timeout, non-2xx, unparseable webhook).
    #[error("provider error ({provider}): {message}")]
    Provider { provider: String, message: String },

    /// A VPN adapter failed (remote credential create/delete/config render).
    #[error("vpn adapter error ({protocol}, server {server_id}): {message}")]
    Vpn {
        protocol: String,
        server_id: i64,
        message: String,
    },

    /// Persistence failure. `transient` failures are the busy/locked class that
    /// the atomic primitives retry internally; by the time this variant escapes
    /// to a caller, retries have been exhausted.
    #[error("storage error: {message}")]
    Storage { message: String, transient: bool },

    /// A post-operation invariant check failed (e.g. a key was written but is
    /// not visible on re-read). Carries the compensating action already taken,
    /// if any.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// Notification transport failed after retries.
    #[error("notification error: {0}")]
    Notification(String),

    /// Configuration is missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Request failed authentication (webhook signature/secret/IP check).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PaymentCoreError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound(message.into())
    }

    pub fn provider<P: Into<String>, M: Into<String>>(provider: P, message: M) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn vpn<P: Into<String>, M: Into<String>>(protocol: P, server_id: i64, message: M) -> Self {
        Self::Vpn {
            protocol: protocol.into(),
            server_id,
            message: message.into(),
        }
    }

    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            message: message.into(),
            transient: false,
        }
    }

    pub fn storage_transient<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            message: message.into(),
            transient: true,
        }
    }

    pub fn consistency<S: Into<String>>(message: S) -> Self {
        Self::Consistency(message.into())
    }

    pub fn notification<S: Into<String>>(message: S) -> Self {
        Self::Notification(message.into())
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// True for storage errors the atomic primitives consider worth retrying
    /// (SQLITE_BUSY / SQLITE_LOCKED class).
    pub fn is_transient_storage(&self) -> bool {
        matches!(self, Self::Storage { transient: true, .. })
    }
}

impl IntoResponse for PaymentCoreError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            PaymentCoreError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            PaymentCoreError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            PaymentCoreError::Provider { message, .. } => (StatusCode::BAD_GATEWAY, message.clone()),
            PaymentCoreError::Vpn { message, .. } => (StatusCode::BAD_GATEWAY, message.clone()),
            PaymentCoreError::Storage { message, .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, message.clone())
            }
            PaymentCoreError::Consistency(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            PaymentCoreError::Notification(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            PaymentCoreError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            PaymentCoreError::Unauthorized(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            PaymentCoreError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(serde_json::json!({
            "error": {
                "code": status.as_u16(),
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<rusqlite::Error> for PaymentCoreError {
    fn from(err: rusqlite::Error) -> Self {
        let transient = matches!(
            &err,
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
        );
        PaymentCoreError::Storage {
            message: err.to_string(),
            transient,
        }
    }
}

impl From<reqwest::Error> for PaymentCoreError {
    fn from(err: reqwest::Error) -> Self {
        PaymentCoreError::Provider {
            provider: "http".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for PaymentCoreError {
    fn from(err: serde_json::Error) -> Self {
        PaymentCoreError::Validation(format!("invalid json: {err}"))
    }
}

impl From<toml::de::Error> for PaymentCoreError {
    fn from(err: toml::de::Error) -> Self {
        PaymentCoreError::Config(err.to_string())
    }
}

impl From<config::ConfigError> for PaymentCoreError {
    fn from(err: config::ConfigError) -> Self {
        PaymentCoreError::Config(err.to_string())
    }
}

impl From<std::io::Error> for PaymentCoreError {
    fn from(err: std::io::Error) -> Self {
        PaymentCoreError::Internal(err.to_string())
    }
}
