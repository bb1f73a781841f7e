//! Error types for the federation engine
//!
//! All errors in the crate are converted to `FederationError`,
//! which implements `IntoResponse` for proper HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Crate-wide error type
///
/// Each variant carries its classification: validation errors are
/// caller-fixable, not-found errors are never retried, federation errors
/// cover the remote-server failure modes, and `Internal` captures local
/// bugs without leaking details to the wire.
#[derive(Debug, Error)]
pub enum FederationError {
    /// Malformed `user@domain` identifier (400)
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Request payload failed validation (400)
    #[error("validation error: {0}")]
    Validation(String),

    /// Shared object URL is not a well-formed event URI (422)
    #[error("invalid shared-event URL: {0}")]
    InvalidSharedEventUrl(String),

    /// No matching follow relationship (404)
    #[error("follow relationship not found")]
    RelationshipNotFound,

    /// Discovery found no such calendar on the remote server (404)
    #[error("remote calendar not found: {0}")]
    RemoteCalendarNotFound(String),

    /// DNS/connect/timeout failure talking to the remote domain (502)
    #[error("remote domain unreachable: {0}")]
    RemoteUnreachable(String),

    /// Remote server answered but does not speak the activity protocol (502)
    #[error("protocol not supported by remote server: {0}")]
    ProtocolUnsupported(String),

    /// Actor profile response could not be parsed (502)
    #[error("profile fetch failed: {0}")]
    ProfileFetchFailed(String),

    /// Activity type this server does not handle (422)
    #[error("activity type not supported: {0}")]
    NotSupported(String),

    /// A calendar tried to follow itself (422)
    #[error("self-follow not allowed")]
    SelfFollow,

    /// A non-terminal relationship already exists for the pair (409)
    #[error("follow relationship already exists")]
    DuplicateFollow,

    /// Remote domain is blocked by local policy (403)
    #[error("domain is blocked")]
    DomainBlocked,

    /// Missing or failed HTTP signature verification (401)
    #[error("invalid signature")]
    InvalidSignature,

    /// Internal error (500)
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl FederationError {
    /// Stable label for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidIdentifier(_) => "invalid_identifier",
            Self::Validation(_) => "validation",
            Self::InvalidSharedEventUrl(_) => "invalid_shared_event_url",
            Self::RelationshipNotFound => "relationship_not_found",
            Self::RemoteCalendarNotFound(_) => "remote_calendar_not_found",
            Self::RemoteUnreachable(_) => "remote_unreachable",
            Self::ProtocolUnsupported(_) => "protocol_unsupported",
            Self::ProfileFetchFailed(_) => "profile_fetch_failed",
            Self::NotSupported(_) => "not_supported",
            Self::SelfFollow => "self_follow",
            Self::DuplicateFollow => "duplicate_follow",
            Self::DomainBlocked => "domain_blocked",
            Self::InvalidSignature => "invalid_signature",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<config::ConfigError> for FederationError {
    fn from(err: config::ConfigError) -> Self {
        FederationError::Validation(format!("configuration error: {}", err))
    }
}

impl IntoResponse for FederationError {
    /// Convert error to HTTP response
    ///
    /// Maps each variant to a status code and a JSON error body carrying
    /// only the classified kind and message. Remote error bodies and
    /// internal causes are never relayed.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message) = match &self {
            FederationError::InvalidIdentifier(_) | FederationError::Validation(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            FederationError::InvalidSharedEventUrl(_)
            | FederationError::NotSupported(_)
            | FederationError::SelfFollow => (StatusCode::UNPROCESSABLE_ENTITY, self.to_string()),
            FederationError::RelationshipNotFound | FederationError::RemoteCalendarNotFound(_) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            FederationError::RemoteUnreachable(_)
            | FederationError::ProtocolUnsupported(_)
            | FederationError::ProfileFetchFailed(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            FederationError::DuplicateFollow => (StatusCode::CONFLICT, self.to_string()),
            FederationError::DomainBlocked => (StatusCode::FORBIDDEN, self.to_string()),
            FederationError::InvalidSignature => (StatusCode::UNAUTHORIZED, self.to_string()),
            FederationError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        };

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[self.kind()])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
            "kind": self.kind(),
        }));

        (status, body).into_response()
    }
}

/// Result type alias using FederationError
pub type Result<T> = std::result::Result<T, FederationError>;
