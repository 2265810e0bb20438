//! Error taxonomy for the room event pipeline.
//!
//! Every handler failure is converted into an [`EventError`] and reported
//! only to the originating connection as an outbound event. The taxonomy
//! distinguishes caller mistakes (validation, authorization, not-found,
//! rate limits) from infrastructure failures (service unavailable,
//! internal), so clients can tell a permanent rejection from a transient
//! one.
//!
//! # Propagation policy
//!
//! Errors never cross the dispatch boundary: the router converts each one
//! into a `error{code, message}` or `rate_limit_exceeded` event for the
//! triggering connection and keeps processing events from everyone else.
//! Infrastructure failures are logged with correlation fields but surface
//! to the client with a generic message only.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data_service::DataServiceError;
use crate::store::StoreError;
use crate::types::ServerEvent;

/// Wire error codes carried in outbound `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    RoomNotFound,
    NotParticipant,
    PrivateRoom,
    Forbidden,
    Unauthorized,
    AlreadyVoted,
    ServiceUnavailable,
    InternalError,
}

/// A failure raised while handling a single inbound event.
///
/// The `Display` form carries full detail for logs; what reaches the client
/// is decided by [`EventError::to_event`], which substitutes generic
/// messages for infrastructure failures.
#[derive(Debug, Error)]
pub enum EventError {
    /// Malformed or out-of-range payload. The message names the failing
    /// field.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced room does not exist.
    #[error("room not found")]
    RoomNotFound,

    /// The authenticated agent is not a registered contestant of the room.
    #[error("not a participant of this room")]
    NotParticipant,

    /// Observers may not enter private rooms.
    #[error("this room is private")]
    PrivateRoom,

    /// The connection's role does not permit the action.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The action requires an authenticated identity.
    #[error("authentication required: {0}")]
    Unauthorized(String),

    /// The one-shot vote flag for this room is already set.
    #[error("already voted in this room")]
    AlreadyVoted,

    /// The action is throttled; `retry_after` is the remaining window.
    #[error("rate limit exceeded for {event}")]
    RateLimited {
        event: &'static str,
        retry_after: Duration,
    },

    /// The coordination store or an external lookup was unreachable or
    /// timed out. Retryable from the client's perspective.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Unexpected failure. Detail is logged, never exposed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EventError {
    /// Creates a validation error naming the failing field.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a role-mismatch error.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    /// Creates a missing-identity error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    /// Creates an internal error. The message is for logs only.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns `true` for failures that indicate infrastructure trouble
    /// rather than a caller mistake. These are logged at error level.
    #[must_use]
    pub fn is_unexpected(&self) -> bool {
        matches!(self, Self::ServiceUnavailable(_) | Self::Internal(_))
    }

    /// The wire code for this error, or `None` for rate limits, which are
    /// reported through their own event.
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Validation(_) => Some(ErrorCode::ValidationError),
            Self::RoomNotFound => Some(ErrorCode::RoomNotFound),
            Self::NotParticipant => Some(ErrorCode::NotParticipant),
            Self::PrivateRoom => Some(ErrorCode::PrivateRoom),
            Self::Forbidden(_) => Some(ErrorCode::Forbidden),
            Self::Unauthorized(_) => Some(ErrorCode::Unauthorized),
            Self::AlreadyVoted => Some(ErrorCode::AlreadyVoted),
            Self::RateLimited { .. } => None,
            Self::ServiceUnavailable(_) => Some(ErrorCode::ServiceUnavailable),
            Self::Internal(_) => Some(ErrorCode::InternalError),
        }
    }

    /// Converts the error into the outbound event for the triggering
    /// connection.
    ///
    /// Rate limits become `rate_limit_exceeded` with the remaining wait
    /// time; everything else becomes an `error` event. Infrastructure
    /// failures are reported with a generic message so internal detail
    /// never reaches the client.
    #[must_use]
    pub fn to_event(&self) -> ServerEvent {
        match self {
            Self::RateLimited { event, retry_after } => ServerEvent::RateLimitExceeded {
                event: (*event).to_string(),
                retry_after_ms: retry_after.as_millis() as u64,
            },
            Self::ServiceUnavailable(_) => ServerEvent::Error {
                code: ErrorCode::ServiceUnavailable,
                message: "service temporarily unavailable, try again later".to_string(),
                details: None,
            },
            Self::Internal(_) => ServerEvent::Error {
                code: ErrorCode::InternalError,
                message: "internal server error".to_string(),
                details: None,
            },
            other => ServerEvent::Error {
                // code() is None only for RateLimited, handled above
                code: other.code().unwrap_or(ErrorCode::InternalError),
                message: other.to_string(),
                details: None,
            },
        }
    }
}

impl From<StoreError> for EventError {
    fn from(err: StoreError) -> Self {
        Self::ServiceUnavailable(err.to_string())
    }
}

impl From<DataServiceError> for EventError {
    fn from(err: DataServiceError) -> Self {
        Self::ServiceUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_names_field() {
        let err = EventError::validation("roomId must be a valid UUID");
        assert_eq!(
            err.to_string(),
            "validation failed: roomId must be a valid UUID"
        );
        assert_eq!(err.code(), Some(ErrorCode::ValidationError));
    }

    #[test]
    fn error_codes_serialize_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::NotParticipant).unwrap(),
            r#""NOT_PARTICIPANT""#
        );
        assert_eq!(
            serde_json::to_string(&ErrorCode::ServiceUnavailable).unwrap(),
            r#""SERVICE_UNAVAILABLE""#
        );
        assert_eq!(
            serde_json::to_string(&ErrorCode::ValidationError).unwrap(),
            r#""VALIDATION_ERROR""#
        );
    }

    #[test]
    fn rate_limited_converts_to_rate_limit_event() {
        let err = EventError::RateLimited {
            event: "submit_turn",
            retry_after: Duration::from_millis(7500),
        };

        match err.to_event() {
            ServerEvent::RateLimitExceeded {
                event,
                retry_after_ms,
            } => {
                assert_eq!(event, "submit_turn");
                assert_eq!(retry_after_ms, 7500);
            }
            other => panic!("expected rate_limit_exceeded, got {other:?}"),
        }
    }

    #[test]
    fn caller_errors_keep_their_message() {
        match EventError::NotParticipant.to_event() {
            ServerEvent::Error { code, message, .. } => {
                assert_eq!(code, ErrorCode::NotParticipant);
                assert_eq!(message, "not a participant of this room");
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[test]
    fn infrastructure_detail_never_reaches_client() {
        let err = EventError::ServiceUnavailable("redis at 10.0.0.3:6379 refused".to_string());

        match err.to_event() {
            ServerEvent::Error { code, message, .. } => {
                assert_eq!(code, ErrorCode::ServiceUnavailable);
                assert!(!message.contains("10.0.0.3"));
            }
            other => panic!("expected error event, got {other:?}"),
        }

        let err = EventError::internal("lock poisoned in registry shard 3");
        match err.to_event() {
            ServerEvent::Error { code, message, .. } => {
                assert_eq!(code, ErrorCode::InternalError);
                assert!(!message.contains("shard"));
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[test]
    fn unexpected_classification() {
        assert!(EventError::internal("boom").is_unexpected());
        assert!(EventError::ServiceUnavailable("down".into()).is_unexpected());
        assert!(!EventError::RoomNotFound.is_unexpected());
        assert!(!EventError::AlreadyVoted.is_unexpected());
        assert!(!EventError::validation("bad").is_unexpected());
    }

    #[test]
    fn store_error_maps_to_service_unavailable() {
        let err: EventError = StoreError::Timeout(Duration::from_secs(2)).into();
        assert!(matches!(err, EventError::ServiceUnavailable(_)));
        assert_eq!(err.code(), Some(ErrorCode::ServiceUnavailable));
    }
}
