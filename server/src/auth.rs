//! Connection authentication.
//!
//! Runs once per incoming WebSocket connection, before the upgrade:
//!
//! 1. No token in the handshake → the connection is an anonymous observer.
//! 2. A token that fails the API-key format check → the connection is
//!    rejected; it is never established.
//! 3. A well-formed key is resolved through the
//!    [`CredentialVerifier`](crate::data_service::CredentialVerifier); a
//!    missing or inactive agent rejects the connection, otherwise it is
//!    tagged as a participant with the resolved agent attached for its
//!    whole lifetime.
//!
//! Authentication failure is terminal for the attempt; there is no retry
//! here. Outcomes are logged with structured fields; the raw token never
//! appears in logs.
//!
//! # Key format
//!
//! `moltarena_sk_` followed by URL-safe, unpadded base64 of 32 random
//! bytes. Key generation and hashing live in the data service; this module
//! only recognizes the shape.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::data_service::CredentialVerifier;
use crate::types::{AgentRecord, Role};

/// Fixed prefix of every agent API key.
pub const API_KEY_PREFIX: &str = "moltarena_sk_";

/// Length of the decoded key material in bytes.
const API_KEY_MATERIAL_BYTES: usize = 32;

/// Errors that can occur during connection authentication.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The token does not match the API-key scheme.
    #[error("invalid token format")]
    InvalidTokenFormat,

    /// The key is well-formed but matches no agent.
    #[error("unknown or revoked credential")]
    UnknownCredential,

    /// The key resolved to an agent that is marked inactive.
    #[error("agent is inactive")]
    InactiveAgent,

    /// The credential verifier was unreachable; the client may retry.
    #[error("credential verifier unavailable: {0}")]
    ServiceUnavailable(String),
}

impl AuthError {
    /// Returns `true` if the failure is transient rather than a rejection.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable(_))
    }
}

/// The identity a connection carries for its whole lifetime.
#[derive(Debug, Clone)]
pub struct ConnIdentity {
    /// Role derived from the handshake outcome.
    pub role: Role,

    /// The resolved agent for participants; `None` for observers.
    pub agent: Option<AgentRecord>,
}

impl ConnIdentity {
    /// An anonymous observer identity.
    #[must_use]
    pub fn observer() -> Self {
        Self {
            role: Role::Observer,
            agent: None,
        }
    }

    /// A participant identity carrying the resolved agent.
    #[must_use]
    pub fn participant(agent: AgentRecord) -> Self {
        Self {
            role: Role::Participant,
            agent: Some(agent),
        }
    }

    /// The agent id, if this identity is a participant.
    #[must_use]
    pub fn agent_id(&self) -> Option<Uuid> {
        self.agent.as_ref().map(|a| a.id)
    }
}

/// Checks a token against the API-key scheme.
///
/// Returns the key unchanged when it carries the fixed prefix and its
/// material decodes to exactly 32 bytes of URL-safe base64.
///
/// # Example
///
/// ```rust
/// use moltarena_server::auth::extract_api_key;
///
/// assert!(extract_api_key("moltarena_sk_AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").is_some());
/// assert!(extract_api_key("Bearer something").is_none());
/// assert!(extract_api_key("moltarena_sk_short").is_none());
/// ```
#[must_use]
pub fn extract_api_key(token: &str) -> Option<&str> {
    let material = token.strip_prefix(API_KEY_PREFIX)?;
    let decoded = URL_SAFE_NO_PAD.decode(material).ok()?;
    (decoded.len() == API_KEY_MATERIAL_BYTES).then_some(token)
}

/// Classifies a new connection from its optional handshake token.
///
/// See the module docs for the decision table. The raw token is never
/// logged; failures record only its presence.
pub async fn authenticate(
    token: Option<&str>,
    verifier: &dyn CredentialVerifier,
) -> Result<ConnIdentity, AuthError> {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        debug!("No token presented, connecting as observer");
        return Ok(ConnIdentity::observer());
    };

    let Some(api_key) = extract_api_key(token) else {
        warn!(has_token = true, "Rejected connection: malformed token");
        return Err(AuthError::InvalidTokenFormat);
    };

    match verifier.agent_by_api_key(api_key).await {
        Ok(Some(agent)) if agent.is_active => {
            info!(agent_id = %agent.id, "Connection authenticated as participant");
            Ok(ConnIdentity::participant(agent))
        }
        Ok(Some(agent)) => {
            warn!(agent_id = %agent.id, "Rejected connection: agent inactive");
            Err(AuthError::InactiveAgent)
        }
        Ok(None) => {
            warn!(has_token = true, "Rejected connection: unknown credential");
            Err(AuthError::UnknownCredential)
        }
        Err(err) => {
            warn!(error = %err, "Credential verifier unavailable during handshake");
            Err(AuthError::ServiceUnavailable(err.to_string()))
        }
    }
}
