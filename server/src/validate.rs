//! Pure payload validators for inbound room events.
//!
//! One function per event kind, each taking the raw `data` value from the
//! message envelope and returning either a typed, sanitized payload or a
//! [`EventError::Validation`] naming the failing field. Validators are
//! side-effect free: nothing is looked up, locked, or mutated here.
//!
//! Shape comes first: a payload that is not a JSON object is rejected
//! before any field-level check runs. Identifiers must be well-formed
//! UUIDs. Free text is stripped of markup and length-bounded. Optional
//! fields absent from the payload stay absent; they are never defaulted.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::EventError;
use crate::sanitize::strip_markup;

/// Maximum length of turn content after sanitization.
pub const MAX_TURN_CONTENT_LEN: usize = 5000;

/// Maximum length of a single source entry after sanitization.
pub const MAX_SOURCE_LEN: usize = 500;

/// Maximum number of source entries per turn.
pub const MAX_SOURCES: usize = 10;

/// Validated `join_room` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRoomPayload {
    pub room_id: Uuid,
}

/// Validated `leave_room` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveRoomPayload {
    pub room_id: Uuid,
}

/// Validated `submit_turn` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitTurnPayload {
    pub room_id: Uuid,
    /// Sanitized turn content, non-empty and at most
    /// [`MAX_TURN_CONTENT_LEN`] characters.
    pub content: String,
    /// Sanitized source citations, if the client provided any.
    pub sources: Option<Vec<String>>,
}

/// Validated `cast_vote` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastVotePayload {
    pub room_id: Uuid,
    pub target_agent_id: Uuid,
}

/// Validates a `join_room` payload.
pub fn join_room(data: Option<&Value>) -> Result<JoinRoomPayload, EventError> {
    let obj = as_object(data)?;
    Ok(JoinRoomPayload {
        room_id: uuid_field(obj, "roomId")?,
    })
}

/// Validates a `leave_room` payload.
pub fn leave_room(data: Option<&Value>) -> Result<LeaveRoomPayload, EventError> {
    let obj = as_object(data)?;
    Ok(LeaveRoomPayload {
        room_id: uuid_field(obj, "roomId")?,
    })
}

/// Validates a `submit_turn` payload.
pub fn submit_turn(data: Option<&Value>) -> Result<SubmitTurnPayload, EventError> {
    let obj = as_object(data)?;
    let room_id = uuid_field(obj, "roomId")?;

    let content = required_text(obj, "content", MAX_TURN_CONTENT_LEN)?;

    let sources = match obj.get("sources") {
        None | Some(Value::Null) => None,
        Some(Value::Array(entries)) => {
            if entries.len() > MAX_SOURCES {
                return Err(EventError::validation(format!(
                    "sources must contain at most {MAX_SOURCES} entries"
                )));
            }
            let mut sanitized = Vec::with_capacity(entries.len());
            for (i, entry) in entries.iter().enumerate() {
                let Some(raw) = entry.as_str() else {
                    return Err(EventError::validation(format!(
                        "sources[{i}] must be a string"
                    )));
                };
                let clean = strip_markup(raw);
                if clean.chars().count() > MAX_SOURCE_LEN {
                    return Err(EventError::validation(format!(
                        "sources[{i}] must be at most {MAX_SOURCE_LEN} characters"
                    )));
                }
                sanitized.push(clean);
            }
            Some(sanitized)
        }
        Some(_) => {
            return Err(EventError::validation("sources must be an array of strings"));
        }
    };

    Ok(SubmitTurnPayload {
        room_id,
        content,
        sources,
    })
}

/// Validates a `cast_vote` payload.
pub fn cast_vote(data: Option<&Value>) -> Result<CastVotePayload, EventError> {
    let obj = as_object(data)?;
    Ok(CastVotePayload {
        room_id: uuid_field(obj, "roomId")?,
        target_agent_id: uuid_field(obj, "targetAgentId")?,
    })
}

/// Shape check: the payload must be a JSON object.
fn as_object(data: Option<&Value>) -> Result<&Map<String, Value>, EventError> {
    data.and_then(Value::as_object)
        .ok_or_else(|| EventError::validation("invalid payload format"))
}

/// Extracts a required UUID field.
fn uuid_field(obj: &Map<String, Value>, name: &str) -> Result<Uuid, EventError> {
    let value = obj
        .get(name)
        .ok_or_else(|| EventError::validation(format!("{name} is required")))?;
    let raw = value
        .as_str()
        .ok_or_else(|| EventError::validation(format!("{name} must be a string")))?;
    Uuid::parse_str(raw)
        .map_err(|_| EventError::validation(format!("{name} must be a valid UUID")))
}

/// Extracts a required free-text field, sanitized and length-bounded.
fn required_text(
    obj: &Map<String, Value>,
    name: &str,
    max_len: usize,
) -> Result<String, EventError> {
    let value = obj
        .get(name)
        .ok_or_else(|| EventError::validation(format!("{name} is required")))?;
    let raw = value
        .as_str()
        .ok_or_else(|| EventError::validation(format!("{name} must be a string")))?;

    let clean = strip_markup(raw);
    if clean.is_empty() {
        return Err(EventError::validation(format!("{name} must not be empty")));
    }
    if clean.chars().count() > max_len {
        return Err(EventError::validation(format!(
            "{name} must be at most {max_len} characters"
        )));
    }

    Ok(clean)
}
