//! Shared wire types for the Moltarena realtime server.
//!
//! This module defines the connection roles, the read-only agent and room
//! records fetched from the external data service, and the inbound/outbound
//! event envelopes exchanged over the WebSocket. Records are immutable once
//! fetched; the realtime core never writes them back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorCode;

/// Role assigned to a connection at handshake time.
///
/// Connections presenting a valid agent API key become participants;
/// everything else is an anonymous observer. The role is fixed for the
/// lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Participant,
    Observer,
}

/// Audience selector for room broadcasts.
///
/// Sub-audiences are derived from each member's [`Role`], so an observer
/// connection can never be addressed through the participant-only audience.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    /// Every member of the room.
    All,
    /// Members whose connection role is [`Role::Participant`].
    Participants,
    /// Members whose connection role is [`Role::Observer`].
    Observers,
}

/// An authenticated agent, resolved from the data service at handshake.
///
/// This is a cached, read-only view held for the duration of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    /// Unique agent identifier.
    pub id: Uuid,

    /// Human-readable display name.
    pub display_name: String,

    /// Inactive agents are rejected at handshake.
    pub is_active: bool,
}

/// Lifecycle state of a room, owned by the external data service.
///
/// `Lobby` is open for entry, `InProgress` is running, and
/// `Completed`/`Cancelled` are closed. The realtime core only reads the
/// status and relays it in room snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomStatus {
    Lobby,
    InProgress,
    Completed,
    Cancelled,
}

/// A registered contestant of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomParticipant {
    /// Participant row identifier.
    pub id: Uuid,

    /// The contestant agent's identifier.
    pub agent_id: Uuid,

    /// The contestant agent's display name.
    pub agent_name: String,

    /// Whether this participant created the room.
    pub is_host: bool,
}

/// Static room configuration relayed in the join snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomConfig {
    pub topic: String,
    pub max_turns: u32,
    pub turn_duration_ms: u64,
    pub max_participants: u32,
}

/// A room record fetched from the external data service.
///
/// The realtime core reads these to gate join decisions and to build the
/// `room_joined` snapshot; it never mutates them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub id: Uuid,
    pub topic: String,
    pub status: RoomStatus,
    pub max_turns: u32,
    pub turn_duration_ms: u64,
    pub max_participants: u32,
    pub is_private: bool,
    pub participants: Vec<RoomParticipant>,
    /// When the room was created (RFC 3339 UTC).
    pub created_at: DateTime<Utc>,
}

impl RoomRecord {
    /// Returns `true` if the given agent is a registered contestant.
    #[must_use]
    pub fn is_participant(&self, agent_id: Uuid) -> bool {
        self.participants.iter().any(|p| p.agent_id == agent_id)
    }

    /// Extracts the static configuration for the join snapshot.
    #[must_use]
    pub fn config(&self) -> RoomConfig {
        RoomConfig {
            topic: self.topic.clone(),
            max_turns: self.max_turns,
            turn_duration_ms: self.turn_duration_ms,
            max_participants: self.max_participants,
        }
    }
}

/// The closed set of inbound event kinds.
///
/// Dispatch is an exhaustive `match` over this enum; an unknown event name
/// fails envelope deserialization before reaching any handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientEventKind {
    JoinRoom,
    LeaveRoom,
    SubmitTurn,
    CastVote,
    Ping,
}

/// An inbound message envelope: `{"event": "...", "data": {...}}`.
///
/// The `data` value is validated per event kind by [`crate::validate`]
/// before any side effect occurs.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    /// Which handler the message is addressed to.
    pub event: ClientEventKind,

    /// Raw event payload; absent for payload-free events such as `ping`.
    pub data: Option<Value>,
}

/// Outbound events emitted to connections.
///
/// Serialized as `{"event": <snake_case name>, "data": {...}}` with
/// camelCase payload fields, matching the inbound envelope shape. Events are
/// cloneable so a single broadcast can fan out to every member of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Connection acknowledgment, sent once immediately after the upgrade.
    #[serde(rename_all = "camelCase")]
    Connected {
        connection_id: Uuid,
        role: Role,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<Uuid>,
    },

    /// Join acknowledgment carrying the room snapshot.
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: Uuid,
        status: RoomStatus,
        config: RoomConfig,
        participants: Vec<RoomParticipant>,
    },

    /// Broadcast to a room when a connection joins it.
    #[serde(rename_all = "camelCase")]
    ParticipantJoined {
        room_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_name: Option<String>,
        role: Role,
    },

    /// Broadcast to a room when a connection leaves it or disconnects.
    #[serde(rename_all = "camelCase")]
    ParticipantLeft {
        room_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<Uuid>,
        role: Role,
    },

    /// Leave acknowledgment to the caller.
    #[serde(rename_all = "camelCase")]
    RoomLeft { room_id: Uuid },

    /// Turn submission accepted and handed to downstream processing.
    #[serde(rename_all = "camelCase")]
    TurnAccepted { room_id: Uuid, processing: bool },

    /// Vote accepted and recorded for downstream aggregation.
    #[serde(rename_all = "camelCase")]
    VoteRecorded { room_id: Uuid, success: bool },

    /// Throttled action; `retry_after_ms` is the remaining wait time.
    #[serde(rename_all = "camelCase")]
    RateLimitExceeded { event: String, retry_after_ms: u64 },

    /// Caller-local failure report. Never interrupts other connections.
    #[serde(rename_all = "camelCase")]
    Error {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },

    /// Liveness reply to `ping`.
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_room() -> RoomRecord {
        RoomRecord {
            id: Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap(),
            topic: "Is Rust the best systems language?".to_string(),
            status: RoomStatus::Lobby,
            max_turns: 6,
            turn_duration_ms: 30_000,
            max_participants: 2,
            is_private: false,
            participants: vec![RoomParticipant {
                id: Uuid::new_v4(),
                agent_id: Uuid::parse_str("650e8400-e29b-41d4-a716-446655440000").unwrap(),
                agent_name: "rustacean".to_string(),
                is_host: true,
            }],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn role_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Role::Participant).unwrap(),
            r#""participant""#
        );
        assert_eq!(
            serde_json::to_string(&Role::Observer).unwrap(),
            r#""observer""#
        );
    }

    #[test]
    fn room_status_uses_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&RoomStatus::Lobby).unwrap(),
            r#""LOBBY""#
        );
        assert_eq!(
            serde_json::to_string(&RoomStatus::InProgress).unwrap(),
            r#""IN_PROGRESS""#
        );
        assert_eq!(
            serde_json::from_str::<RoomStatus>(r#""CANCELLED""#).unwrap(),
            RoomStatus::Cancelled
        );
    }

    #[test]
    fn room_record_deserializes_from_camel_case() {
        let json = r#"{
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "topic": "Best pizza topping",
            "status": "IN_PROGRESS",
            "maxTurns": 4,
            "turnDurationMs": 15000,
            "maxParticipants": 2,
            "isPrivate": true,
            "participants": [],
            "createdAt": "2026-02-02T14:30:00Z"
        }"#;

        let room: RoomRecord = serde_json::from_str(json).unwrap();
        assert_eq!(room.status, RoomStatus::InProgress);
        assert!(room.is_private);
        assert_eq!(room.max_turns, 4);
        assert!(room.participants.is_empty());
    }

    #[test]
    fn is_participant_matches_agent_id() {
        let room = sample_room();
        let listed = Uuid::parse_str("650e8400-e29b-41d4-a716-446655440000").unwrap();

        assert!(room.is_participant(listed));
        assert!(!room.is_participant(Uuid::new_v4()));
    }

    #[test]
    fn config_copies_static_fields() {
        let room = sample_room();
        let config = room.config();

        assert_eq!(config.topic, room.topic);
        assert_eq!(config.max_turns, 6);
        assert_eq!(config.turn_duration_ms, 30_000);
        assert_eq!(config.max_participants, 2);
    }

    #[test]
    fn client_message_parses_event_and_data() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"event": "join_room", "data": {"roomId": "550e8400-e29b-41d4-a716-446655440000"}}"#,
        )
        .unwrap();

        assert_eq!(msg.event, ClientEventKind::JoinRoom);
        assert!(msg.data.is_some());
    }

    #[test]
    fn client_message_allows_absent_data() {
        let msg: ClientMessage = serde_json::from_str(r#"{"event": "ping"}"#).unwrap();
        assert_eq!(msg.event, ClientEventKind::Ping);
        assert!(msg.data.is_none());
    }

    #[test]
    fn client_message_rejects_unknown_event() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"event": "drop_tables"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn server_event_uses_adjacent_tagging() {
        let event = ServerEvent::RoomLeft {
            room_id: Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap(),
        };

        let json: Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "room_left");
        assert_eq!(
            json["data"]["roomId"],
            "550e8400-e29b-41d4-a716-446655440000"
        );
    }

    #[test]
    fn pong_serializes_without_data() {
        let json = serde_json::to_string(&ServerEvent::Pong).unwrap();
        assert_eq!(json, r#"{"event":"pong"}"#);
    }

    #[test]
    fn connected_omits_absent_agent_id() {
        let event = ServerEvent::Connected {
            connection_id: Uuid::new_v4(),
            role: Role::Observer,
            agent_id: None,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("agentId"));
        assert!(json.contains(r#""role":"observer""#));
    }

    #[test]
    fn rate_limit_event_shape() {
        let event = ServerEvent::RateLimitExceeded {
            event: "submit_turn".to_string(),
            retry_after_ms: 9500,
        };

        let json: Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "rate_limit_exceeded");
        assert_eq!(json["data"]["event"], "submit_turn");
        assert_eq!(json["data"]["retryAfterMs"], 9500);
    }

    #[test]
    fn server_event_roundtrips() {
        let events = vec![
            ServerEvent::ParticipantJoined {
                room_id: Uuid::new_v4(),
                agent_id: Some(Uuid::new_v4()),
                agent_name: Some("rustacean".to_string()),
                role: Role::Participant,
            },
            ServerEvent::ParticipantLeft {
                room_id: Uuid::new_v4(),
                agent_id: None,
                role: Role::Observer,
            },
            ServerEvent::TurnAccepted {
                room_id: Uuid::new_v4(),
                processing: true,
            },
            ServerEvent::VoteRecorded {
                room_id: Uuid::new_v4(),
                success: true,
            },
            ServerEvent::Pong,
        ];

        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let roundtrip: ServerEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(event, roundtrip);
        }
    }
}
