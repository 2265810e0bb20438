//! Room event routing, authorization, and rate gating.
//!
//! The router is the single entry point for inbound events. It is
//! stateless between events: authorization is re-derived from the room
//! registry and the external room record on every dispatch, so a stale
//! membership or a revoked participant listing never carries over.
//!
//! Dispatch is an exhaustive match over the closed
//! [`ClientEventKind`](crate::types::ClientEventKind) enum. Every handler
//! failure is converted into a caller-local outbound event; nothing raised
//! here ever interrupts another connection or closes this one.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};
use uuid::Uuid;

use crate::connection::ConnectionHandle;
use crate::data_service::RoomDirectory;
use crate::error::EventError;
use crate::fanout::RoomBroadcaster;
use crate::registry::RoomRegistry;
use crate::store::{Claim, CoordinationStore};
use crate::types::{Audience, ClientEventKind, ClientMessage, Role, ServerEvent};
use crate::validate;

/// Default window between turn submissions per agent (10 seconds).
pub const DEFAULT_TURN_WINDOW: Duration = Duration::from_secs(10);

/// Default lifetime of the one-shot vote flag (24 hours), long enough to
/// outlast any room.
pub const DEFAULT_VOTE_TTL: Duration = Duration::from_secs(86_400);

/// Tunable gating windows, injected so tests can shrink them.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Minimum spacing between accepted turns per agent.
    pub turn_window: Duration,

    /// Lifetime of the one-vote-per-room flag.
    pub vote_ttl: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            turn_window: DEFAULT_TURN_WINDOW,
            vote_ttl: DEFAULT_VOTE_TTL,
        }
    }
}

/// Dispatches validated events to handlers and produces outbound events.
pub struct EventRouter {
    registry: Arc<RoomRegistry>,
    broadcaster: Arc<RoomBroadcaster>,
    store: Arc<dyn CoordinationStore>,
    directory: Arc<dyn RoomDirectory>,
    config: RouterConfig,
}

impl EventRouter {
    /// Creates a router over explicitly injected collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<RoomRegistry>,
        broadcaster: Arc<RoomBroadcaster>,
        store: Arc<dyn CoordinationStore>,
        directory: Arc<dyn RoomDirectory>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            store,
            directory,
            config,
        }
    }

    /// Handles one raw inbound frame from a connection.
    ///
    /// Parse failures and handler errors are reported to the triggering
    /// connection only; this function itself never fails.
    pub async fn dispatch(&self, conn: &ConnectionHandle, raw: &str) {
        let message: ClientMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(err) => {
                debug!(connection_id = %conn.id, error = %err, "Unparseable inbound message");
                conn.send(EventError::validation("malformed message envelope").to_event());
                return;
            }
        };

        let data = message.data.as_ref();
        let result = match message.event {
            ClientEventKind::JoinRoom => self.join_room(conn, data).await,
            ClientEventKind::LeaveRoom => self.leave_room(conn, data).await,
            ClientEventKind::SubmitTurn => self.submit_turn(conn, data).await,
            ClientEventKind::CastVote => self.cast_vote(conn, data).await,
            ClientEventKind::Ping => {
                conn.send(ServerEvent::Pong);
                Ok(())
            }
        };

        if let Err(err) = result {
            if err.is_unexpected() {
                error!(
                    connection_id = %conn.id,
                    event = ?message.event,
                    error = %err,
                    "Event handler failed"
                );
            } else {
                debug!(
                    connection_id = %conn.id,
                    event = ?message.event,
                    error = %err,
                    "Event rejected"
                );
            }
            conn.send(err.to_event());
        }
    }

    /// `join_room`: authorize against the room record, register the
    /// membership, acknowledge with a snapshot, and announce the arrival.
    async fn join_room(
        &self,
        conn: &ConnectionHandle,
        data: Option<&serde_json::Value>,
    ) -> Result<(), EventError> {
        let payload = validate::join_room(data)?;

        let room = self
            .directory
            .room_by_id(payload.room_id)
            .await?
            .ok_or(EventError::RoomNotFound)?;

        if conn.role == Role::Participant {
            let agent_id = conn
                .agent_id()
                .ok_or_else(|| EventError::internal("participant connection without identity"))?;
            if !room.is_participant(agent_id) {
                return Err(EventError::NotParticipant);
            }
        }

        if room.is_private && conn.role == Role::Observer {
            return Err(EventError::PrivateRoom);
        }

        let newly_joined = self.registry.join(room.id, conn.clone());

        conn.send(ServerEvent::RoomJoined {
            room_id: room.id,
            status: room.status,
            config: room.config(),
            participants: room.participants.clone(),
        });

        if newly_joined {
            self.broadcaster
                .publish_to_room(
                    room.id,
                    Audience::All,
                    ServerEvent::ParticipantJoined {
                        room_id: room.id,
                        agent_id: conn.agent_id(),
                        agent_name: conn.agent_name().map(String::from),
                        role: conn.role,
                    },
                    Some(conn.id),
                )
                .await;

            info!(
                connection_id = %conn.id,
                room_id = %room.id,
                role = ?conn.role,
                agent_id = ?conn.agent_id(),
                "Connection joined room"
            );
        }

        Ok(())
    }

    /// `leave_room`: idempotent removal plus a departure broadcast when a
    /// membership was actually vacated.
    async fn leave_room(
        &self,
        conn: &ConnectionHandle,
        data: Option<&serde_json::Value>,
    ) -> Result<(), EventError> {
        let payload = validate::leave_room(data)?;

        if let Some(member) = self.registry.leave(conn.id, payload.room_id) {
            self.broadcaster
                .publish_to_room(
                    payload.room_id,
                    Audience::All,
                    ServerEvent::ParticipantLeft {
                        room_id: payload.room_id,
                        agent_id: member.agent_id(),
                        role: member.role,
                    },
                    Some(conn.id),
                )
                .await;

            info!(
                connection_id = %conn.id,
                room_id = %payload.room_id,
                "Connection left room"
            );
        }

        conn.send(ServerEvent::RoomLeft {
            room_id: payload.room_id,
        });

        Ok(())
    }

    /// `submit_turn`: participants only, one accepted turn per window.
    ///
    /// This core's responsibility ends at "accepted and rate-gated"; the
    /// turn content itself is handed to downstream processing.
    async fn submit_turn(
        &self,
        conn: &ConnectionHandle,
        data: Option<&serde_json::Value>,
    ) -> Result<(), EventError> {
        if conn.role != Role::Participant {
            return Err(EventError::forbidden("only agents can submit turns"));
        }

        let payload = validate::submit_turn(data)?;
        let agent_id = conn
            .agent_id()
            .ok_or_else(|| EventError::internal("participant connection without identity"))?;

        let key = turn_rate_key(agent_id);
        match self.store.acquire(&key, self.config.turn_window).await? {
            Claim::Held { retry_after } => Err(EventError::RateLimited {
                event: "submit_turn",
                retry_after,
            }),
            Claim::Acquired => {
                conn.send(ServerEvent::TurnAccepted {
                    room_id: payload.room_id,
                    processing: true,
                });

                info!(
                    agent_id = %agent_id,
                    room_id = %payload.room_id,
                    content_chars = payload.content.chars().count(),
                    sources = payload.sources.as_ref().map_or(0, Vec::len),
                    "Turn accepted"
                );

                Ok(())
            }
        }
    }

    /// `cast_vote`: requires a resolved identity (address-based identity
    /// is forgeable), exactly one vote per identity per room.
    async fn cast_vote(
        &self,
        conn: &ConnectionHandle,
        data: Option<&serde_json::Value>,
    ) -> Result<(), EventError> {
        let agent_id = conn
            .agent_id()
            .ok_or_else(|| EventError::unauthorized("authentication required to vote"))?;

        let payload = validate::cast_vote(data)?;

        let key = vote_flag_key(payload.room_id, agent_id);
        match self.store.acquire(&key, self.config.vote_ttl).await? {
            Claim::Held { .. } => Err(EventError::AlreadyVoted),
            Claim::Acquired => {
                conn.send(ServerEvent::VoteRecorded {
                    room_id: payload.room_id,
                    success: true,
                });

                info!(
                    voter = %agent_id,
                    voted_for = %payload.target_agent_id,
                    room_id = %payload.room_id,
                    "Vote recorded"
                );

                Ok(())
            }
        }
    }

    /// Disconnect cleanup: vacate every membership and announce each
    /// departure independently, best-effort.
    pub async fn disconnect(&self, conn: &ConnectionHandle) {
        for (room_id, member) in self.registry.leave_all(conn.id) {
            self.broadcaster
                .publish_to_room(
                    room_id,
                    Audience::All,
                    ServerEvent::ParticipantLeft {
                        room_id,
                        agent_id: member.agent_id(),
                        role: member.role,
                    },
                    Some(conn.id),
                )
                .await;
        }
    }
}

/// Store key throttling turn submission per agent.
fn turn_rate_key(agent_id: Uuid) -> String {
    format!("ws:ratelimit:submit_turn:{agent_id}")
}

/// Store key for the one-shot vote flag per room and identity.
fn vote_flag_key(room_id: Uuid, agent_id: Uuid) -> String {
    format!("ws:ratelimit:vote:{room_id}:{agent_id}")
}
