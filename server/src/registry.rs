//! In-process room membership registry.
//!
//! Tracks which connections belong to which rooms. The maps are sharded
//! (`DashMap`), so operations on unrelated rooms never serialize behind a
//! global lock. Sub-audiences are derived from each member's role rather
//! than stored separately, which makes it impossible for an observer to end
//! up addressable through the participant-only audience.
//!
//! All operations tolerate races with disconnect cleanup: leaving a room
//! that was already vacated is a no-op, never an error.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use tracing::trace;
use uuid::Uuid;

use crate::connection::ConnectionHandle;
use crate::types::{Audience, Role, ServerEvent};

/// Members of a single room, keyed by connection id.
#[derive(Debug, Default)]
struct RoomMembers {
    members: HashMap<Uuid, ConnectionHandle>,
}

/// Shared membership state for one server process.
///
/// # Invariants
///
/// - At most one membership per (connection, room).
/// - `memberships` is the exact reverse index of `rooms`; both are updated
///   together under the relevant shard locks.
/// - Empty room entries are removed so `room_count` reflects live rooms.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    /// Room id → members.
    rooms: DashMap<Uuid, RoomMembers>,

    /// Connection id → rooms it belongs to.
    memberships: DashMap<Uuid, HashSet<Uuid>>,
}

impl RoomRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection to a room.
    ///
    /// Idempotent: returns `true` only when a membership was newly
    /// created, so the caller emits at most one join notification.
    pub fn join(&self, room_id: Uuid, handle: ConnectionHandle) -> bool {
        let conn_id = handle.id;

        {
            let mut room = self.rooms.entry(room_id).or_default();
            if room.members.contains_key(&conn_id) {
                return false;
            }
            room.members.insert(conn_id, handle);
        }

        self.memberships.entry(conn_id).or_default().insert(room_id);

        trace!(%room_id, connection_id = %conn_id, "Joined room");
        true
    }

    /// Removes a connection's membership in a room.
    ///
    /// Returns the removed member handle, or `None` when the connection
    /// held no membership (a no-op, not an error).
    pub fn leave(&self, conn_id: Uuid, room_id: Uuid) -> Option<ConnectionHandle> {
        let removed = {
            let mut room = self.rooms.get_mut(&room_id)?;
            room.members.remove(&conn_id)
        };

        if removed.is_some() {
            self.rooms.remove_if(&room_id, |_, r| r.members.is_empty());

            if let Some(mut set) = self.memberships.get_mut(&conn_id) {
                set.remove(&room_id);
            }
            self.memberships.remove_if(&conn_id, |_, s| s.is_empty());

            trace!(%room_id, connection_id = %conn_id, "Left room");
        }

        removed
    }

    /// Removes every membership of a connection.
    ///
    /// Returns the vacated (room, member) pairs so the caller can notify
    /// each room independently. Each room's cleanup stands alone; no
    /// ordering is implied.
    pub fn leave_all(&self, conn_id: Uuid) -> Vec<(Uuid, ConnectionHandle)> {
        let room_ids: Vec<Uuid> = self
            .memberships
            .remove(&conn_id)
            .map(|(_, set)| set.into_iter().collect())
            .unwrap_or_default();

        let mut vacated = Vec::with_capacity(room_ids.len());
        for room_id in room_ids {
            let removed = {
                self.rooms
                    .get_mut(&room_id)
                    .and_then(|mut room| room.members.remove(&conn_id))
            };
            if let Some(member) = removed {
                self.rooms.remove_if(&room_id, |_, r| r.members.is_empty());
                vacated.push((room_id, member));
            }
        }

        if !vacated.is_empty() {
            trace!(connection_id = %conn_id, rooms = vacated.len(), "Left all rooms");
        }

        vacated
    }

    /// Returns `true` if the connection is a member of the room.
    #[must_use]
    pub fn is_member(&self, conn_id: Uuid, room_id: Uuid) -> bool {
        self.rooms
            .get(&room_id)
            .is_some_and(|room| room.members.contains_key(&conn_id))
    }

    /// Number of members in a room (zero for unknown rooms).
    #[must_use]
    pub fn member_count(&self, room_id: Uuid) -> usize {
        self.rooms.get(&room_id).map_or(0, |r| r.members.len())
    }

    /// Number of rooms with at least one member on this process.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Delivers an event to the local members of a room.
    ///
    /// Filters by audience, skips `exclude`, and never blocks: each member
    /// is reached through its non-blocking queue. Returns how many members
    /// accepted the event.
    pub fn dispatch_local(
        &self,
        room_id: Uuid,
        audience: Audience,
        event: &ServerEvent,
        exclude: Option<Uuid>,
    ) -> usize {
        let Some(room) = self.rooms.get(&room_id) else {
            return 0;
        };

        let mut delivered = 0;
        for (conn_id, member) in &room.members {
            if Some(*conn_id) == exclude {
                continue;
            }
            if !audience_matches(audience, member.role) {
                continue;
            }
            if member.send(event.clone()) {
                delivered += 1;
            }
        }

        delivered
    }
}

/// Whether a member with `role` belongs to `audience`.
fn audience_matches(audience: Audience, role: Role) -> bool {
    match audience {
        Audience::All => true,
        Audience::Participants => role == Role::Participant,
        Audience::Observers => role == Role::Observer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn observer() -> (ConnectionHandle, mpsc::Receiver<ServerEvent>) {
        ConnectionHandle::new(Role::Observer, None)
    }

    fn participant() -> (ConnectionHandle, mpsc::Receiver<ServerEvent>) {
        ConnectionHandle::new(Role::Participant, None)
    }

    #[test]
    fn join_creates_single_membership() {
        let registry = RoomRegistry::new();
        let room = Uuid::new_v4();
        let (conn, _rx) = observer();

        assert!(registry.join(room, conn.clone()));
        assert!(registry.is_member(conn.id, room));
        assert_eq!(registry.member_count(room), 1);
        assert_eq!(registry.room_count(), 1);
    }

    #[test]
    fn join_is_idempotent() {
        let registry = RoomRegistry::new();
        let room = Uuid::new_v4();
        let (conn, _rx) = observer();

        assert!(registry.join(room, conn.clone()));
        assert!(!registry.join(room, conn.clone()));
        assert_eq!(registry.member_count(room), 1);
    }

    #[test]
    fn connection_can_hold_multiple_rooms() {
        let registry = RoomRegistry::new();
        let room_a = Uuid::new_v4();
        let room_b = Uuid::new_v4();
        let (conn, _rx) = participant();

        assert!(registry.join(room_a, conn.clone()));
        assert!(registry.join(room_b, conn.clone()));
        assert!(registry.is_member(conn.id, room_a));
        assert!(registry.is_member(conn.id, room_b));
        assert_eq!(registry.room_count(), 2);
    }

    #[test]
    fn leave_removes_membership_and_empty_room() {
        let registry = RoomRegistry::new();
        let room = Uuid::new_v4();
        let (conn, _rx) = observer();

        registry.join(room, conn.clone());
        let removed = registry.leave(conn.id, room);

        assert!(removed.is_some());
        assert_eq!(removed.unwrap().id, conn.id);
        assert!(!registry.is_member(conn.id, room));
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn leave_without_membership_is_noop() {
        let registry = RoomRegistry::new();
        let room = Uuid::new_v4();
        let (conn, _rx) = observer();

        assert!(registry.leave(conn.id, room).is_none());

        registry.join(room, conn.clone());
        assert!(registry.leave(conn.id, room).is_some());
        // Second leave: already gone.
        assert!(registry.leave(conn.id, room).is_none());
    }

    #[test]
    fn leave_all_vacates_every_room() {
        let registry = RoomRegistry::new();
        let room_a = Uuid::new_v4();
        let room_b = Uuid::new_v4();
        let (conn, _rx) = participant();
        let (other, _rx2) = observer();

        registry.join(room_a, conn.clone());
        registry.join(room_b, conn.clone());
        registry.join(room_a, other.clone());

        let vacated = registry.leave_all(conn.id);

        assert_eq!(vacated.len(), 2);
        let rooms: HashSet<Uuid> = vacated.iter().map(|(r, _)| *r).collect();
        assert!(rooms.contains(&room_a));
        assert!(rooms.contains(&room_b));

        assert!(!registry.is_member(conn.id, room_a));
        assert!(!registry.is_member(conn.id, room_b));
        // The other member is untouched; room A survives, room B is gone.
        assert_eq!(registry.member_count(room_a), 1);
        assert_eq!(registry.room_count(), 1);
    }

    #[test]
    fn leave_all_with_no_memberships_is_empty() {
        let registry = RoomRegistry::new();
        assert!(registry.leave_all(Uuid::new_v4()).is_empty());
    }

    #[tokio::test]
    async fn dispatch_reaches_all_members() {
        let registry = RoomRegistry::new();
        let room = Uuid::new_v4();
        let (a, mut rx_a) = participant();
        let (b, mut rx_b) = observer();

        registry.join(room, a);
        registry.join(room, b);

        let delivered = registry.dispatch_local(room, Audience::All, &ServerEvent::Pong, None);
        assert_eq!(delivered, 2);
        assert_eq!(rx_a.recv().await, Some(ServerEvent::Pong));
        assert_eq!(rx_b.recv().await, Some(ServerEvent::Pong));
    }

    #[tokio::test]
    async fn dispatch_filters_by_audience() {
        let registry = RoomRegistry::new();
        let room = Uuid::new_v4();
        let (agent, mut agent_rx) = participant();
        let (viewer, mut viewer_rx) = observer();

        registry.join(room, agent);
        registry.join(room, viewer);

        let delivered =
            registry.dispatch_local(room, Audience::Participants, &ServerEvent::Pong, None);
        assert_eq!(delivered, 1);
        assert_eq!(agent_rx.recv().await, Some(ServerEvent::Pong));
        assert!(viewer_rx.try_recv().is_err());

        let delivered =
            registry.dispatch_local(room, Audience::Observers, &ServerEvent::Pong, None);
        assert_eq!(delivered, 1);
        assert_eq!(viewer_rx.recv().await, Some(ServerEvent::Pong));
    }

    #[tokio::test]
    async fn dispatch_excludes_the_given_connection() {
        let registry = RoomRegistry::new();
        let room = Uuid::new_v4();
        let (sender, mut sender_rx) = participant();
        let (other, mut other_rx) = observer();
        let sender_id = sender.id;

        registry.join(room, sender);
        registry.join(room, other);

        let delivered =
            registry.dispatch_local(room, Audience::All, &ServerEvent::Pong, Some(sender_id));
        assert_eq!(delivered, 1);
        assert!(sender_rx.try_recv().is_err());
        assert_eq!(other_rx.recv().await, Some(ServerEvent::Pong));
    }

    #[test]
    fn dispatch_to_unknown_room_delivers_nothing() {
        let registry = RoomRegistry::new();
        assert_eq!(
            registry.dispatch_local(Uuid::new_v4(), Audience::All, &ServerEvent::Pong, None),
            0
        );
    }

    #[test]
    fn audience_matching_table() {
        assert!(audience_matches(Audience::All, Role::Participant));
        assert!(audience_matches(Audience::All, Role::Observer));
        assert!(audience_matches(Audience::Participants, Role::Participant));
        assert!(!audience_matches(Audience::Participants, Role::Observer));
        assert!(audience_matches(Audience::Observers, Role::Observer));
        assert!(!audience_matches(Audience::Observers, Role::Participant));
    }
}
