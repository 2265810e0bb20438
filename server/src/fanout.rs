//! Room broadcast fan-out.
//!
//! [`RoomBroadcaster::publish_to_room`] must reach every connection with a
//! matching membership, regardless of which server process holds it. Local
//! members are dispatched immediately through the
//! [`RoomRegistry`](crate::registry::RoomRegistry); for everyone else the
//! event travels as an origin-tagged envelope on the coordination store's
//! shared channel. Each process runs one relay task that re-dispatches
//! envelopes from *other* origins to its own local members.
//!
//! # Ordering
//!
//! Handlers publish sequentially per connection, and both the local path
//! and the store's channel preserve per-publisher order, so events from a
//! single process for the same room arrive everywhere in publish order.
//! No ordering is promised across rooms or across publisher processes.
//!
//! # Failure policy
//!
//! A failed cross-instance publish is logged and swallowed: local members
//! have already been served, and a notification gap must never fail the
//! action that triggered it.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::registry::RoomRegistry;
use crate::store::CoordinationStore;
use crate::types::{Audience, ServerEvent};

/// Shared pub/sub channel carrying room broadcast envelopes.
pub const ROOMS_CHANNEL: &str = "moltarena:rooms";

/// Delay before the relay retries a failed or ended subscription.
const RELAY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A room broadcast in transit between server processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    /// Publishing process; the relay skips its own envelopes.
    origin: Uuid,
    room_id: Uuid,
    audience: Audience,
    /// Connection to skip (the event's originator). Only meaningful on the
    /// process that owns it.
    #[serde(skip_serializing_if = "Option::is_none")]
    exclude: Option<Uuid>,
    event: ServerEvent,
}

/// Fans room events out to local members and sibling instances.
///
/// Cheap to clone; clones share the registry, the store, and the process
/// identity.
#[derive(Clone)]
pub struct RoomBroadcaster {
    process_id: Uuid,
    registry: Arc<RoomRegistry>,
    store: Arc<dyn CoordinationStore>,
}

impl std::fmt::Debug for RoomBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomBroadcaster")
            .field("process_id", &self.process_id)
            .finish_non_exhaustive()
    }
}

impl RoomBroadcaster {
    /// Creates a broadcaster with a fresh process identity.
    #[must_use]
    pub fn new(registry: Arc<RoomRegistry>, store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            process_id: Uuid::new_v4(),
            registry,
            store,
        }
    }

    /// This broadcaster's origin tag.
    #[must_use]
    pub fn process_id(&self) -> Uuid {
        self.process_id
    }

    /// Delivers an event to every matching member of a room, across all
    /// processes.
    ///
    /// Local members receive it synchronously; remote delivery is
    /// best-effort and failures are logged, never propagated.
    pub async fn publish_to_room(
        &self,
        room_id: Uuid,
        audience: Audience,
        event: ServerEvent,
        exclude: Option<Uuid>,
    ) {
        let delivered = self
            .registry
            .dispatch_local(room_id, audience, &event, exclude);
        trace!(%room_id, ?audience, delivered, "Dispatched event to local members");

        let envelope = Envelope {
            origin: self.process_id,
            room_id,
            audience,
            exclude,
            event,
        };

        match serde_json::to_string(&envelope) {
            Ok(json) => {
                if let Err(err) = self.store.publish(ROOMS_CHANNEL, json).await {
                    warn!(%room_id, error = %err, "Cross-instance publish failed");
                }
            }
            Err(err) => {
                warn!(%room_id, error = %err, "Failed to encode broadcast envelope");
            }
        }
    }

    /// Spawns the relay task that re-emits sibling instances' broadcasts
    /// to local members.
    ///
    /// The task resubscribes with a delay whenever the subscription fails
    /// or its stream ends; it runs until aborted.
    pub fn spawn_relay_task(&self) -> tokio::task::JoinHandle<()> {
        let broadcaster = self.clone();

        tokio::spawn(async move {
            loop {
                match broadcaster.store.subscribe(ROOMS_CHANNEL).await {
                    Ok(mut stream) => {
                        info!(channel = ROOMS_CHANNEL, "Broadcast relay subscribed");
                        while let Some(payload) = stream.next().await {
                            broadcaster.handle_relayed(&payload);
                        }
                        warn!("Broadcast relay stream ended, resubscribing");
                    }
                    Err(err) => {
                        warn!(error = %err, "Broadcast relay subscription failed, retrying");
                    }
                }

                tokio::time::sleep(RELAY_RETRY_DELAY).await;
            }
        })
    }

    /// Re-dispatches one relayed envelope, skipping our own.
    fn handle_relayed(&self, payload: &str) {
        match serde_json::from_str::<Envelope>(payload) {
            Ok(envelope) => {
                if envelope.origin == self.process_id {
                    return;
                }
                let delivered = self.registry.dispatch_local(
                    envelope.room_id,
                    envelope.audience,
                    &envelope.event,
                    envelope.exclude,
                );
                trace!(
                    room_id = %envelope.room_id,
                    origin = %envelope.origin,
                    delivered,
                    "Dispatched relayed event"
                );
            }
            Err(err) => {
                debug!(error = %err, "Discarding malformed relay payload");
            }
        }
    }
}
