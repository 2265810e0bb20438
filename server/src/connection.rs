//! Per-connection WebSocket lifecycle.
//!
//! Each accepted connection runs [`run`] as its own task. The socket is
//! split: a writer half drains the connection's bounded outbound queue,
//! while the reader half feeds inbound frames to the
//! [`EventRouter`](crate::router::EventRouter). Disconnection (a close
//! frame, a transport error, or the kill token firing) funnels into a
//! single cleanup path that vacates every room membership exactly once.
//!
//! # Back-pressure
//!
//! The outbound queue is bounded. A broadcast that finds the queue full
//! cancels the connection's kill token instead of waiting: one slow
//! consumer is closed rather than stalling the whole room.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::ConnIdentity;
use crate::router::EventRouter;
use crate::types::{AgentRecord, Role, ServerEvent};

/// Bound on each connection's outbound queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// A handle through which the rest of the server reaches one connection.
///
/// Handles are cheap to clone; the room registry stores one per membership.
/// All mutation of connection-visible state goes through the owning task;
/// a handle only enqueues outbound events or requests a close.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Opaque connection identifier.
    pub id: Uuid,

    /// Role fixed at handshake.
    pub role: Role,

    /// Resolved agent for participants; `None` for observers.
    pub agent: Option<AgentRecord>,

    tx: mpsc::Sender<ServerEvent>,
    kill: CancellationToken,
}

impl ConnectionHandle {
    /// Creates a handle and the receiver its connection task drains.
    #[must_use]
    pub fn new(role: Role, agent: Option<AgentRecord>) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        (
            Self {
                id: Uuid::new_v4(),
                role,
                agent,
                tx,
                kill: CancellationToken::new(),
            },
            rx,
        )
    }

    /// The agent id, if the connection is a participant.
    #[must_use]
    pub fn agent_id(&self) -> Option<Uuid> {
        self.agent.as_ref().map(|a| a.id)
    }

    /// The agent display name, if the connection is a participant.
    #[must_use]
    pub fn agent_name(&self) -> Option<&str> {
        self.agent.as_ref().map(|a| a.display_name.as_str())
    }

    /// Enqueues an outbound event without blocking.
    ///
    /// A full queue kills the connection: the member is too slow to keep
    /// up and holding the broadcast would stall the room. Returns `true`
    /// when the event was enqueued.
    pub fn send(&self, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    connection_id = %self.id,
                    "Outbound queue full, closing slow connection"
                );
                self.kill.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Token cancelled when the connection must close.
    #[must_use]
    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }
}

/// Decrements the connection gauge when the connection task ends.
struct ConnectionGauge(Arc<AtomicUsize>);

impl ConnectionGauge {
    fn register(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for ConnectionGauge {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Drives one WebSocket connection to completion.
///
/// Sends the `connected` acknowledgment, then pumps frames until the
/// client disconnects or the kill token fires, and finally vacates every
/// room membership.
pub async fn run(
    socket: WebSocket,
    identity: ConnIdentity,
    router: Arc<EventRouter>,
    active_connections: Arc<AtomicUsize>,
) {
    let (handle, outbound_rx) = ConnectionHandle::new(identity.role, identity.agent);
    let _gauge = ConnectionGauge::register(&active_connections);

    info!(
        connection_id = %handle.id,
        role = ?handle.role,
        agent_id = ?handle.agent_id(),
        "WebSocket connection established"
    );

    handle.send(ServerEvent::Connected {
        connection_id: handle.id,
        role: handle.role,
        agent_id: handle.agent_id(),
    });

    let (sender, receiver) = socket.split();
    let writer = tokio::spawn(write_outbound(sender, outbound_rx));

    read_inbound(receiver, &handle, &router).await;

    // Cleanup runs exactly once, whatever ended the read loop. In-flight
    // handlers racing this observe idempotent no-op leaves.
    router.disconnect(&handle).await;
    writer.abort();

    info!(connection_id = %handle.id, "WebSocket connection closed");
}

/// Serializes queued events onto the socket until the queue closes or the
/// peer goes away.
async fn write_outbound(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<ServerEvent>,
) {
    while let Some(event) = outbound_rx.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => {
                if sender.send(Message::Text(json.into())).await.is_err() {
                    debug!("Peer gone, stopping outbound writer");
                    break;
                }
            }
            Err(err) => {
                error!(error = %err, "Failed to serialize outbound event");
            }
        }
    }

    let _ = sender.close().await;
}

/// Feeds inbound text frames to the router until disconnect.
async fn read_inbound(
    mut receiver: SplitStream<WebSocket>,
    handle: &ConnectionHandle,
    router: &Arc<EventRouter>,
) {
    let kill = handle.kill_token();

    loop {
        tokio::select! {
            () = kill.cancelled() => {
                debug!(connection_id = %handle.id, "Connection killed");
                break;
            }
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    router.dispatch(handle, &text).await;
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(connection_id = %handle.id, "Client sent close frame");
                    break;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => {
                    // axum answers pings; binary frames are not part of the
                    // protocol and are ignored.
                }
                Some(Err(err)) => {
                    debug!(connection_id = %handle.id, error = %err, "WebSocket error");
                    break;
                }
                None => break,
            }
        }
    }
}
