//! Coordination store: distributed rate-limit claims and pub/sub fan-out.
//!
//! Multiple server instances coordinate through a shared key-value/pub-sub
//! store. This module defines the [`CoordinationStore`] trait the rest of
//! the core depends on, plus two implementations:
//!
//! - [`MemoryStore`] - single-process, for tests and broker-less
//!   deployments.
//! - [`RedisStore`] - Redis-backed, for multi-instance deployments.
//!
//! # Claims
//!
//! [`CoordinationStore::acquire`] is an atomic set-if-absent with a TTL.
//! The same primitive backs both throttling (a claim per window) and
//! one-shot gating (a claim whose TTL outlasts the room). Redis uses
//! `SET key v NX PX ttl`, which is atomic server-side; the in-memory
//! backend checks and inserts under a single lock.
//!
//! # Timeouts
//!
//! Every Redis call carries a bounded timeout. A timeout surfaces as
//! [`StoreError::Timeout`], which the event pipeline reports as
//! service-unavailable, never as a connection-fatal error.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

/// Bound on every store operation.
pub const STORE_OP_TIMEOUT: Duration = Duration::from_secs(2);

/// Capacity of each in-memory pub/sub channel.
const MEMORY_CHANNEL_CAPACITY: usize = 256;

/// Errors raised by coordination store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The operation exceeded [`STORE_OP_TIMEOUT`].
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The store rejected or dropped the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of an [`CoordinationStore::acquire`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The key was free; the caller now holds it for the TTL.
    Acquired,

    /// Another claim is active; `retry_after` is its remaining TTL.
    Held {
        /// Remaining time until the existing claim expires.
        retry_after: Duration,
    },
}

impl Claim {
    /// Returns `true` if the claim was newly acquired.
    #[must_use]
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired)
    }

    /// The remaining wait time when held, or `None` when acquired.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Acquired => None,
            Self::Held { retry_after } => Some(*retry_after),
        }
    }
}

/// A stream of payloads delivered on a subscribed channel.
pub type PayloadStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Shared key-value/pub-sub store used for cross-instance coordination.
///
/// Passed explicitly into every component that needs it, so tests run
/// against [`MemoryStore`] deterministically.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomically claims `key` for `ttl` if no live claim exists.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Claim, StoreError>;

    /// Publishes a payload on a channel. Returns the number of immediate
    /// receivers (zero is not an error).
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError>;

    /// Subscribes to a channel, receiving payloads published after this
    /// call returns.
    async fn subscribe(&self, channel: &str) -> Result<PayloadStream, StoreError>;
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug)]
struct MemoryStoreInner {
    /// Live claims mapped to their expiry instants.
    claims: Mutex<HashMap<String, Instant>>,

    /// One broadcast channel per pub/sub channel name.
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

/// Single-process coordination store.
///
/// Cheap to clone; clones share state. Claims expire lazily on access and
/// eagerly via [`MemoryStore::spawn_cleanup_task`].
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryStoreInner {
                claims: Mutex::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Removes expired claims. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let mut claims = self.inner.claims.lock().unwrap();
        let before = claims.len();
        let now = Instant::now();
        claims.retain(|_, expiry| *expiry > now);
        before - claims.len()
    }

    /// Current number of live and not-yet-purged claims.
    #[must_use]
    pub fn claim_count(&self) -> usize {
        self.inner.claims.lock().unwrap().len()
    }

    /// Spawns a background task that periodically purges expired claims.
    ///
    /// Long-TTL one-shot flags (votes) would otherwise accumulate for the
    /// life of the process.
    pub fn spawn_cleanup_task(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;
                let removed = store.purge_expired();
                if removed > 0 {
                    debug!(removed_count = removed, "Purged expired store claims");
                }
            }
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Claim, StoreError> {
        let mut claims = self.inner.claims.lock().unwrap();
        let now = Instant::now();

        if let Some(expiry) = claims.get(key) {
            if *expiry > now {
                return Ok(Claim::Held {
                    retry_after: *expiry - now,
                });
            }
        }

        claims.insert(key.to_string(), now + ttl);
        trace!(key, ttl_ms = ttl.as_millis() as u64, "Claim acquired");
        Ok(Claim::Acquired)
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError> {
        let sender = self.inner.channels.lock().unwrap().get(channel).cloned();

        match sender {
            Some(tx) => Ok(tx.send(payload).unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<PayloadStream, StoreError> {
        let rx = {
            let mut channels = self.inner.channels.lock().unwrap();
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(MEMORY_CHANNEL_CAPACITY).0)
                .subscribe()
        };

        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Memory store subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

// ============================================================================
// Redis backend
// ============================================================================

/// Redis-backed coordination store for multi-instance deployments.
///
/// Claims use the atomic `SET NX PX` primitive; pub/sub uses a dedicated
/// subscriber connection per [`CoordinationStore::subscribe`] call. The
/// connection manager reconnects automatically after transient failures.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connects to Redis at the given URL (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the URL is invalid or the
    /// initial connection fails, and [`StoreError::Timeout`] when it takes
    /// longer than [`STORE_OP_TIMEOUT`].
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let conn = match timeout(STORE_OP_TIMEOUT, client.get_connection_manager()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(StoreError::Unavailable(e.to_string())),
            Err(_) => return Err(StoreError::Timeout(STORE_OP_TIMEOUT)),
        };

        debug!(url, "Connected to Redis coordination store");

        Ok(Self { client, conn })
    }

    /// Runs a command against the shared connection under the operation
    /// timeout.
    async fn run_cmd<T: redis::FromRedisValue>(&self, cmd: redis::Cmd) -> Result<T, StoreError> {
        let mut conn = self.conn.clone();

        match timeout(STORE_OP_TIMEOUT, cmd.query_async(&mut conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StoreError::Unavailable(e.to_string())),
            Err(_) => Err(StoreError::Timeout(STORE_OP_TIMEOUT)),
        }
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Claim, StoreError> {
        let mut set = redis::cmd("SET");
        set.arg(key)
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64);

        let response: Option<String> = self.run_cmd(set).await?;
        if response.is_some() {
            trace!(key, "Claim acquired");
            return Ok(Claim::Acquired);
        }

        // Advisory only: the claim exists, report its remaining TTL.
        let mut pttl = redis::cmd("PTTL");
        pttl.arg(key);
        let remaining_ms: i64 = self.run_cmd(pttl).await?;

        let retry_after = if remaining_ms > 0 {
            Duration::from_millis(remaining_ms as u64)
        } else {
            // The claim expired between SET and PTTL; the full window is
            // the safest hint.
            ttl
        };

        Ok(Claim::Held { retry_after })
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError> {
        let mut publish = redis::cmd("PUBLISH");
        publish.arg(channel).arg(payload);

        let receivers: i64 = self.run_cmd(publish).await?;
        Ok(receivers.max(0) as usize)
    }

    async fn subscribe(&self, channel: &str) -> Result<PayloadStream, StoreError> {
        let mut pubsub = match timeout(STORE_OP_TIMEOUT, self.client.get_async_pubsub()).await {
            Ok(Ok(pubsub)) => pubsub,
            Ok(Err(e)) => return Err(StoreError::Unavailable(e.to_string())),
            Err(_) => return Err(StoreError::Timeout(STORE_OP_TIMEOUT)),
        };

        match timeout(STORE_OP_TIMEOUT, pubsub.subscribe(channel)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(StoreError::Unavailable(e.to_string())),
            Err(_) => return Err(StoreError::Timeout(STORE_OP_TIMEOUT)),
        }

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });

        Ok(Box::pin(stream))
    }
}
