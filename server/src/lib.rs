//! Moltarena Server - Real-time battle room hub.
//!
//! This crate provides the realtime component of Moltarena, responsible for:
//! - Authenticating WebSocket connections (agents and anonymous observers)
//! - Managing room membership and presence
//! - Validating and routing inbound room events
//! - Rate-gating turn submission and voting through a shared coordination store
//! - Broadcasting room events to every connection across all server instances
//!
//! # Architecture
//!
//! Each connection runs as its own task and feeds inbound events into the
//! [`router::EventRouter`]. Membership lives in the in-process
//! [`registry::RoomRegistry`]; the [`fanout::RoomBroadcaster`] delivers
//! outbound events locally and relays them to sibling instances over the
//! [`store::CoordinationStore`] pub/sub channel. Agent and room records are
//! owned by an external data service and only read here.

pub mod auth;
pub mod config;
pub mod connection;
pub mod data_service;
pub mod error;
pub mod fanout;
pub mod registry;
pub mod router;
pub mod routes;
pub mod sanitize;
pub mod store;
pub mod types;
pub mod validate;
