//! # shoal-net — mutual-TLS WebSocket peer-to-peer server core.
//!
//! Binary-framed envelope over a WebSocket upgraded on top of a mutual-TLS
//! socket, a sliding-window rate limiter per connection, reply correlation
//! against a fixed protocol state machine, a handler registry keyed by
//! `(NodeType, MessageType)`, pausable admission control, and a host-keyed
//! ban list.
//!
//! The main entry point is [`Server`], which owns the listener, the ban
//! list, and the live connection table, and spawns one reader task and one
//! writer task per [`Connection`] it establishes.

pub mod ban;
pub mod broadcast;
pub mod close;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod rate_limiter;
pub mod server;
pub mod tls;

pub use ban::{BanList, BanReason};
pub use broadcast::BroadcastRouter;
pub use close::{CloseCode, ProtocolSubReason};
pub use config::NetworkConfig;
pub use connection::{Connection, ConnectionState, Direction};
pub use dispatcher::{HandlerTable, HandlerTableBuilder};
pub use rate_limiter::{RateLimitTables, RateLimiter, RlSettings};
pub use server::{LocalIdentity, Server};
