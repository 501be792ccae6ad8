//! Error taxonomy for the peer-to-peer server core.
//!
//! Each domain gets its own small enum; [`ShoalError`] aggregates them via
//! `#[from]` so call sites can use `?` freely. Transport and protocol errors
//! never escape a connection — they are always converted into a `close()`
//! call (see `shoal-net::connection`) rather than propagated to a caller.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("socket closed")]
    Closed,
    #[error("tls handshake failed: {0}")]
    TlsHandshake(String),
    #[error("tls handshake timed out")]
    TlsHandshakeTimeout,
    #[error("read error: {0}")]
    Read(String),
    #[error("write error: {0}")]
    Write(String),
}

/// Protocol-level violations. All of these are fatal to the connection and
/// ban the peer's host for `invalid_protocol_ban_seconds`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown message type: {0}")]
    UnknownType(u8),
    #[error("frame of {size} bytes exceeds max message size {max}")]
    MessageTooBig { size: usize, max: usize },
    #[error("envelope truncated: declared {declared} bytes, got {got}")]
    Truncated { declared: u32, got: usize },
    #[error("first message was not a handshake")]
    InvalidHandshake,
    #[error("handshake network_id mismatch: expected {expected}, got {got}")]
    NetworkIdMismatch { expected: String, got: String },
    #[error("handshake node_type {0} is outside the closed enum")]
    UnknownNodeType(u8),
    #[error("protocol handshake timed out")]
    HandshakeTimeout,
    #[error("reply type {received:?} is not a valid reply to {sent:?}")]
    InvalidReplyType { sent: String, received: String },
    #[error("decode error: {0}")]
    Decode(String),
}

/// Rate-limit violations. Inbound violations are fatal and ban the host;
/// outbound violations are non-fatal (the message is just dropped).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("per-message-type frequency limit exceeded for type {msg_type}")]
    FrequencyExceeded { msg_type: u8 },
    #[error("per-message-type cumulative size limit exceeded for type {msg_type}")]
    CumulativeSizeExceeded { msg_type: u8 },
    #[error("message of {size} bytes exceeds per-message size cap {max}")]
    MessageSizeExceeded { size: usize, max: usize },
    #[error("non-transaction aggregate frequency cap exceeded")]
    NonTxFrequencyExceeded,
    #[error("non-transaction aggregate size cap exceeded")]
    NonTxSizeExceeded,
}

/// A connection- or dispatch-level failure surfaced to a caller of `send`
/// or `request`. These are the only errors this crate lets escape a
/// connection's internal tasks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,
    #[error("message rejected by the outbound rate limiter")]
    Rejected,
    #[error("request timed out waiting for a reply")]
    Timeout,
    #[error("request was cancelled")]
    Cancelled,
    #[error("message type has no entry in the reply state machine")]
    NoReplyExpected,
}

/// Host is already banned, or the peer is already connected under this node id.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("host {0} is banned until {1}")]
    Banned(String, String),
    #[error("duplicate connection to node {0}")]
    DuplicateConnection(String),
}

/// Startup-time configuration or handler-registry errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("duplicate handler registered for ({node_type:?}, {msg_type})")]
    DuplicateHandler { node_type: String, msg_type: u8 },
    #[error("VALID_REPLY_MAP and NO_REPLY_EXPECTED overlap on type {0}")]
    ReplyTableOverlap(u8),
    #[error("invalid TLS material: {0}")]
    Tls(String),
    #[error("invalid config value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ShoalError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("handler error: {0}")]
    Handler(String),
}
