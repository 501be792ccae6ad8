//! Protocol-wide constants for the peer-to-peer server core.

/// Hard ceiling on an encoded envelope's payload size. Frames larger than this
/// are a protocol violation and close the connection.
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Default concurrent-connection ceiling before the accept loop pauses.
pub const DEFAULT_CONNECTION_LIMIT: usize = 250;

/// Tolerance margin above `connection_limit` absorbed by in-flight handshake races.
pub const CONNECTION_LIMIT_TOLERANCE: usize = 100;

/// Hysteresis gap below `connection_limit` at which the accept loop resumes.
/// Prevents pause/resume chatter when the count oscillates around the limit.
pub const ADMISSION_RESUME_HYSTERESIS: usize = 10;

/// Default ban duration for a handshake or protocol violation.
pub const DEFAULT_INVALID_PROTOCOL_BAN_SECS: u64 = 10;

/// Default ban duration for an inbound rate-limit violation.
pub const DEFAULT_RATE_LIMIT_BAN_SECS: u64 = 600;

/// Default TLS handshake timeout, in seconds.
pub const DEFAULT_SSL_HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Default timeout for the first application-level message (the handshake).
pub const DEFAULT_PROTOCOL_HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Default timeout for a `request()` awaiting a correlated reply.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Bound on the per-connection outbound writer queue. Enqueue beyond this is
/// rejected rather than suspended, so one slow peer cannot back up the process.
pub const WRITER_QUEUE_CAPACITY: usize = 1000;

/// Sliding-window duration used by the rate limiter, in seconds.
pub const RATE_LIMIT_RESET_SECS: u64 = 60;

/// Aggregate frequency cap shared by all non-transaction message types.
pub const NON_TX_FREQ: u64 = 1000;

/// Aggregate cumulative-size cap shared by all non-transaction message types.
pub const NON_TX_MAX_TOTAL_SIZE: u64 = 100 * 1024 * 1024;

pub const PROTOCOL_VERSION: &str = "0.0.1";

pub const DEFAULT_P2P_PORT: u16 = 18444;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerance_keeps_limit_comfortably_under_default_margin() {
        assert!(CONNECTION_LIMIT_TOLERANCE < DEFAULT_CONNECTION_LIMIT);
    }

    #[test]
    fn hysteresis_is_smaller_than_tolerance() {
        assert!(ADMISSION_RESUME_HYSTERESIS < CONNECTION_LIMIT_TOLERANCE);
    }
}
