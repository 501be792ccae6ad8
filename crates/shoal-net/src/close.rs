//! Close codes surfaced in the WebSocket close frame's reason string.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolSubReason {
    InvalidHandshake,
    RateLimitExceeded,
    UnknownMessageType,
    InvalidReplyType,
    DecodeError,
}

impl fmt::Display for ProtocolSubReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidHandshake => "INVALID_HANDSHAKE",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::UnknownMessageType => "UNKNOWN_MESSAGE_TYPE",
            Self::InvalidReplyType => "INVALID_REPLY_TYPE",
            Self::DecodeError => "DECODE_ERROR",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    Abnormal,
    MessageTooBig,
    ProtocolError(ProtocolSubReason),
    PolicyViolation,
    DuplicateConnection,
}

impl CloseCode {
    /// Whether closing with this code also bans the peer's host.
    pub fn bans_host(&self) -> bool {
        matches!(self, Self::MessageTooBig | Self::ProtocolError(_))
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "NORMAL"),
            Self::Abnormal => write!(f, "ABNORMAL"),
            Self::MessageTooBig => write!(f, "MESSAGE_TOO_BIG"),
            Self::ProtocolError(sub) => write!(f, "PROTOCOL_ERROR:{sub}"),
            Self::PolicyViolation => write!(f, "POLICY_VIOLATION"),
            Self::DuplicateConnection => write!(f, "DUPLICATE_CONNECTION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_and_oversize_frames_ban_the_host() {
        assert!(CloseCode::MessageTooBig.bans_host());
        assert!(CloseCode::ProtocolError(ProtocolSubReason::InvalidHandshake).bans_host());
    }

    #[test]
    fn normal_and_duplicate_do_not_ban() {
        assert!(!CloseCode::Normal.bans_host());
        assert!(!CloseCode::DuplicateConnection.bans_host());
        assert!(!CloseCode::PolicyViolation.bans_host());
    }

    #[test]
    fn display_includes_sub_reason() {
        assert_eq!(
            CloseCode::ProtocolError(ProtocolSubReason::RateLimitExceeded).to_string(),
            "PROTOCOL_ERROR:RATE_LIMIT_EXCEEDED"
        );
    }
}
