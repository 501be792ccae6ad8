//! Deterministic binary framing for the wire envelope.
//!
//! ```text
//! type:u8 | has_id:u8 | id:u16 if has_id | payload_len:u32 | payload:bytes
//! ```
//!
//! All integers are big-endian. The codec is payload-agnostic: it validates
//! the type byte and the declared length, but never looks inside `payload`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use shoal_core::constants::MAX_MESSAGE_SIZE;
use shoal_core::error::ProtocolError;
use shoal_core::message::{Message, MessageType};

/// Encode a message into its on-wire byte representation.
///
/// `encode(msg).len()` is bounded by `MAX_MESSAGE_SIZE` plus the fixed
/// 6-or-8-byte header, enforced by the caller via the rate limiter before the
/// message ever reaches this function.
pub fn encode(msg: &Message) -> BytesMut {
    let mut buf = BytesMut::with_capacity(8 + msg.payload.len());
    buf.put_u8(msg.msg_type.as_u8());
    match msg.id {
        Some(id) => {
            buf.put_u8(1);
            buf.put_u16(id);
        }
        None => buf.put_u8(0),
    }
    buf.put_u32(msg.payload.len() as u32);
    buf.put_slice(&msg.payload);
    buf
}

/// Decode one frame's worth of bytes into a [`Message`].
///
/// Validates, in order: (1) the type byte names a known [`MessageType`],
/// (2) the declared payload length does not exceed [`MAX_MESSAGE_SIZE`], and
/// (3) the buffer actually contains that many payload bytes.
pub fn decode(mut buf: Bytes) -> Result<Message, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::Truncated { declared: 0, got: buf.remaining() });
    }
    let type_byte = buf.get_u8();
    let msg_type = MessageType::from_u8(type_byte).ok_or(ProtocolError::UnknownType(type_byte))?;

    let has_id = buf.get_u8();
    let id = match has_id {
        0 => None,
        1 => {
            if buf.remaining() < 2 {
                return Err(ProtocolError::Truncated { declared: 2, got: buf.remaining() });
            }
            Some(buf.get_u16())
        }
        other => return Err(ProtocolError::Decode(format!("invalid has_id byte: {other}"))),
    };

    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated { declared: 4, got: buf.remaining() });
    }
    let payload_len = buf.get_u32();
    if payload_len as usize > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooBig { size: payload_len as usize, max: MAX_MESSAGE_SIZE });
    }
    if buf.remaining() < payload_len as usize {
        return Err(ProtocolError::Truncated { declared: payload_len, got: buf.remaining() });
    }

    let payload = buf.copy_to_bytes(payload_len as usize);
    Ok(Message::new(msg_type, id, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_preserves_fields() {
        let msg = Message::new(MessageType::RequestBlock, Some(42), Bytes::from_static(b"hello"));
        let encoded = encode(&msg).freeze();
        let decoded = decode(encoded).unwrap();
        assert_eq!(decoded.msg_type, msg.msg_type);
        assert_eq!(decoded.id, msg.id);
        assert_eq!(decoded.payload, msg.payload);
    }

    #[test]
    fn no_id_round_trips_as_none() {
        let msg = Message::new(MessageType::NewPeak, None, Bytes::new());
        let decoded = decode(encode(&msg).freeze()).unwrap();
        assert_eq!(decoded.id, None);
    }

    #[test]
    fn unknown_type_byte_is_a_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u8(2); // reserved/unassigned in MessageType
        buf.put_u8(0);
        buf.put_u32(0);
        assert!(matches!(decode(buf.freeze()), Err(ProtocolError::UnknownType(2))));
    }

    #[test]
    fn declared_length_over_max_is_message_too_big() {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::NewPeak as u8);
        buf.put_u8(0);
        buf.put_u32((MAX_MESSAGE_SIZE + 1) as u32);
        assert!(matches!(decode(buf.freeze()), Err(ProtocolError::MessageTooBig { .. })));
    }

    #[test]
    fn declared_length_at_exactly_max_is_accepted_if_present() {
        let payload = vec![0u8; 16];
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::NewPeak as u8);
        buf.put_u8(0);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
        assert!(decode(buf.freeze()).is_ok());
    }

    #[test]
    fn truncated_payload_is_an_error_not_a_panic() {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::NewPeak as u8);
        buf.put_u8(0);
        buf.put_u32(100);
        buf.put_slice(b"short");
        assert!(matches!(decode(buf.freeze()), Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn empty_buffer_is_an_error_not_a_panic() {
        assert!(decode(Bytes::new()).is_err());
    }
}
