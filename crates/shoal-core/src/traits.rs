//! The handler contract applications implement against.
//!
//! The core dispatches inbound messages through this trait instead of a
//! reflection-based registry: one object per `(NodeType, MessageType)` pair,
//! looked up in a static table built at startup. Handlers are opaque to the
//! core — they only see the raw payload bytes and a read-only peer context.

use crate::error::ShoalError;
use crate::message::{Capability, MessageType, NodeId, NodeType};
use async_trait::async_trait;
use bytes::Bytes;

/// Read-only context handed to a handler alongside the payload.
#[derive(Debug, Clone)]
pub struct PeerContext {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub peer_addr: String,
    pub mutual_capabilities: Vec<Capability>,
}

/// Implemented by application code for each `(NodeType, MessageType)` it
/// wants to handle. Returning `Ok(Some((type, bytes)))` enqueues a reply of
/// that type on the same connection, carrying the request's correlation id —
/// the handler picks the type since a request can have more than one valid
/// reply (e.g. `RespondBlock` or `RejectBlock`). `Ok(None)` means the message
/// was fire-and-forget. An `Err` is logged and absorbed — it never closes
/// the connection.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        peer: &PeerContext,
        payload: Bytes,
    ) -> Result<Option<(MessageType, Bytes)>, ShoalError>;
}

fn _assert_message_handler_object_safe(_h: &dyn MessageHandler) {}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl MessageHandler for EchoHandler {
        async fn handle(
            &self,
            _peer: &PeerContext,
            payload: Bytes,
        ) -> Result<Option<(MessageType, Bytes)>, ShoalError> {
            Ok(Some((MessageType::RespondBlock, payload)))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl MessageHandler for FailingHandler {
        async fn handle(
            &self,
            _peer: &PeerContext,
            _payload: Bytes,
        ) -> Result<Option<(MessageType, Bytes)>, ShoalError> {
            Err(ShoalError::Handler("boom".into()))
        }
    }

    fn ctx() -> PeerContext {
        PeerContext {
            node_id: NodeId([1; 32]),
            node_type: NodeType::FullNode,
            peer_addr: "127.0.0.1:8444".into(),
            mutual_capabilities: vec![Capability::Base],
        }
    }

    #[tokio::test]
    async fn echo_handler_returns_payload_unchanged() {
        let h = EchoHandler;
        let reply = h.handle(&ctx(), Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(reply, Some((MessageType::RespondBlock, Bytes::from_static(b"hi"))));
    }

    #[tokio::test]
    async fn failing_handler_error_does_not_panic_caller() {
        let h = FailingHandler;
        assert!(h.handle(&ctx(), Bytes::new()).await.is_err());
    }

    #[test]
    fn message_handler_is_object_safe() {
        let h: Box<dyn MessageHandler> = Box::new(EchoHandler);
        _assert_message_handler_object_safe(h.as_ref());
    }
}
