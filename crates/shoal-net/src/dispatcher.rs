//! Message routing: reply correlation against the protocol state machine,
//! and handler lookup by `(NodeType, MessageType)`.

use shoal_core::error::{ConfigError, ProtocolError};
use shoal_core::message::{MessageType, NodeType};
use shoal_core::traits::MessageHandler;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Message types that are fire-and-forget: sending one must not allocate a
/// pending-reply slot.
pub fn no_reply_expected() -> HashSet<MessageType> {
    use MessageType::*;
    HashSet::from([
        NewPeak,
        NewTransaction,
        NewUnfinishedBlock,
        NewSignagePointOrEndOfSubSlot,
        RequestMempoolTransactions,
        NewCompactVdf,
    ])
}

/// Maps a sent request type to the set of reply types a requester should
/// accept. Built once at startup; see [`validate_reply_tables`].
pub fn valid_reply_map() -> HashMap<MessageType, HashSet<MessageType>> {
    use MessageType::*;
    HashMap::from([
        (RequestTransaction, HashSet::from([RespondTransaction])),
        (RequestProofOfWeight, HashSet::from([RespondProofOfWeight])),
        (RequestBlock, HashSet::from([RespondBlock, RejectBlock])),
        (RequestBlocks, HashSet::from([RespondBlocks, RejectBlocks])),
        (RequestUnfinishedBlock, HashSet::from([RespondUnfinishedBlock])),
        (RequestBlockHeader, HashSet::from([RespondBlockHeader, RejectHeaderRequest])),
        (
            RequestSignagePointOrEndOfSubSlot,
            HashSet::from([RespondSignagePoint, RespondEndOfSubSlot]),
        ),
        (RequestCompactVdf, HashSet::from([RespondCompactVdf])),
        (RequestPeers, HashSet::from([RespondPeers])),
        (RequestHeaderBlocks, HashSet::from([RespondHeaderBlocks, RejectHeaderBlocks])),
    ])
}

/// Startup-time self-check: the reply and non-reply sets must not overlap.
/// A message type cannot simultaneously expect a reply and be fire-and-forget.
pub fn validate_reply_tables() -> Result<(), ConfigError> {
    let replies = valid_reply_map();
    let no_reply = no_reply_expected();
    for sent in replies.keys() {
        if no_reply.contains(sent) {
            return Err(ConfigError::ReplyTableOverlap(sent.as_u8()));
        }
    }
    Ok(())
}

pub fn message_requires_reply(sent: MessageType) -> bool {
    valid_reply_map().contains_key(&sent)
}

/// Returns `Ok(())` if `received` is a permitted reply to `sent`, else a
/// [`ProtocolError::InvalidReplyType`]. A `sent` type with no entry in the
/// map accepts any reply type (it wasn't tracked as a correlated request).
pub fn check_reply_is_valid(sent: MessageType, received: MessageType) -> Result<(), ProtocolError> {
    let map = valid_reply_map();
    if let Some(allowed) = map.get(&sent) {
        if !allowed.contains(&received) {
            return Err(ProtocolError::InvalidReplyType {
                sent: format!("{sent:?}"),
                received: format!("{received:?}"),
            });
        }
    }
    Ok(())
}

/// One handler function per `(NodeType, MessageType)`, populated at startup.
/// Duplicate registration for the same key is rejected rather than silently
/// overwriting the earlier handler.
#[derive(Default)]
pub struct HandlerTableBuilder {
    handlers: HashMap<(NodeType, MessageType), Arc<dyn MessageHandler>>,
}

impl HandlerTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        node_type: NodeType,
        msg_type: MessageType,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), ConfigError> {
        if self.handlers.contains_key(&(node_type, msg_type)) {
            return Err(ConfigError::DuplicateHandler {
                node_type: format!("{node_type:?}"),
                msg_type: msg_type.as_u8(),
            });
        }
        self.handlers.insert((node_type, msg_type), handler);
        Ok(())
    }

    pub fn build(self) -> HandlerTable {
        HandlerTable { handlers: self.handlers }
    }
}

#[derive(Default, Clone)]
pub struct HandlerTable {
    handlers: HashMap<(NodeType, MessageType), Arc<dyn MessageHandler>>,
}

impl HandlerTable {
    /// Looks up the handler for `(node_type, msg_type)`. Absence is not an
    /// error — the caller should log and ignore, preserving forward
    /// compatibility with peers that send message types we don't implement.
    pub fn lookup(&self, node_type: NodeType, msg_type: MessageType) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(&(node_type, msg_type)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use shoal_core::error::ShoalError;
    use shoal_core::traits::PeerContext;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl MessageHandler for Noop {
        async fn handle(
            &self,
            _peer: &PeerContext,
            _payload: Bytes,
        ) -> Result<Option<(MessageType, Bytes)>, ShoalError> {
            Ok(None)
        }
    }

    #[test]
    fn reply_tables_do_not_overlap() {
        assert!(validate_reply_tables().is_ok());
    }

    #[test]
    fn request_block_accepts_respond_or_reject() {
        assert!(check_reply_is_valid(MessageType::RequestBlock, MessageType::RespondBlock).is_ok());
        assert!(check_reply_is_valid(MessageType::RequestBlock, MessageType::RejectBlock).is_ok());
        assert!(check_reply_is_valid(MessageType::RequestBlock, MessageType::NewPeak).is_err());
    }

    #[test]
    fn fire_and_forget_types_do_not_require_a_reply() {
        assert!(!message_requires_reply(MessageType::NewTransaction));
        assert!(message_requires_reply(MessageType::RequestBlock));
    }

    #[test]
    fn unmapped_sent_type_accepts_any_reply() {
        assert!(check_reply_is_valid(MessageType::Handshake, MessageType::NewPeak).is_ok());
    }

    #[test]
    fn duplicate_registration_for_same_key_is_rejected() {
        let mut builder = HandlerTableBuilder::new();
        builder
            .register(NodeType::FullNode, MessageType::RequestBlock, Arc::new(Noop))
            .unwrap();
        let err = builder
            .register(NodeType::FullNode, MessageType::RequestBlock, Arc::new(Noop))
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateHandler { .. }));
    }

    #[test]
    fn same_message_type_different_node_type_is_allowed() {
        let mut builder = HandlerTableBuilder::new();
        builder
            .register(NodeType::FullNode, MessageType::RequestBlock, Arc::new(Noop))
            .unwrap();
        assert!(builder
            .register(NodeType::Wallet, MessageType::RequestBlock, Arc::new(Noop))
            .is_ok());
    }

    #[test]
    fn lookup_returns_none_for_unregistered_pair() {
        let table = HandlerTableBuilder::new().build();
        assert!(table.lookup(NodeType::FullNode, MessageType::RequestBlock).is_none());
    }
}
