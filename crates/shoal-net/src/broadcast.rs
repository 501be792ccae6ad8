//! Best-effort fan-out to all established connections of a given node type.

use crate::connection::{Connection, ConnectionState};
use shoal_core::message::{MessageType, NodeId, NodeType};
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Holds the live connection table the server maintains; broadcast only
/// reads from it, it never owns connection lifecycle.
#[derive(Clone, Default)]
pub struct BroadcastRouter {
    connections: Arc<DashMap<NodeId, Connection>>,
}

impl BroadcastRouter {
    pub fn new(connections: Arc<DashMap<NodeId, Connection>>) -> Self {
        Self { connections }
    }

    /// Sends `msg_type`/`payload` to every established connection of
    /// `node_type`, skipping ids in `exclude`. A connection whose outbound
    /// rate limiter rejects the message, or whose writer queue is full, is
    /// dropped for this broadcast rather than blocking the others.
    pub fn broadcast(
        &self,
        node_type: NodeType,
        msg_type: MessageType,
        payload: Bytes,
        exclude: &HashSet<NodeId>,
    ) -> HashSet<NodeId> {
        let mut sent_to = HashSet::new();
        for entry in self.connections.iter() {
            let node_id = *entry.key();
            let conn = entry.value();
            if exclude.contains(&node_id) {
                continue;
            }
            if conn.node_type() != node_type || conn.state() != ConnectionState::Established {
                continue;
            }
            match conn.send(msg_type, payload.clone()) {
                Ok(()) => {
                    sent_to.insert(node_id);
                }
                Err(e) => {
                    debug!(%node_id, error = %e, "broadcast: dropped for one peer");
                }
            }
        }
        sent_to
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_router_broadcasts_to_nobody() {
        let router = BroadcastRouter::default();
        let sent = router.broadcast(
            NodeType::FullNode,
            MessageType::NewPeak,
            Bytes::new(),
            &HashSet::new(),
        );
        assert!(sent.is_empty());
    }
}
