//! Per-connection state machine: one reader task, one writer task, and a
//! bounded command channel between them and the public [`Connection`] handle.
//!
//! Replaces a per-peer coroutine loop with two tasks talking over channels,
//! the same shape the teacher uses for its swarm event loop, scaled down to
//! one connection instead of the whole network.

use crate::ban::{BanList, BanReason};
use crate::close::{CloseCode, ProtocolSubReason};
use crate::codec;
use crate::config::NetworkConfig;
use crate::dispatcher::{check_reply_is_valid, message_requires_reply, HandlerTable};
use crate::rate_limiter::RateLimiter;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use shoal_core::constants::{DEFAULT_PROTOCOL_HANDSHAKE_TIMEOUT_SECS, WRITER_QUEUE_CAPACITY};
use shoal_core::error::{ConnectionError, ProtocolError, ShoalError};
use shoal_core::message::{Capability, Handshake, Message, MessageType, NodeId, NodeType};
use shoal_core::traits::PeerContext;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    DialedOrAccepted,
    TlsHandshake,
    ProtocolHandshake,
    Established,
    Closing,
    Closed,
}

fn handshake_payload(h: &Handshake) -> Result<Bytes, ProtocolError> {
    bincode::serde::encode_to_vec(h, bincode::config::standard())
        .map(Bytes::from)
        .map_err(|e| ProtocolError::Decode(e.to_string()))
}

fn decode_handshake(payload: &[u8]) -> Result<Handshake, ProtocolError> {
    bincode::serde::decode_from_slice(payload, bincode::config::standard())
        .map(|(h, _)| h)
        .map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Tracks in-flight `request()` calls by correlation id, along with the type
/// that was sent so a reply can be checked against the state machine.
struct PendingReplies {
    next_id: u16,
    waiting: HashMap<u16, (MessageType, oneshot::Sender<Message>)>,
}

impl PendingReplies {
    fn new() -> Self {
        Self { next_id: 0, waiting: HashMap::new() }
    }

    fn insert(&mut self, sent_type: MessageType, tx: oneshot::Sender<Message>) -> Option<u16> {
        if self.waiting.len() >= u16::MAX as usize {
            return None;
        }
        let start = self.next_id;
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.waiting.contains_key(&id) {
                self.waiting.insert(id, (sent_type, tx));
                return Some(id);
            }
            if self.next_id == start {
                return None;
            }
        }
    }

    fn take(&mut self, id: u16) -> Option<(MessageType, oneshot::Sender<Message>)> {
        self.waiting.remove(&id)
    }

    fn remove(&mut self, id: u16) {
        self.waiting.remove(&id);
    }
}

enum WriterCmd {
    Send(Bytes),
    Close { code: CloseCode, reason: String },
}

struct ConnectionInner {
    peer_addr: String,
    direction: Direction,
    node_id: NodeId,
    node_type: NodeType,
    mutual_capabilities: Vec<Capability>,
    state: RwLock<ConnectionState>,
    created_at: Instant,
    last_message_at: Mutex<Instant>,
    pending: Mutex<PendingReplies>,
    writer_tx: mpsc::Sender<WriterCmd>,
    outbound_limiter: Mutex<RateLimiter>,
}

/// A cheaply-cloneable handle to an established connection. All state lives
/// behind the shared `Arc`; cloning shares the same underlying tasks.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn peer_addr(&self) -> &str {
        &self.inner.peer_addr
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    pub fn node_type(&self) -> NodeType {
        self.inner.node_type
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn age(&self) -> Duration {
        self.inner.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.last_message_at.lock().elapsed()
    }

    /// Enqueue a fire-and-forget message. Rejected by the outbound rate
    /// limiter counts as a drop, not an error the caller must retry.
    pub fn send(&self, msg_type: MessageType, payload: Bytes) -> Result<(), ConnectionError> {
        if self.state() != ConnectionState::Established {
            return Err(ConnectionError::Closed);
        }
        if !self.inner.outbound_limiter.lock().check_and_account(msg_type, payload.len()) {
            return Err(ConnectionError::Rejected);
        }
        let frame = codec::encode(&Message::new(msg_type, None, payload)).freeze();
        self.inner.writer_tx.try_send(WriterCmd::Send(frame)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::Rejected,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    /// Send `msg_type` and await a correlated reply within `timeout_dur`.
    /// `msg_type` must have an entry in the reply state machine.
    pub async fn request(
        &self,
        msg_type: MessageType,
        payload: Bytes,
        timeout_dur: Duration,
    ) -> Result<Message, ConnectionError> {
        if !message_requires_reply(msg_type) {
            return Err(ConnectionError::NoReplyExpected);
        }
        if self.state() != ConnectionState::Established {
            return Err(ConnectionError::Closed);
        }
        if !self.inner.outbound_limiter.lock().check_and_account(msg_type, payload.len()) {
            return Err(ConnectionError::Rejected);
        }

        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.inner.pending.lock();
            pending.insert(msg_type, tx).ok_or(ConnectionError::Rejected)?
        };

        let frame = codec::encode(&Message::new(msg_type, Some(id), payload)).freeze();
        if let Err(e) = self.inner.writer_tx.try_send(WriterCmd::Send(frame)) {
            self.inner.pending.lock().remove(id);
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => ConnectionError::Rejected,
                mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
            });
        }

        match timeout(timeout_dur, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ConnectionError::Cancelled),
            Err(_) => {
                self.inner.pending.lock().remove(id);
                Err(ConnectionError::Timeout)
            }
        }
    }

    /// Idempotent: a second call on an already-closing connection is a no-op.
    pub fn close(&self, code: CloseCode, reason: impl Into<String>) {
        let mut state = self.inner.state.write();
        if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        *state = ConnectionState::Closing;
        drop(state);
        let _ = self.inner.writer_tx.try_send(WriterCmd::Close { code, reason: reason.into() });
    }
}

/// Maps a decode/handshake-level protocol violation to the close code its
/// category is reported under, so every rejection path uses the same table
/// instead of collapsing everything into a generic decode error.
fn close_code_for_protocol_error(e: &ProtocolError) -> CloseCode {
    match e {
        ProtocolError::MessageTooBig { .. } => CloseCode::MessageTooBig,
        ProtocolError::UnknownType(_) => CloseCode::ProtocolError(ProtocolSubReason::UnknownMessageType),
        ProtocolError::InvalidReplyType { .. } => CloseCode::ProtocolError(ProtocolSubReason::InvalidReplyType),
        ProtocolError::InvalidHandshake
        | ProtocolError::NetworkIdMismatch { .. }
        | ProtocolError::UnknownNodeType(_)
        | ProtocolError::HandshakeTimeout => CloseCode::ProtocolError(ProtocolSubReason::InvalidHandshake),
        ProtocolError::Truncated { .. } | ProtocolError::Decode(_) => {
            CloseCode::ProtocolError(ProtocolSubReason::DecodeError)
        }
    }
}

fn to_ws_close(code: CloseCode, reason: String) -> CloseFrame<'static> {
    let ws_code = match code {
        CloseCode::Normal => WsCloseCode::Normal,
        CloseCode::Abnormal => WsCloseCode::Abnormal,
        CloseCode::MessageTooBig => WsCloseCode::Size,
        CloseCode::ProtocolError(_) => WsCloseCode::Protocol,
        CloseCode::PolicyViolation => WsCloseCode::Policy,
        CloseCode::DuplicateConnection => WsCloseCode::Policy,
    };
    CloseFrame { code: ws_code, reason: format!("{code}: {reason}").into() }
}

async fn writer_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut rx: mpsc::Receiver<WriterCmd>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCmd::Send(frame) => {
                if sink.send(WsMessage::Binary(frame.to_vec())).await.is_err() {
                    break;
                }
            }
            WriterCmd::Close { code, reason } => {
                let _ = sink.send(WsMessage::Close(Some(to_ws_close(code, reason)))).await;
                let _ = sink.close().await;
                break;
            }
        }
    }
}

/// Drives the inbound side: decode, rate-limit, correlate replies, dispatch
/// to a handler, and ban + close on any protocol-level violation.
#[allow(clippy::too_many_arguments)]
async fn reader_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    inner: Arc<ConnectionInner>,
    mut inbound_limiter: RateLimiter,
    handlers: HandlerTable,
    bans: Arc<std::sync::Mutex<BanList>>,
    ban_duration_protocol: Duration,
    ban_duration_rate_limit: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer_host = inner.peer_addr.split(':').next().unwrap_or(&inner.peer_addr).to_string();
    let peer_ctx = PeerContext {
        node_id: inner.node_id,
        node_type: inner.node_type,
        peer_addr: inner.peer_addr.clone(),
        mutual_capabilities: inner.mutual_capabilities.clone(),
    };

    while let Some(next) = stream.next().await {
        let ws_msg = match next {
            Ok(m) => m,
            Err(_) => break,
        };
        let raw = match ws_msg {
            WsMessage::Binary(b) => b,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        *inner.last_message_at.lock() = Instant::now();

        let decoded = codec::decode(bytes::Bytes::from(raw));
        let msg = match decoded {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %inner.peer_addr, error = %e, "connection: decode error, banning host");
                bans.lock().unwrap().ban(&peer_host, ban_duration_protocol, BanReason::InvalidProtocol);
                inner.close_internal(close_code_for_protocol_error(&e));
                break;
            }
        };

        if !inbound_limiter.check_and_account(msg.msg_type, msg.payload.len()) {
            warn!(peer = %inner.peer_addr, ?msg.msg_type, "connection: inbound rate limit exceeded, banning host");
            bans.lock().unwrap().ban(&peer_host, ban_duration_rate_limit, BanReason::RateLimitExceeded);
            inner.close_internal(CloseCode::ProtocolError(ProtocolSubReason::RateLimitExceeded));
            break;
        }

        if let Some(id) = msg.id {
            if let Some((sent_type, tx)) = inner.pending.lock().take(id) {
                if check_reply_is_valid(sent_type, msg.msg_type).is_err() {
                    warn!(peer = %inner.peer_addr, "connection: invalid reply type, banning host");
                    bans.lock().unwrap().ban(&peer_host, ban_duration_protocol, BanReason::InvalidProtocol);
                    inner.close_internal(CloseCode::ProtocolError(ProtocolSubReason::InvalidReplyType));
                    break;
                }
                let _ = tx.send(msg);
                continue;
            }
        }

        let Some(handler) = handlers.lookup(inner.node_type, msg.msg_type) else {
            debug!(peer = %inner.peer_addr, ?msg.msg_type, "connection: no handler registered, ignoring");
            continue;
        };

        // Awaited inline, not spawned: ordering within a connection is
        // preserved by reading the next frame only after this handler
        // finishes, which also gives back-pressure against a slow handler.
        // Other connections are unaffected since each has its own reader task.
        let request_id = msg.id;
        match handler.handle(&peer_ctx, msg.payload).await {
            Ok(Some((reply_type, reply_payload))) => {
                if let Some(id) = request_id {
                    let frame = codec::encode(&Message::new(reply_type, Some(id), reply_payload)).freeze();
                    let _ = inner.writer_tx.send(WriterCmd::Send(frame)).await;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(%e, "connection: handler returned an error, message absorbed"),
        }
    }

    let mut state = inner.state.write();
    if !matches!(*state, ConnectionState::Closed) {
        *state = ConnectionState::Closed;
    }
    drop(state);
    info!(peer = %inner.peer_addr, "connection: reader loop exited");
}

impl ConnectionInner {
    fn close_internal(&self, code: CloseCode) {
        let mut state = self.state.write();
        if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        *state = ConnectionState::Closing;
        drop(state);
        let _ = self.writer_tx.try_send(WriterCmd::Close { code, reason: String::new() });
    }
}

/// Bans the peer's host and sends a close frame for a handshake that failed
/// validation. Best-effort: the peer may already be gone, so write errors
/// are swallowed — the ban is what matters.
async fn fail_handshake<S>(
    sink: &mut SplitSink<WebSocketStream<S>, WsMessage>,
    bans: &Arc<std::sync::Mutex<BanList>>,
    peer_host: &str,
    ban_duration: Duration,
    code: CloseCode,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    bans.lock().unwrap().ban(peer_host, ban_duration, BanReason::InvalidProtocol);
    let _ = sink.send(WsMessage::Close(Some(to_ws_close(code, "handshake rejected".to_string())))).await;
    let _ = sink.close().await;
}

/// Exchanges the mandatory first-message handshake over an already-upgraded
/// WebSocket stream, then spawns the reader and writer tasks.
///
/// `peer_node_id` is derived from the peer's TLS certificate by the caller
/// (see `tls.rs`) — identity on this network is cert-based, not a value the
/// in-band handshake message is trusted to assert. A handshake that fails
/// validation (not a handshake, wrong network, unknown node type, a frame
/// that doesn't decode, or a timeout) bans the peer's host and sends a close
/// frame, exactly like a post-handshake protocol violation does in
/// `reader_loop` — the first message gets no special exemption.
#[allow(clippy::too_many_arguments)]
pub async fn establish<S>(
    ws: WebSocketStream<S>,
    peer_addr: String,
    peer_node_id: NodeId,
    direction: Direction,
    local_handshake: Handshake,
    config: &NetworkConfig,
    handlers: HandlerTable,
    bans: Arc<std::sync::Mutex<BanList>>,
) -> Result<Connection, ShoalError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let handshake_timeout = Duration::from_secs(DEFAULT_PROTOCOL_HANDSHAKE_TIMEOUT_SECS);
    let peer_host = peer_addr.split(':').next().unwrap_or(&peer_addr).to_string();

    let local_payload = handshake_payload(&local_handshake)?;
    let local_frame = codec::encode(&Message::new(MessageType::Handshake, None, local_payload)).freeze();
    sink.send(WsMessage::Binary(local_frame.to_vec()))
        .await
        .map_err(|e| shoal_core::error::TransportError::Write(e.to_string()))?;

    let handshake_result: Result<(Handshake, NodeType), ShoalError> = timeout(handshake_timeout, async {
        let next = stream.next().await.ok_or(shoal_core::error::TransportError::Closed)?;
        let ws_msg = next.map_err(|e| shoal_core::error::TransportError::Read(e.to_string()))?;
        let raw = match ws_msg {
            WsMessage::Binary(b) => b,
            _ => return Err(ShoalError::from(ProtocolError::InvalidHandshake)),
        };
        let msg = codec::decode(bytes::Bytes::from(raw))?;
        if msg.msg_type != MessageType::Handshake {
            return Err(ShoalError::from(ProtocolError::InvalidHandshake));
        }
        let peer_handshake = decode_handshake(&msg.payload)?;
        if peer_handshake.network_id != config.network_id {
            return Err(ShoalError::from(ProtocolError::NetworkIdMismatch {
                expected: config.network_id.clone(),
                got: peer_handshake.network_id,
            }));
        }
        let peer_node_type = NodeType::from_u8(peer_handshake.node_type)
            .ok_or(ProtocolError::UnknownNodeType(peer_handshake.node_type))?;
        Ok((peer_handshake, peer_node_type))
    })
    .await
    .unwrap_or_else(|_| Err(ProtocolError::HandshakeTimeout.into()));

    let (peer_handshake, peer_node_type) = match handshake_result {
        Ok(v) => v,
        Err(err) => {
            if let ShoalError::Protocol(ref proto_err) = err {
                warn!(peer = %peer_addr, error = %proto_err, "connection: handshake rejected, banning host");
                fail_handshake(
                    &mut sink,
                    &bans,
                    &peer_host,
                    config.invalid_protocol_ban,
                    close_code_for_protocol_error(proto_err),
                )
                .await;
            }
            return Err(err);
        }
    };

    let mutual_capabilities = local_handshake.mutual_capabilities(&peer_handshake);
    let local_caps: Vec<Capability> =
        local_handshake.capabilities.iter().filter_map(|(id, _)| Capability::from_u16(*id)).collect();
    let peer_caps: Vec<Capability> =
        peer_handshake.capabilities.iter().filter_map(|(id, _)| Capability::from_u16(*id)).collect();
    let tables = crate::rate_limiter::select_rate_limits(&local_caps, &peer_caps);

    let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE_CAPACITY);
    let outbound_limiter = RateLimiter::with_percentage(tables.clone(), false, 95);
    let inbound_limiter = RateLimiter::new(tables, true);

    let inner = Arc::new(ConnectionInner {
        peer_addr,
        direction,
        node_id: peer_node_id,
        node_type: peer_node_type,
        mutual_capabilities,
        state: RwLock::new(ConnectionState::Established),
        created_at: Instant::now(),
        last_message_at: Mutex::new(Instant::now()),
        pending: Mutex::new(PendingReplies::new()),
        writer_tx,
        outbound_limiter: Mutex::new(outbound_limiter),
    });

    tokio::spawn(writer_loop(sink, writer_rx));
    tokio::spawn(reader_loop(
        stream,
        inner.clone(),
        inbound_limiter,
        handlers,
        bans,
        config.invalid_protocol_ban,
        config.rate_limit_ban,
    ));

    Ok(Connection { inner })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_handshake(caps: &[Capability]) -> Handshake {
        Handshake {
            network_id: "testnet".into(),
            protocol_version: "0.0.1".into(),
            software_version: "0.0.1".into(),
            server_port: 18444,
            node_type: NodeType::FullNode as u8,
            capabilities: caps.iter().map(|c| (*c as u16, String::new())).collect(),
        }
    }

    #[test]
    fn handshake_payload_round_trips() {
        let hs = test_handshake(&[Capability::Base, Capability::RateLimitsV2]);
        let bytes = handshake_payload(&hs).unwrap();
        let decoded = decode_handshake(&bytes).unwrap();
        assert_eq!(decoded, hs);
    }

    #[test]
    fn pending_replies_assigns_unique_ids_and_skips_in_use_ones() {
        let mut pending = PendingReplies::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let id1 = pending.insert(MessageType::RequestBlock, tx1).unwrap();
        let id2 = pending.insert(MessageType::RequestBlock, tx2).unwrap();
        assert_ne!(id1, id2);
    }

    #[test]
    fn taking_an_unknown_id_returns_none() {
        let mut pending = PendingReplies::new();
        assert!(pending.take(42).is_none());
    }

    #[test]
    fn take_removes_the_entry_so_a_second_take_misses() {
        let mut pending = PendingReplies::new();
        let (tx, _rx) = oneshot::channel();
        let id = pending.insert(MessageType::RequestBlock, tx).unwrap();
        assert!(pending.take(id).is_some());
        assert!(pending.take(id).is_none());
    }

    #[test]
    fn oversize_frame_maps_to_message_too_big() {
        let err = ProtocolError::MessageTooBig { size: 1, max: 1 };
        assert_eq!(close_code_for_protocol_error(&err), CloseCode::MessageTooBig);
    }

    #[test]
    fn unknown_type_maps_to_its_own_sub_reason() {
        let err = ProtocolError::UnknownType(200);
        assert_eq!(
            close_code_for_protocol_error(&err),
            CloseCode::ProtocolError(ProtocolSubReason::UnknownMessageType)
        );
    }

    #[test]
    fn handshake_failures_map_to_invalid_handshake() {
        assert_eq!(
            close_code_for_protocol_error(&ProtocolError::InvalidHandshake),
            CloseCode::ProtocolError(ProtocolSubReason::InvalidHandshake)
        );
        assert_eq!(
            close_code_for_protocol_error(&ProtocolError::HandshakeTimeout),
            CloseCode::ProtocolError(ProtocolSubReason::InvalidHandshake)
        );
    }

    fn test_connection(writer_tx: mpsc::Sender<WriterCmd>) -> Connection {
        let inner = Arc::new(ConnectionInner {
            peer_addr: "127.0.0.1:1".into(),
            direction: Direction::Inbound,
            node_id: NodeId([0u8; 32]),
            node_type: NodeType::FullNode,
            mutual_capabilities: vec![],
            state: RwLock::new(ConnectionState::Established),
            created_at: Instant::now(),
            last_message_at: Mutex::new(Instant::now()),
            pending: Mutex::new(PendingReplies::new()),
            writer_tx,
            outbound_limiter: Mutex::new(RateLimiter::new(crate::rate_limiter::RateLimitTables::v1(), false)),
        });
        Connection { inner }
    }

    #[tokio::test]
    async fn send_on_a_saturated_writer_queue_is_rejected_not_closed() {
        let (writer_tx, _writer_rx) = mpsc::channel(1);
        let conn = test_connection(writer_tx);

        // Fill the bounded channel so the connection's own send hits `Full`.
        conn.inner.writer_tx.try_send(WriterCmd::Send(Bytes::new())).unwrap();
        assert_eq!(conn.send(MessageType::NewPeak, Bytes::new()), Err(ConnectionError::Rejected));
    }

    #[tokio::test]
    async fn send_after_the_writer_is_gone_is_closed_not_rejected() {
        let (writer_tx, writer_rx) = mpsc::channel(1);
        let conn = test_connection(writer_tx);

        drop(writer_rx);
        assert_eq!(conn.send(MessageType::NewPeak, Bytes::new()), Err(ConnectionError::Closed));
    }
}
