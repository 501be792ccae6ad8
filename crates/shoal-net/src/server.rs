//! Listener, admission control, and the live connection table.
//!
//! The accept loop is pausable: once the connection count reaches
//! `connection_limit + CONNECTION_LIMIT_TOLERANCE` it stops calling
//! `accept()` until the count drops back to `connection_limit -
//! ADMISSION_RESUME_HYSTERESIS`, so a burst of races during the tolerance
//! window doesn't cause pause/resume chatter right at the limit.

use crate::ban::BanList;
use crate::connection::{self, Connection, Direction};
use crate::close::CloseCode;
use crate::config::NetworkConfig;
use crate::dispatcher::HandlerTable;
use crate::tls::TlsMaterial;
use dashmap::DashMap;
use rustls_pki_types::ServerName;
use shoal_core::constants::{ADMISSION_RESUME_HYSTERESIS, CONNECTION_LIMIT_TOLERANCE, PROTOCOL_VERSION};
use shoal_core::error::{ShoalError, TransportError};
use shoal_core::message::{Capability, Handshake, NodeId, NodeType};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// The server's own node identity and role, used to populate the handshake
/// this node sends on every connection.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub node_type: NodeType,
    pub capabilities: Vec<Capability>,
}

pub struct Server {
    config: NetworkConfig,
    identity: LocalIdentity,
    handlers: HandlerTable,
    bans: Arc<std::sync::Mutex<BanList>>,
    connections: Arc<DashMap<NodeId, Connection>>,
    /// Raw TCP sockets accepted but not yet past the TLS + protocol
    /// handshake. Counted toward admission control alongside `connections`
    /// so a flood of half-open connections can't bypass `connection_limit`
    /// by stalling before the handshake completes.
    in_flight: Arc<AtomicUsize>,
    tls: Arc<TlsMaterial>,
    paused: AtomicBool,
}

impl Server {
    pub fn new(
        config: NetworkConfig,
        identity: LocalIdentity,
        handlers: HandlerTable,
        tls: TlsMaterial,
    ) -> Self {
        let bans = Arc::new(std::sync::Mutex::new(BanList::new(config.testing_mode)));
        Self {
            config,
            identity,
            handlers,
            bans,
            connections: Arc::new(DashMap::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            tls: Arc::new(tls),
            paused: AtomicBool::new(false),
        }
    }

    pub fn connections(&self) -> Arc<DashMap<NodeId, Connection>> {
        self.connections.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn local_handshake(&self) -> Handshake {
        Handshake {
            network_id: self.config.network_id.clone(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            software_version: PROTOCOL_VERSION.to_string(),
            server_port: self.config.listen_port,
            node_type: self.identity.node_type as u8,
            capabilities: self.identity.capabilities.iter().map(|c| (*c as u16, String::new())).collect(),
        }
    }

    /// `true` once the accept loop should stop calling `accept()`, and
    /// `false` once it should resume — with hysteresis so the two thresholds
    /// differ depending on which side we're currently on. Counts both
    /// established connections and sockets still mid-handshake, since a
    /// connection attached at raw accept but stalled in TLS/protocol
    /// handshake still occupies a slot an attacker could hold indefinitely.
    fn should_pause(&self) -> bool {
        let attached = self.connections.len() + self.in_flight.load(Ordering::SeqCst);
        compute_should_pause(attached, self.config.connection_limit, self.paused.load(Ordering::SeqCst))
    }

    /// Inserts a freshly established connection, rejecting it if a
    /// connection to the same node id is already live.
    fn admit(&self, conn: Connection) -> bool {
        if self.connections.contains_key(&conn.node_id()) {
            conn.close(CloseCode::DuplicateConnection, "already connected");
            return false;
        }
        self.connections.insert(conn.node_id(), conn);
        true
    }

    async fn accept_one(self: Arc<Self>, socket: TcpStream, peer_addr: String) -> Result<(), ShoalError> {
        let tls_stream = timeout(self.config.ssl_handshake_timeout, self.tls.acceptor.accept(socket))
            .await
            .map_err(|_| TransportError::TlsHandshakeTimeout)?
            .map_err(|e| TransportError::TlsHandshake(e.to_string()))?;

        let peer_cert = tls_stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first().cloned())
            .ok_or_else(|| TransportError::TlsHandshake("no client certificate presented".into()))?;
        let peer_node_id = crate::tls::node_id_from_cert(&peer_cert);

        let ws = tokio_tungstenite::accept_async(tls_stream)
            .await
            .map_err(|e| TransportError::Read(e.to_string()))?;

        let conn = connection::establish(
            ws,
            peer_addr.clone(),
            peer_node_id,
            Direction::Inbound,
            self.local_handshake(),
            &self.config,
            self.handlers.clone(),
            self.bans.clone(),
        )
        .await?;

        if self.admit(conn) {
            info!(peer = %peer_addr, node_id = %peer_node_id, "server: inbound connection established");
        }
        Ok(())
    }

    /// Runs until the listener errors. Call inside its own task; cancel by
    /// dropping that task's `JoinHandle`.
    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let pause_now = self.should_pause();
            self.paused.store(pause_now, Ordering::SeqCst);
            if pause_now {
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }

            let (socket, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "server: accept() failed");
                    continue;
                }
            };

            let host = peer_addr.ip().to_string();
            if let Some(reason) = self.bans.lock().unwrap().check(&host) {
                debug!(%host, ?reason, "server: rejecting connection from banned host");
                continue;
            }

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let server = self.clone();
            let addr_str = peer_addr.to_string();
            tokio::spawn(async move {
                let result = server.accept_one(socket, addr_str.clone()).await;
                server.in_flight.fetch_sub(1, Ordering::SeqCst);
                if let Err(e) = result {
                    warn!(error = %e, peer = %addr_str, "server: failed to establish inbound connection");
                }
            });
        }
    }

    /// Dials an outbound peer at `addr` (`host:port`) and establishes a
    /// connection exactly as the accept path does, modulo direction.
    pub async fn start_client(self: Arc<Self>, addr: &str, host_for_tls: &str) -> Result<Connection, ShoalError> {
        let socket = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Read(e.to_string()))?;

        let server_name = ServerName::try_from(host_for_tls.to_string())
            .map_err(|e| TransportError::TlsHandshake(e.to_string()))?;
        let tls_stream = timeout(self.config.ssl_handshake_timeout, self.tls.connector.connect(server_name, socket))
            .await
            .map_err(|_| TransportError::TlsHandshakeTimeout)?
            .map_err(|e| TransportError::TlsHandshake(e.to_string()))?;

        let peer_cert = tls_stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first().cloned())
            .ok_or_else(|| TransportError::TlsHandshake("no server certificate presented".into()))?;
        let peer_node_id = crate::tls::node_id_from_cert(&peer_cert);

        let url = format!("wss://{addr}/");
        let (ws, _response) = tokio_tungstenite::client_async(url, tls_stream)
            .await
            .map_err(|e| TransportError::Read(e.to_string()))?;

        let conn = connection::establish(
            ws,
            addr.to_string(),
            peer_node_id,
            Direction::Outbound,
            self.local_handshake(),
            &self.config,
            self.handlers.clone(),
            self.bans.clone(),
        )
        .await?;

        if self.admit(conn.clone()) {
            info!(peer = %addr, node_id = %peer_node_id, "server: outbound connection established");
        }
        Ok(conn)
    }
}

/// `true` once the accept loop should stop calling `accept()`, `false` once
/// it should resume. Pure function of the live count, the configured limit,
/// and whether the loop is already paused, so it's testable without a live
/// listener or connection table.
fn compute_should_pause(count: usize, limit: usize, currently_paused: bool) -> bool {
    if currently_paused {
        count > limit.saturating_sub(ADMISSION_RESUME_HYSTERESIS)
    } else {
        count >= limit + CONNECTION_LIMIT_TOLERANCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn does_not_pause_below_tolerance() {
        assert!(!compute_should_pause(10, 10, false));
    }

    #[test]
    fn pauses_once_limit_plus_tolerance_is_reached() {
        assert!(compute_should_pause(10 + CONNECTION_LIMIT_TOLERANCE, 10, false));
    }

    #[test]
    fn stays_paused_until_hysteresis_margin_is_crossed() {
        // Already paused at limit 100: dropping to limit - 1 is not enough,
        // it must fall to limit - ADMISSION_RESUME_HYSTERESIS or below.
        assert!(compute_should_pause(100 - 1, 100, true));
        assert!(!compute_should_pause(100 - ADMISSION_RESUME_HYSTERESIS, 100, true));
    }

    #[test]
    fn not_yet_paused_state_uses_the_tolerance_threshold_not_hysteresis() {
        // One below the tolerance threshold: still accepting.
        assert!(!compute_should_pause(10 + CONNECTION_LIMIT_TOLERANCE - 1, 10, false));
    }
}
