//! Process-wide configuration for the peer-to-peer server core.

use shoal_core::constants::{
    DEFAULT_CONNECTION_LIMIT, DEFAULT_INVALID_PROTOCOL_BAN_SECS, DEFAULT_P2P_PORT,
    DEFAULT_RATE_LIMIT_BAN_SECS, DEFAULT_SSL_HANDSHAKE_TIMEOUT_SECS,
};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the P2P server core.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// IP address to listen on.
    pub listen_addr: String,
    /// TCP port to listen on.
    pub listen_port: u16,
    /// Max concurrent connections before the accept loop pauses.
    pub connection_limit: usize,
    /// Ban duration for handshake/protocol violations.
    pub invalid_protocol_ban: Duration,
    /// Ban duration for inbound rate-limit violations.
    pub rate_limit_ban: Duration,
    /// TLS handshake ceiling.
    pub ssl_handshake_timeout: Duration,
    /// Must match the peer's handshake `network_id` exactly.
    pub network_id: String,
    /// Resolution preference for outbound dials.
    pub prefer_ipv6: bool,
    /// Exempt loopback addresses from ban enforcement (tests only).
    pub testing_mode: bool,
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
    pub node_cert_path: PathBuf,
    pub node_key_path: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: DEFAULT_P2P_PORT,
            connection_limit: DEFAULT_CONNECTION_LIMIT,
            invalid_protocol_ban: Duration::from_secs(DEFAULT_INVALID_PROTOCOL_BAN_SECS),
            rate_limit_ban: Duration::from_secs(DEFAULT_RATE_LIMIT_BAN_SECS),
            ssl_handshake_timeout: Duration::from_secs(DEFAULT_SSL_HANDSHAKE_TIMEOUT_SECS),
            network_id: "mainnet".to_string(),
            prefer_ipv6: false,
            testing_mode: false,
            ca_cert_path: PathBuf::from("ca.crt"),
            ca_key_path: PathBuf::from("ca.key"),
            node_cert_path: PathBuf::from("node.crt"),
            node_key_path: PathBuf::from("node.key"),
        }
    }
}

impl NetworkConfig {
    /// Configuration preset for testnet: relaxed ban enforcement on loopback.
    pub fn testnet() -> Self {
        Self {
            network_id: "testnet".to_string(),
            testing_mode: true,
            ..Self::default()
        }
    }

    /// Configuration preset for mainnet: full ban enforcement.
    pub fn mainnet() -> Self {
        Self {
            network_id: "mainnet".to_string(),
            testing_mode: false,
            ..Self::default()
        }
    }

    pub fn listen_socket_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_default_port_and_limit() {
        let cfg = NetworkConfig::default();
        assert_eq!(cfg.listen_port, DEFAULT_P2P_PORT);
        assert_eq!(cfg.connection_limit, DEFAULT_CONNECTION_LIMIT);
    }

    #[test]
    fn listen_socket_addr_format() {
        let cfg = NetworkConfig {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 9999,
            ..NetworkConfig::default()
        };
        assert_eq!(cfg.listen_socket_addr(), "127.0.0.1:9999");
    }

    #[test]
    fn testnet_relaxes_ban_enforcement_on_loopback() {
        let cfg = NetworkConfig::testnet();
        assert!(cfg.testing_mode);
    }

    #[test]
    fn mainnet_enforces_bans_everywhere() {
        let cfg = NetworkConfig::mainnet();
        assert!(!cfg.testing_mode);
    }

    #[test]
    fn config_is_clone_and_debug() {
        let cfg = NetworkConfig::default();
        let cfg2 = cfg.clone();
        assert_eq!(format!("{:?}", cfg), format!("{:?}", cfg2));
    }
}
