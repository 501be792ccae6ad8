//! Mutual-TLS material loading and peer identity derivation.
//!
//! Node identity on this network is the peer's certificate, not a value
//! asserted in the protocol handshake: [`node_id_from_cert`] hashes the
//! DER-encoded leaf certificate the same way on both the dialing and the
//! accepting side, so a restarted node with the same cert keeps the same id.

use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use shoal_core::error::ConfigError;
use shoal_core::message::NodeId;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let bytes = std::fs::read(path)
        .map_err(|e| ConfigError::Tls(format!("reading cert '{}': {e}", path.display())))?;
    rustls_pemfile::certs(&mut bytes.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Tls(format!("parsing cert '{}': {e}", path.display())))
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let bytes = std::fs::read(path)
        .map_err(|e| ConfigError::Tls(format!("reading key '{}': {e}", path.display())))?;
    rustls_pemfile::private_key(&mut bytes.as_slice())
        .map_err(|e| ConfigError::Tls(format!("parsing key '{}': {e}", path.display())))?
        .ok_or_else(|| ConfigError::Tls(format!("no private key found in '{}'", path.display())))
}

/// Derives a stable [`NodeId`] from a peer's leaf certificate: SHA-256 over
/// the DER bytes.
pub fn node_id_from_cert(cert: &CertificateDer<'_>) -> NodeId {
    let digest = Sha256::digest(cert.as_ref());
    NodeId(digest.into())
}

/// Loaded TLS material for both accepting inbound connections and dialing
/// outbound ones, built once at startup.
pub struct TlsMaterial {
    pub acceptor: TlsAcceptor,
    pub connector: TlsConnector,
}

/// Loads the CA cert plus this node's cert/key and builds a mutual-TLS
/// acceptor and connector: the acceptor requires a client cert signed by the
/// CA, and the connector trusts only that same CA, so both directions of a
/// connection authenticate each other's certificate.
pub fn load(
    ca_cert_path: &Path,
    node_cert_path: &Path,
    node_key_path: &Path,
) -> Result<TlsMaterial, ConfigError> {
    let ca_certs = read_certs(ca_cert_path)?;
    let node_certs = read_certs(node_cert_path)?;
    let node_key = read_private_key(node_key_path)?;

    let mut roots = RootCertStore::empty();
    for cert in &ca_certs {
        roots
            .add(cert.clone())
            .map_err(|e| ConfigError::Tls(format!("adding CA cert to root store: {e}")))?;
    }
    let roots = Arc::new(roots);

    let client_verifier = WebPkiClientVerifier::builder(roots.clone())
        .build()
        .map_err(|e| ConfigError::Tls(format!("building client verifier: {e}")))?;

    let server_config = ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(node_certs.clone(), node_key.clone_key())
        .map_err(|e| ConfigError::Tls(format!("building server config: {e}")))?;

    let client_config = ClientConfig::builder()
        .with_root_certificates((*roots).clone())
        .with_client_auth_cert(node_certs, node_key)
        .map_err(|e| ConfigError::Tls(format!("building client config: {e}")))?;

    info!(
        ca = %ca_cert_path.display(),
        node_cert = %node_cert_path.display(),
        "tls: mutual-TLS material loaded"
    );

    Ok(TlsMaterial {
        acceptor: TlsAcceptor::from(Arc::new(server_config)),
        connector: TlsConnector::from(Arc::new(client_config)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_from_cert_is_deterministic() {
        let cert = CertificateDer::from(vec![1, 2, 3, 4]);
        assert_eq!(node_id_from_cert(&cert), node_id_from_cert(&cert));
    }

    #[test]
    fn different_certs_yield_different_ids() {
        let a = CertificateDer::from(vec![1, 2, 3]);
        let b = CertificateDer::from(vec![4, 5, 6]);
        assert_ne!(node_id_from_cert(&a), node_id_from_cert(&b));
    }

    #[test]
    fn loading_from_a_missing_path_is_a_config_error_not_a_panic() {
        let missing = Path::new("/nonexistent/path/ca.crt");
        assert!(read_certs(missing).is_err());
    }
}
