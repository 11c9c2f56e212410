use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::client::danger::{ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use x509_parser::prelude::*;

use crate::identity::QuicCertificate;
use crate::message::Envelope;

const ALPN: &[u8] = b"discoro/1";

static CRYPTO_PROVIDER: OnceLock<()> = OnceLock::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER.get_or_init(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

/// Build a QUIC endpoint for scheduler/server/client wire traffic.
///
/// discoro nodes are not expected to know each other's public keys ahead of
/// time: any node can bootstrap to
/// any scheduler that the operator pointed it at. Trust is established at
/// the application layer (the optional `--secret` shared-secret handshake
/// in the bootstrap protocol), so the certificate verifier here accepts any
/// well-formed Ed25519 cert rather than pinning against a known-peers table.
pub(crate) fn build_endpoint(
    bind_addr: std::net::SocketAddr,
    cert: &QuicCertificate,
    keepalive: Duration,
    idle_timeout: Duration,
) -> Result<(quinn::Endpoint, broadcast::Sender<Arc<Envelope>>)> {
    ensure_crypto_provider();

    let cert_chain = vec![CertificateDer::from(cert.cert_der.clone())];
    let private_key = PrivatePkcs8KeyDer::from(cert.key_der.clone());

    let mut rustls_server = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain.clone(), private_key.clone_key().into())
        .context("failed to build rustls server config")?;
    rustls_server.alpn_protocols = vec![ALPN.to_vec()];
    rustls_server.max_early_data_size = 0;

    let quic_server_config = QuicServerConfig::try_from(rustls_server)
        .context("failed to build QUIC server config from rustls")?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_server_config));

    let transport_config = Arc::new({
        let mut config = quinn::TransportConfig::default();
        config.keep_alive_interval(Some(keepalive));
        config.max_concurrent_bidi_streams(16u32.into());
        config.max_concurrent_uni_streams(16u32.into());
        if let Ok(idle) = quinn::IdleTimeout::try_from(idle_timeout) {
            config.max_idle_timeout(Some(idle));
        }
        config
    });
    server_config.transport = transport_config.clone();

    let mut endpoint = quinn::Endpoint::server(server_config, bind_addr)
        .with_context(|| format!("failed to bind QUIC endpoint on {bind_addr}"))?;

    let mut rustls_client = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    rustls_client.alpn_protocols = vec![ALPN.to_vec()];
    rustls_client.enable_early_data = false;

    let quic_client_config = QuicClientConfig::try_from(rustls_client)
        .context("failed to build QUIC client config from rustls")?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(quic_client_config));
    client_config.transport_config(transport_config);
    endpoint.set_default_client_config(client_config);

    let (inbound_tx, _) = broadcast::channel(512);
    Ok((endpoint, inbound_tx))
}

/// Accepts any server certificate: discoro's trust boundary is the
/// application-level shared secret, not certificate identity.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Err(rustls::Error::General("TLS 1.2 not supported".to_string()))
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// kept `#[allow(dead_code)]`-free: `ClientCertVerifier` is unused while
// `with_no_client_auth()` is in effect, but retained as a hook point if a
// future deployment wants mutual TLS on top of the shared secret.
#[allow(dead_code)]
#[derive(Debug)]
struct RejectAllClientCerts;

impl ClientCertVerifier for RejectAllClientCerts {
    fn offer_client_auth(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Err(rustls::Error::General(
            "client certificates are not accepted".to_string(),
        ))
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Err(rustls::Error::General("TLS 1.2 not supported".to_string()))
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Err(rustls::Error::General("TLS 1.2 not supported".to_string()))
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![]
    }
}

// ---------------------------------------------------------------------------
// Certificate helpers
// ---------------------------------------------------------------------------

pub fn extract_ed25519_pubkey_from_cert_der(cert_der: &[u8]) -> Result<[u8; 32]> {
    let (_remaining, cert) = parse_x509_certificate(cert_der)
        .map_err(|err| anyhow!("failed to parse certificate DER: {err}"))?;

    let key = cert.public_key().subject_public_key.data.as_ref();
    if key.len() != 32 {
        return Err(anyhow!(
            "unexpected public key length {}; expected 32 bytes Ed25519",
            key.len()
        ));
    }

    let mut out = [0u8; 32];
    out.copy_from_slice(key);
    Ok(out)
}

pub(crate) fn derive_agent_id_from_pubkey_bytes(pubkey: &[u8]) -> String {
    let digest = Sha256::digest(pubkey);
    let hex: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
    format!("node.{hex}")
}

#[cfg(test)]
#[path = "tls_tests.rs"]
mod tests;
