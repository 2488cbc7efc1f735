//! TLS plumbing for the encrypted roles.
//!
//! One certificate covers every encrypted role. Peer certificates are never
//! validated: identities travel in-band and are proven by Ed25519
//! signatures, so the outbound connector accepts any certificate and the
//! listeners request none.

use crate::error::{ServerError, ServerResult};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{client, TlsAcceptor, TlsConnector};
use tracing::{info, warn};

/// Load the server certificate, provisioning a self-signed one on first run
/// when the configured file does not exist yet.
pub fn server_tls_config(cert_path: &Path) -> ServerResult<Arc<rustls::ServerConfig>> {
    if !cert_path.exists() {
        provision_self_signed(cert_path)?;
    }

    let mut reader = BufReader::new(std::fs::File::open(cert_path)?);
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut reader).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(ServerError::Internal(format!(
            "no certificate found in {}",
            cert_path.display()
        )));
    }

    let mut reader = BufReader::new(std::fs::File::open(cert_path)?);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| {
            ServerError::Internal(format!("no private key found in {}", cert_path.display()))
        })?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Internal(format!("bad TLS certificate: {e}")))?;

    Ok(Arc::new(config))
}

fn provision_self_signed(cert_path: &Path) -> ServerResult<()> {
    warn!(
        "TLS certificate {} not found, provisioning a self-signed one",
        cert_path.display()
    );

    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| ServerError::Internal(format!("certificate generation failed: {e}")))?;

    if let Some(parent) = cert_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let pem = format!("{}{}", certified.cert.pem(), certified.key_pair.serialize_pem());
    std::fs::write(cert_path, pem)?;

    info!("Self-signed certificate written to {}", cert_path.display());
    Ok(())
}

pub fn acceptor(config: Arc<rustls::ServerConfig>) -> TlsAcceptor {
    TlsAcceptor::from(config)
}

/// Accepts any server certificate. Peer identity is established in-band.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

/// Connector for outbound peer conversations; certificate checks disabled.
pub fn insecure_connector() -> TlsConnector {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

pub async fn connect(
    connector: &TlsConnector,
    addr: SocketAddr,
) -> ServerResult<client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from(addr.ip().to_string())
        .map_err(|_| ServerError::Internal(format!("bad server name for {addr}")))?;
    Ok(connector.connect(server_name, tcp).await?)
}
