//! rustls configuration for both legs.
//!
//! `client_ssl_*` options build the acceptor used toward clients;
//! `server_ssl_*` options build the connector used toward servers.

#![cfg(feature = "tls")]

use crate::config::SslVerify;

use std::io;
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn load_certs(path: &str) -> io::Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| io::Error::new(e.kind(), format!("{path}: {e}")))?;
    rustls_pemfile::certs(&mut io::BufReader::new(file)).collect()
}

fn load_key(path: &str) -> io::Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .map_err(|e| io::Error::new(e.kind(), format!("{path}: {e}")))?;
    rustls_pemfile::private_key(&mut io::BufReader::new(file))?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{path}: no private key found"),
        )
    })
}

/// Acceptor for the client leg, from client_ssl_cert / client_ssl_key.
pub fn build_acceptor(cert_path: &str, key_path: &str) -> io::Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// The router's own certificate chain and key, needed for the
/// public-key-exchange auth paths.
pub fn load_identity(
    cert_path: &str,
    key_path: &str,
) -> io::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    Ok((load_certs(cert_path)?, load_key(key_path)?))
}

/// Connector for the server leg, honouring server_ssl_verify.
pub fn build_connector(
    verify: SslVerify,
    ca_file: Option<&str>,
    ca_path: Option<&str>,
) -> io::Result<TlsConnector> {
    let config = match verify {
        SslVerify::Disabled => rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::default()))
            .with_no_client_auth(),
        SslVerify::VerifyCa | SslVerify::VerifyIdentity => {
            let mut roots = rustls::RootCertStore::empty();
            if let Some(ca_file) = ca_file {
                for cert in load_certs(ca_file)? {
                    roots
                        .add(cert)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
            }
            if let Some(ca_path) = ca_path {
                for entry in std::fs::read_dir(ca_path)? {
                    let entry = entry?;
                    if entry.file_type()?.is_file() {
                        for cert in load_certs(&entry.path().to_string_lossy())? {
                            roots
                                .add(cert)
                                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                        }
                    }
                }
            }
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

pub fn server_name_for(host: &str) -> io::Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// server_ssl_verify=DISABLED: encrypt without authenticating the peer.
#[derive(Debug)]
struct AcceptAnyServerCert(rustls::crypto::CryptoProvider);

impl Default for AcceptAnyServerCert {
    fn default() -> Self {
        Self(
            rustls::crypto::CryptoProvider::get_default()
                .cloned()
                .map(|p| Arc::unwrap_or_clone(p))
                .unwrap_or_else(|| rustls::crypto::ring::default_provider()),
        )
    }
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}
