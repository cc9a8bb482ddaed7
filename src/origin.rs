//! TLS dialer for the real origin
//!
//! Invoked exactly once per ClientHello, inside the handshake window, so the
//! origin connection exists by the time the forged certificate is served.
//! ALPN is pinned to HTTP/1.1: the relay speaks exactly one HTTP/1.1
//! transaction and must not let the origin negotiate h2.

use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

/// Dials origins over TLS with a bounded connect timeout
pub struct OriginDialer {
  connector: TlsConnector,
  connect_timeout: Duration,
}

impl OriginDialer {
  /// Create a dialer.
  ///
  /// With `verify_certs` the origin chain is checked against the platform
  /// trust roots; disabling it is for tests against self-signed origins.
  pub fn new(verify_certs: bool, connect_timeout: Duration) -> Result<Self> {
    let mut config = if verify_certs {
      let mut roots = RootCertStore::empty();
      let native = rustls_native_certs::load_native_certs();
      for err in native.errors {
        tracing::debug!("native cert load warning: {}", err);
      }
      for cert in native.certs {
        if let Err(e) = roots.add(cert) {
          tracing::debug!("skipping unusable native cert: {}", e);
        }
      }
      if roots.is_empty() {
        return Err(Error::origin_dial("no platform trust roots available"));
      }
      ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
    } else {
      ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Self {
      connector: TlsConnector::from(Arc::new(config)),
      connect_timeout,
    })
  }

  /// Open a TLS connection to `host:port`, announcing `server_name` as SNI.
  ///
  /// The server name comes from the client's ClientHello, which may differ
  /// from the CONNECT target when the origin virtual-hosts.
  pub async fn dial(
    &self,
    host: &str,
    port: u16,
    server_name: &str,
  ) -> Result<TlsStream<TcpStream>> {
    let addr = format!("{}:{}", host, port);
    let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
      .await
      .map_err(|_| Error::origin_timeout(addr.clone()))?
      .map_err(|e| Error::origin_dial(format!("{}: {}", addr, e)))?;

    let name = ServerName::try_from(server_name.to_string())
      .map_err(|_| Error::origin_dial(format!("invalid server name: {}", server_name)))?;
    let tls = tokio::time::timeout(self.connect_timeout, self.connector.connect(name, tcp))
      .await
      .map_err(|_| Error::origin_timeout(format!("TLS to {}", addr)))?
      .map_err(|e| Error::origin_dial(format!("TLS to {}: {}", addr, e)))?;

    Ok(tls)
  }
}

#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
    ]
  }
}
