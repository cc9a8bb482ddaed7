//! Proxy configuration and the top-level facade
//!
//! [`MitmProxy`] wires the root authority, certificate store, issuance cache
//! and origin dialer together, and degrades to a plaintext-only proxy when the
//! root authority cannot be loaded.

use crate::ca::{CertIssuer, RootAuthority};
use crate::capture::Recorder;
use crate::error::Result;
use crate::origin::OriginDialer;
use crate::server::ProxyServer;
use crate::store::CertStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Everything the proxy needs to start.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
  /// Address the plaintext listener binds to
  pub listen: String,
  /// PEM-encoded root certificate used to sign forged leaves
  pub ca_cert_path: PathBuf,
  /// PEM-encoded private key matching the root certificate
  pub ca_key_path: PathBuf,
  /// Directory holding one sub-directory of PEM material per host
  pub cert_store_path: PathBuf,
  /// Deadline for dialing and handshaking with origins
  pub connect_timeout: Duration,
  /// Deadline for client-facing reads and writes outside tunnels
  pub io_timeout: Duration,
  /// Verify origin certificates against the system trust store
  pub verify_origin_certs: bool,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      listen: "127.0.0.1:8080".to_string(),
      ca_cert_path: PathBuf::from("ca.crt"),
      ca_key_path: PathBuf::from("ca.key"),
      cert_store_path: PathBuf::from("certs"),
      connect_timeout: Duration::from_secs(10),
      io_timeout: Duration::from_secs(10),
      verify_origin_certs: true,
    }
  }
}

/// An intercepting forward proxy.
///
/// Construction loads the root authority; a missing or unreadable authority is
/// downgraded to a warning so the proxy still serves plaintext traffic.
pub struct MitmProxy {
  config: ProxyConfig,
  issuer: Option<Arc<CertIssuer>>,
  dialer: Arc<OriginDialer>,
  recorder: Arc<dyn Recorder>,
}

impl MitmProxy {
  /// Build the proxy, loading the root authority from the configured paths.
  pub async fn new(config: ProxyConfig, recorder: Arc<dyn Recorder>) -> Result<Self> {
    let issuer = match RootAuthority::load(&config.ca_cert_path, &config.ca_key_path).await {
      Ok(authority) => {
        let store = CertStore::new(&config.cert_store_path);
        Some(Arc::new(CertIssuer::new(Arc::new(authority), store)))
      }
      Err(e) => {
        tracing::warn!("interception disabled: {}", e);
        None
      }
    };
    let dialer = Arc::new(OriginDialer::new(
      config.verify_origin_certs,
      config.connect_timeout,
    )?);
    Ok(Self {
      config,
      issuer,
      dialer,
      recorder,
    })
  }

  /// Whether CONNECT tunnels will be intercepted rather than refused.
  pub fn interception_enabled(&self) -> bool {
    self.issuer.is_some()
  }

  /// The root certificate clients must trust, when interception is enabled.
  pub fn ca_cert_pem(&self) -> Option<&str> {
    self.issuer.as_ref().map(|i| i.ca_cert_pem())
  }

  /// Bind the listener and serve until the task is dropped.
  pub async fn start(&self) -> Result<()> {
    ProxyServer::new(
      self.config.listen.clone(),
      self.issuer.clone(),
      self.dialer.clone(),
      self.recorder.clone(),
      self.config.connect_timeout,
      self.config.io_timeout,
    )
    .run()
    .await
  }
}
