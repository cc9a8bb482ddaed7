//! Disk-backed certificate store
//!
//! One directory per hostname under the store root, holding the PEM-encoded
//! leaf certificate and private key. A host whose pair is missing or fails to
//! parse is reported as absent, which triggers regeneration upstream. No
//! locking is provided between concurrent save/load for the same host; two
//! first-touches of a cold host may both issue, and the last writer wins.

use crate::error::{Error, Result};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";

/// A loadable leaf certificate/key pair for one host
pub struct HostCertificate {
  /// Certificate chain as served to the client
  pub cert_chain: Vec<CertificateDer<'static>>,
  /// Leaf private key
  pub key: PrivateKeyDer<'static>,
}

impl Clone for HostCertificate {
  fn clone(&self) -> Self {
    Self {
      cert_chain: self.cert_chain.clone(),
      key: self.key.clone_key(),
    }
  }
}

/// Filesystem store of per-host forged certificates
pub struct CertStore {
  root: PathBuf,
}

impl CertStore {
  /// Create a store rooted at the given directory
  pub fn new(root: impl AsRef<Path>) -> Self {
    Self {
      root: root.as_ref().to_path_buf(),
    }
  }

  fn host_dir(&self, host: &str) -> Result<PathBuf> {
    // The hostname becomes a path segment; refuse anything that could
    // escape the store root or collide with other entries.
    if host.is_empty()
      || host.contains(['/', '\\', '\0'])
      || host == "."
      || host == ".."
    {
      return Err(Error::invalid_request(format!(
        "hostname not usable as store key: {:?}",
        host
      )));
    }
    Ok(self.root.join(host))
  }

  /// Load the certificate/key pair for `host`.
  ///
  /// Returns `CertNotFound` when either artifact is missing or the pair does
  /// not parse, and `StoreIo` on other read failures.
  pub async fn load(&self, host: &str) -> Result<HostCertificate> {
    let dir = self.host_dir(host)?;
    let cert_pem = read_artifact(&dir.join(CERT_FILE), host).await?;
    let key_pem = read_artifact(&dir.join(KEY_FILE), host).await?;

    let cert_chain = rustls_pemfile::certs(&mut cert_pem.as_slice())
      .collect::<std::result::Result<Vec<_>, _>>()
      .map_err(|_| Error::CertNotFound(host.to_string()))?;
    if cert_chain.is_empty() {
      return Err(Error::CertNotFound(host.to_string()));
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
      .map_err(|_| Error::CertNotFound(host.to_string()))?
      .ok_or_else(|| Error::CertNotFound(host.to_string()))?;

    Ok(HostCertificate { cert_chain, key })
  }

  /// Persist the PEM-encoded pair for `host`, overwriting a prior entry.
  pub async fn save(&self, host: &str, cert_pem: &str, key_pem: &str) -> Result<()> {
    let dir = self.host_dir(host)?;
    fs::create_dir_all(&dir)
      .await
      .map_err(|e| Error::store_io(format!("create {}: {}", dir.display(), e)))?;
    fs::write(dir.join(CERT_FILE), cert_pem)
      .await
      .map_err(|e| Error::store_io(format!("write cert for {}: {}", host, e)))?;
    fs::write(dir.join(KEY_FILE), key_pem)
      .await
      .map_err(|e| Error::store_io(format!("write key for {}: {}", host, e)))?;
    Ok(())
  }
}

async fn read_artifact(path: &Path, host: &str) -> Result<Vec<u8>> {
  match fs::read(path).await {
    Ok(bytes) => Ok(bytes),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::CertNotFound(host.to_string())),
    Err(e) => Err(Error::store_io(format!(
      "read {}: {}",
      path.display(),
      e
    ))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn temp_store(name: &str) -> CertStore {
    let dir = std::env::temp_dir().join(format!("forgeproxy-store-{}", name));
    std::fs::remove_dir_all(&dir).ok();
    CertStore::new(dir)
  }

  #[tokio::test]
  async fn missing_host_is_not_found() {
    let store = temp_store("missing");
    match store.load("example.com").await {
      Err(Error::CertNotFound(host)) => assert_eq!(host, "example.com"),
      other => panic!("expected CertNotFound, got {:?}", other.map(|_| ())),
    }
  }

  #[tokio::test]
  async fn corrupt_pair_is_treated_as_absent() {
    let store = temp_store("corrupt");
    store.save("example.com", "not a pem", "not a pem").await.unwrap();
    assert!(matches!(
      store.load("example.com").await,
      Err(Error::CertNotFound(_))
    ));
  }

  #[tokio::test]
  async fn hostile_hostnames_are_rejected() {
    let store = temp_store("hostile");
    for host in ["../../etc", "a/b", "", ".."] {
      assert!(matches!(
        store.load(host).await,
        Err(Error::InvalidRequest(_))
      ));
    }
  }
}
