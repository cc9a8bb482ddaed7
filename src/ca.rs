//! Root authority and per-host certificate forging
//!
//! The root authority is a pre-provisioned certificate/key pair loaded once at
//! startup and shared read-only by every tunnel. Leaf certificates are forged
//! on demand per hostname, signed by the root, persisted to the disk store
//! and fronted by an in-process cache.

use crate::error::{Error, Result};
use crate::store::{CertStore, HostCertificate};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;

/// Leaf certificate validity in seconds (1 year)
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Root certificate validity when generated by this tool (10 years)
const ROOT_TTL_DAYS: i64 = 3650;
/// Maximum number of leaf pairs kept in memory
const CACHE_CAPACITY: u64 = 1000;

/// The trust anchor that signs all forged leaf certificates.
///
/// Immutable for the process lifetime. Clients must trust this certificate
/// out-of-band for interception to work.
pub struct RootAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_pem: String,
}

impl RootAuthority {
  /// Load the root pair from two PEM files.
  ///
  /// Any failure here means the proxy cannot intercept; callers downgrade to
  /// plaintext-only forwarding rather than aborting.
  pub async fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
    let cert_pem = fs::read_to_string(cert_path)
      .await
      .map_err(|e| Error::authority_unavailable(format!("read {}: {}", cert_path.display(), e)))?;
    let key_pem = fs::read_to_string(key_path)
      .await
      .map_err(|e| Error::authority_unavailable(format!("read {}: {}", key_path.display(), e)))?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::authority_unavailable(format!("parse root key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::authority_unavailable(format!("parse root certificate: {}", e)))?;

    Ok(Self {
      issuer,
      ca_cert_pem: cert_pem,
    })
  }

  /// Generate a fresh self-signed root pair and persist it to the given paths.
  ///
  /// Provisioning utility for first runs and tests; the proxy itself only
  /// ever loads an existing pair.
  pub async fn generate(cert_path: &Path, key_path: &Path) -> Result<Self> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "forgeproxy root CA");
    dn.push(DnType::OrganizationName, "forgeproxy");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(ROOT_TTL_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::authority_unavailable(format!("generate root key: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::authority_unavailable(format!("self-sign root: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();
    for path in [cert_path, key_path] {
      if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
          .await
          .map_err(|e| Error::authority_unavailable(format!("create {}: {}", parent.display(), e)))?;
      }
    }
    fs::write(cert_path, &cert_pem)
      .await
      .map_err(|e| Error::authority_unavailable(format!("write root cert: {}", e)))?;
    fs::write(key_path, &key_pem)
      .await
      .map_err(|e| Error::authority_unavailable(format!("write root key: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::authority_unavailable(format!("reload root certificate: {}", e)))?;

    Ok(Self {
      issuer,
      ca_cert_pem: cert_pem,
    })
  }

  /// The root certificate in PEM form, for client trust-store installation
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Build and sign a leaf certificate for `host`, returning both PEMs.
  ///
  /// IP literals get an iPAddress SAN, everything else a dNSName SAN. The
  /// serial is 128 bits of randomness, unique per issuance and never
  /// deduplicated against prior issuances.
  fn sign_leaf(&self, host: &str) -> Result<(String, String)> {
    let mut params = CertificateParams::default();

    let mut serial = [0u8; 16];
    rand::thread_rng().fill(&mut serial[..]);
    params.serial_number = Some(SerialNumber::from(serial.to_vec()));

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    dn.push(DnType::OrganizationName, "forgeproxy");
    params.distinguished_name = dn;

    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      vec![SanType::IpAddress(ip)]
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate_issuance(format!("invalid DNS name: {}", host))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::seconds(TTL_SECS);
    params.key_usages = vec![
      KeyUsagePurpose::KeyEncipherment,
      KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![
      ExtendedKeyUsagePurpose::ServerAuth,
      ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.is_ca = IsCa::ExplicitNoCa;
    // AKI(leaf) == SKI(root); the issuer carries the key id parsed from the
    // loaded root certificate.
    params.use_authority_key_identifier_extension = true;

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_issuance(format!("generate leaf key: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_issuance(format!("sign leaf for {}: {}", host, e)))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
  }
}

/// On-demand leaf issuer: disk store first, forge on miss.
pub struct CertIssuer {
  authority: Arc<RootAuthority>,
  store: CertStore,
  cache: Cache<String, Arc<HostCertificate>>,
}

impl CertIssuer {
  /// Create an issuer over the given authority and store
  pub fn new(authority: Arc<RootAuthority>, store: CertStore) -> Self {
    Self {
      authority,
      store,
      cache: Cache::builder().max_capacity(CACHE_CAPACITY).build(),
    }
  }

  /// Composed entry point: load from the store, forge on any load failure.
  ///
  /// A store read error is deliberately not distinguished from a genuine
  /// miss; both take the regeneration path.
  pub async fn get(&self, host: &str) -> Result<HostCertificate> {
    if let Some(hit) = self.cache.get(host).await {
      return Ok((*hit).clone());
    }

    let pair = match self.store.load(host).await {
      Ok(pair) => pair,
      Err(e) => {
        tracing::debug!("store miss for {}: {}, forging", host, e);
        self.issue(host).await?
      }
    };

    self
      .cache
      .insert(host.to_string(), Arc::new(pair.clone()))
      .await;
    Ok(pair)
  }

  /// Forge, persist, then reload the pair for `host`.
  ///
  /// The reload guarantees the returned handle is exactly what is durably
  /// cached on disk.
  pub async fn issue(&self, host: &str) -> Result<HostCertificate> {
    let (cert_pem, key_pem) = self.authority.sign_leaf(host)?;
    self.store.save(host, &cert_pem, &key_pem).await?;
    self.store.load(host).await
  }

  /// The root certificate in PEM form
  pub fn ca_cert_pem(&self) -> &str {
    self.authority.ca_cert_pem()
  }
}
