//! Error types for the intercepting proxy

use std::io;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for interception and forwarding
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// Root authority certificate or key could not be loaded
  #[error("authority unavailable: {0}")]
  AuthorityUnavailable(String),

  /// Leaf key generation or signing failed
  #[error("certificate issuance failed: {0}")]
  CertificateIssuance(String),

  /// No loadable certificate/key pair for the host in the store
  #[error("certificate not found for {0}")]
  CertNotFound(String),

  /// Certificate store read/write failure
  #[error("certificate store error: {0}")]
  StoreIo(String),

  /// Origin connection failed
  #[error("origin dial failed: {0}")]
  OriginDial(String),

  /// Origin connection exceeded the dial timeout
  #[error("origin dial timed out: {0}")]
  OriginTimeout(String),

  /// Client-side TLS negotiation failed
  #[error("TLS handshake failed: {0}")]
  Handshake(String),

  /// Relay copy or serve failure
  #[error("relay error: {0}")]
  Relay(String),

  /// Invalid request
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

impl Error {
  /// Create an authority-unavailable error and log it
  pub fn authority_unavailable(msg: impl Into<String>) -> Self {
    let error = Error::AuthorityUnavailable(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a certificate issuance error and log it
  pub fn certificate_issuance(msg: impl Into<String>) -> Self {
    let error = Error::CertificateIssuance(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a store error and log it
  pub fn store_io(msg: impl Into<String>) -> Self {
    let error = Error::StoreIo(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an origin dial error and log it
  pub fn origin_dial(msg: impl Into<String>) -> Self {
    let error = Error::OriginDial(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an origin timeout error and log it
  pub fn origin_timeout(msg: impl Into<String>) -> Self {
    let error = Error::OriginTimeout(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a handshake error and log it
  pub fn handshake(msg: impl Into<String>) -> Self {
    let error = Error::Handshake(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a relay error and log it
  pub fn relay(msg: impl Into<String>) -> Self {
    let error = Error::Relay(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::error!("{}", error);
    error
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    let error = Error::Io(value);
    tracing::error!("{}", error);
    error
  }
}
