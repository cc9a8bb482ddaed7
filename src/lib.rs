#![deny(missing_docs)]

//! # forgeproxy
//!
//! An intercepting HTTP forward proxy. Ordinary requests are forwarded in
//! plaintext; `CONNECT` tunnels are hijacked, terminated with a certificate
//! forged on the fly by a local root authority, and bridged to the real
//! origin over TLS. Every request that crosses the proxy is handed to a
//! [`Recorder`] for inspection.
//!
//! ## Intercepting a tunnel
//!
//! ```rust,no_run
//! use forgeproxy::{LogRecorder, MitmProxy, ProxyConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let proxy = MitmProxy::new(ProxyConfig::default(), Arc::new(LogRecorder)).await?;
//!   proxy.start().await?;
//!   Ok(())
//! }
//! ```
//!
//! Clients must trust the root certificate (see [`MitmProxy::ca_cert_pem`])
//! for interception to succeed; without a root pair on disk the proxy still
//! runs but refuses tunnels.

pub mod bridge;
pub mod ca;
pub mod capture;
pub mod codec;
pub mod error;
pub mod forward;
pub mod origin;
pub mod proxy;
pub mod relay;
pub mod server;
pub mod store;

pub use ca::{CertIssuer, RootAuthority};
pub use capture::{CapturedRequest, LogRecorder, Recorder};
pub use error::{Error, Result};
pub use origin::OriginDialer;
pub use proxy::{MitmProxy, ProxyConfig};
pub use store::{CertStore, HostCertificate};
