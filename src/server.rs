//! Listener and per-connection routing
//!
//! One plaintext listener accepts both ordinary HTTP requests and CONNECT
//! tunnels. Each accepted connection gets its own task; nothing is shared
//! between tasks except the certificate store's filesystem and the read-only
//! root authority.

use crate::bridge;
use crate::ca::CertIssuer;
use crate::capture::Recorder;
use crate::codec;
use crate::error::{Error, Result};
use crate::forward;
use crate::origin::OriginDialer;
use http::Method;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};

/// The accept loop and its shared, read-only collaborators
pub struct ProxyServer {
  listen: String,
  issuer: Option<Arc<CertIssuer>>,
  dialer: Arc<OriginDialer>,
  recorder: Arc<dyn Recorder>,
  connect_timeout: Duration,
  io_timeout: Duration,
}

impl ProxyServer {
  pub(crate) fn new(
    listen: String,
    issuer: Option<Arc<CertIssuer>>,
    dialer: Arc<OriginDialer>,
    recorder: Arc<dyn Recorder>,
    connect_timeout: Duration,
    io_timeout: Duration,
  ) -> Self {
    Self {
      listen,
      issuer,
      dialer,
      recorder,
      connect_timeout,
      io_timeout,
    }
  }

  /// Run the accept loop forever.
  pub async fn run(&self) -> Result<()> {
    let listener = TcpListener::bind(&self.listen)
      .await
      .map_err(|e| Error::relay(format!("bind {}: {}", self.listen, e)))?;
    tracing::info!(
      "proxy listening on {} (interception {})",
      self.listen,
      if self.issuer.is_some() {
        "enabled"
      } else {
        "disabled"
      }
    );

    loop {
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          let issuer = self.issuer.clone();
          let dialer = self.dialer.clone();
          let recorder = self.recorder.clone();
          let connect_timeout = self.connect_timeout;
          let io_timeout = self.io_timeout;

          tokio::spawn(async move {
            if let Err(e) = handle_connection(
              stream,
              peer_addr,
              issuer,
              dialer,
              recorder,
              connect_timeout,
              io_timeout,
            )
            .await
            {
              tracing::debug!("connection from {} ended with error: {}", peer_addr, e);
            }
          });
        }
        Err(e) => {
          tracing::error!("accept failed: {}", e);
        }
      }
    }
  }
}

async fn handle_connection(
  stream: TcpStream,
  peer_addr: SocketAddr,
  issuer: Option<Arc<CertIssuer>>,
  dialer: Arc<OriginDialer>,
  recorder: Arc<dyn Recorder>,
  connect_timeout: Duration,
  io_timeout: Duration,
) -> Result<()> {
  stream.set_nodelay(true).ok();
  let mut reader = BufReader::new(stream);

  let head = tokio::time::timeout(io_timeout, codec::read_request_head(&mut reader))
    .await
    .map_err(|_| Error::invalid_request(format!("request head from {} timed out", peer_addr)))??;

  if head.method == Method::CONNECT {
    let issuer = match issuer {
      Some(issuer) => issuer,
      None => {
        // Root authority never loaded; plaintext forwarding still works but
        // every tunnel is refused.
        codec::write_service_unavailable(&mut reader, "interception unavailable").await;
        return Err(Error::AuthorityUnavailable(
          "no root authority loaded".to_string(),
        ));
      }
    };
    // Keep the BufReader: bytes the client pipelined behind the CONNECT head
    // (typically the ClientHello) are sitting in its buffer.
    bridge::intercept(reader, &head.target, issuer, dialer, recorder).await
  } else {
    match tokio::time::timeout(
      io_timeout,
      forward::handle(&mut reader, head, connect_timeout, recorder),
    )
    .await
    {
      Ok(result) => result,
      Err(_) => Err(Error::relay(format!(
        "response to {} timed out",
        peer_addr
      ))),
    }
  }
}
