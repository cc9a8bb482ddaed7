//! CONNECT tunnel interception
//!
//! Turns a hijacked CONNECT tunnel into a terminated, decrypted TLS server
//! endpoint whose served certificate matches whatever name the ClientHello
//! announces, then hands the cleartext connection and the pre-dialed origin
//! connection to the one-shot relay.

use crate::ca::CertIssuer;
use crate::capture::Recorder;
use crate::codec;
use crate::error::{Error, Result};
use crate::origin::OriginDialer;
use crate::relay::{self, OneShotListener, SignalStream};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::LazyConfigAcceptor;

/// Intercept one CONNECT tunnel.
///
/// Failures before the tunnel-established response are answered with a 503;
/// once the raw transport carries TLS, failures tear the connection down
/// silently because the HTTP response channel is gone.
pub async fn intercept<S>(
  mut client: S,
  target: &str,
  issuer: Arc<CertIssuer>,
  dialer: Arc<OriginDialer>,
  recorder: Arc<dyn Recorder>,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  let (host, port) = match codec::split_connect_target(target) {
    Ok(parts) => parts,
    Err(e) => {
      codec::write_service_unavailable(&mut client, "bad CONNECT target").await;
      return Err(e);
    }
  };

  // Eagerly obtain the certificate for the CONNECT host; it serves as the
  // fallback when the ClientHello carries no server name.
  let fallback = match issuer.get(&host).await {
    Ok(pair) => pair,
    Err(e) => {
      codec::write_service_unavailable(&mut client, "certificate unavailable").await;
      return Err(e);
    }
  };

  // Hijack: synthetic tunnel-established response, then TLS over the raw
  // transport. No structured HTTP error is possible past this line.
  client
    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
    .await?;
  client.flush().await?;

  let start = LazyConfigAcceptor::new(Acceptor::default(), client)
    .await
    .map_err(|e| Error::handshake(format!("client hello: {}", e)))?;
  let sni = start.client_hello().server_name().map(str::to_string);
  let name = sni.unwrap_or_else(|| host.clone());

  // Certificate-selection window: the origin is dialed here, not earlier, so
  // an abandoned handshake never costs an origin connection, and the forged
  // certificate matches the name the client actually asked for.
  let origin = dialer.dial(&host, port, &name).await?;
  let pair = if name == host {
    fallback
  } else {
    issuer.get(&name).await?
  };

  let mut config = ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(pair.cert_chain, pair.key)
    .map_err(|e| Error::handshake(format!("server config for {}: {}", name, e)))?;
  config.alpn_protocols = vec![b"http/1.1".to_vec()];

  let tls = start
    .into_stream(Arc::new(config))
    .await
    .map_err(|e| Error::handshake(format!("finish handshake with {}: {}", name, e)))?;

  let authority = if port == 443 {
    name.clone()
  } else if name.contains(':') {
    // IPv6 literal authorities carry brackets.
    format!("[{}]:{}", name, port)
  } else {
    format!("{}:{}", name, port)
  };
  let (conn, done) = SignalStream::new(tls);
  let listener = OneShotListener::new(conn);
  let serve_task = tokio::spawn(relay::serve(listener, origin, authority, recorder));

  // Hold both sockets until the pipeline has closed the client connection.
  let _ = done.await;
  let _ = serve_task.await;
  Ok(())
}
