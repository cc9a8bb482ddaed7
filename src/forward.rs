//! Plaintext forwarding for non-CONNECT requests
//!
//! The proxy-facing absolute-form request is rewritten to origin-form,
//! proxy-specific headers are stripped, and the origin's response is relayed
//! verbatim. Redirects are never followed here; the original client must
//! observe them.

use crate::capture::{CapturedRequest, Recorder};
use crate::codec::{self, RequestHead};
use crate::error::{Error, Result};
use http::Uri;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const PROXY_HEADERS: [&str; 2] = ["proxy-connection", "proxy-authorization"];

/// Forward one plaintext request read from `client` and stream the response
/// back over the same connection.
pub async fn handle<S>(
  client: &mut S,
  mut head: RequestHead,
  connect_timeout: Duration,
  recorder: Arc<dyn Recorder>,
) -> Result<()>
where
  S: AsyncBufRead + AsyncRead + AsyncWrite + Unpin,
{
  let uri: Uri = match head.target.parse() {
    Ok(uri) => uri,
    Err(_) => {
      codec::write_service_unavailable(client, "unparsable request target").await;
      return Err(Error::invalid_request(format!(
        "bad proxy target: {}",
        head.target
      )));
    }
  };
  let host = match uri.host() {
    Some(host) => host.to_string(),
    None => {
      codec::write_service_unavailable(client, "proxy requests must be absolute-form").await;
      return Err(Error::invalid_request(format!(
        "target without host: {}",
        head.target
      )));
    }
  };
  let port = uri.port_u16().unwrap_or(80);
  // Origin-form request target for the upstream.
  let origin_form = uri
    .path_and_query()
    .map(|pq| pq.as_str().to_string())
    .unwrap_or_else(|| "/".to_string());

  let body = codec::read_body(client, &head.headers).await?;

  for name in PROXY_HEADERS {
    head.headers.remove(name);
  }

  let addr = format!("{}:{}", host, port);
  let origin = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await;
  let mut origin = match origin {
    Ok(Ok(stream)) => stream,
    Ok(Err(e)) => {
      codec::write_service_unavailable(client, "origin unreachable").await;
      return Err(Error::origin_dial(format!("{}: {}", addr, e)));
    }
    Err(_) => {
      codec::write_service_unavailable(client, "origin connect timed out").await;
      return Err(Error::origin_timeout(addr));
    }
  };

  let authority = if port == 80 {
    host.clone()
  } else {
    format!("{}:{}", host, port)
  };
  let wire = codec::serialize_request(&head.method, &origin_form, &authority, &head.headers, &body);
  if let Err(e) = origin.write_all(&wire).await {
    codec::write_service_unavailable(client, "origin rejected request").await;
    return Err(Error::origin_dial(format!("send to {}: {}", addr, e)));
  }

  // Mid-stream failures abort the copy; part of the response may already be
  // with the client, so no error response is attempted.
  let (status, copied) = codec::relay_response(&mut origin, client).await?;
  tracing::debug!(
    "forwarded {} {} -> {} ({} body bytes)",
    head.method,
    head.target,
    status,
    copied
  );

  let capture = CapturedRequest::new(&head.method, "http", &host, &origin_form, &head.headers, body);
  if let Err(e) = recorder.record(capture).await {
    tracing::warn!("capture record failed: {}", e);
  }
  Ok(())
}
