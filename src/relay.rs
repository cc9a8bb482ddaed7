//! One-shot relay over an already-decrypted connection
//!
//! Presents a single established connection as if it were a freshly accepted
//! listener socket, so the normal request pipeline (parse, capture, forward,
//! respond) runs unmodified over the MITM'd channel. The listener yields the
//! connection exactly once; the connection wrapper signals a completion
//! channel on shutdown so the tunnel owner can hold the underlying sockets
//! open until the pipeline is finished with them.

use crate::capture::{CapturedRequest, Recorder};
use crate::codec;
use crate::error::{Error, Result};
use http::header::HOST;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::sync::oneshot;

/// Connection wrapper that fires a completion signal when shut down.
///
/// If the stream is dropped without an orderly shutdown the sender side of
/// the channel is dropped too, which also unblocks the waiter.
pub struct SignalStream<S> {
  inner: S,
  done: Option<oneshot::Sender<()>>,
}

impl<S> SignalStream<S> {
  /// Wrap a stream, returning the receiver the tunnel owner blocks on.
  pub fn new(inner: S) -> (Self, oneshot::Receiver<()>) {
    let (tx, rx) = oneshot::channel();
    (
      Self {
        inner,
        done: Some(tx),
      },
      rx,
    )
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for SignalStream<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SignalStream<S> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_shutdown(cx) {
      Poll::Ready(res) => {
        if let Some(tx) = this.done.take() {
          let _ = tx.send(());
        }
        Poll::Ready(res)
      }
      Poll::Pending => Poll::Pending,
    }
  }
}

/// Listener that yields a pre-established connection exactly once
pub struct OneShotListener<S> {
  conn: Option<S>,
}

impl<S> OneShotListener<S> {
  /// Create a listener over the given connection
  pub fn new(conn: S) -> Self {
    Self { conn: Some(conn) }
  }

  /// Return the connection on the first call, fail on every later call.
  pub fn accept(&mut self) -> Result<S> {
    self
      .conn
      .take()
      .ok_or_else(|| Error::Relay("one-shot listener exhausted".to_string()))
  }
}

/// Serve requests from the pseudo-listener until it is exhausted.
///
/// With a one-shot listener this is exactly one request/response exchange:
/// parse the request, record the capture, forward over the pre-dialed origin
/// connection and relay the response verbatim.
pub async fn serve<S, O>(
  mut listener: OneShotListener<SignalStream<S>>,
  mut origin: O,
  authority: String,
  recorder: Arc<dyn Recorder>,
) where
  S: AsyncRead + AsyncWrite + Unpin,
  O: AsyncRead + AsyncWrite + Unpin,
{
  loop {
    let conn = match listener.accept() {
      Ok(conn) => conn,
      Err(_) => break,
    };
    if let Err(e) = serve_exchange(conn, &mut origin, &authority, recorder.clone()).await {
      tracing::warn!("relay exchange for {} failed: {}", authority, e);
    }
  }
}

async fn serve_exchange<S, O>(
  conn: SignalStream<S>,
  origin: &mut O,
  authority: &str,
  recorder: Arc<dyn Recorder>,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
  O: AsyncRead + AsyncWrite + Unpin,
{
  let mut reader = BufReader::new(conn);
  let head = codec::read_request_head(&mut reader).await?;
  let body = codec::read_body(&mut reader, &head.headers).await?;

  // The request's own Host header names the origin the client meant; the
  // SNI-derived authority is only the fallback for requests without one.
  let authority = head
    .headers
    .get(HOST)
    .and_then(|v| v.to_str().ok())
    .map(str::trim)
    .filter(|h| !h.is_empty())
    .unwrap_or(authority);
  let host = codec::host_of_authority(authority);
  let capture = CapturedRequest::new(
    &head.method,
    "https",
    host,
    &head.target,
    &head.headers,
    body.clone(),
  );
  if let Err(e) = recorder.record(capture).await {
    tracing::warn!("capture record failed: {}", e);
  }

  let wire = codec::serialize_request(&head.method, &head.target, authority, &head.headers, &body);
  origin
    .write_all(&wire)
    .await
    .map_err(|e| Error::relay(format!("forward request: {}", e)))?;
  origin
    .flush()
    .await
    .map_err(|e| Error::relay(format!("flush request: {}", e)))?;

  let mut conn = reader.into_inner();
  let (status, copied) = codec::relay_response(origin, &mut conn).await?;
  tracing::debug!(
    "relayed {} {} -> {} ({} body bytes)",
    head.method,
    head.target,
    status,
    copied
  );

  // Orderly shutdown fires the completion signal.
  conn.shutdown().await.ok();
  Ok(())
}
