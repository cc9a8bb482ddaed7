//! Minimal HTTP/1.1 wire handling shared by the plaintext forwarder and the
//! one-shot relay: request-head parsing with size caps, origin-form
//! serialization, and verbatim response relaying.

use crate::error::{Error, Result};
use bytes::Bytes;
use http::header::{
  HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING,
};
use http::{HeaderMap, Method};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Cap on request/response head size (64KB)
const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Cap on buffered request body size (1MB)
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Parsed request line and headers, target kept as received
pub struct RequestHead {
  /// Request method
  pub method: Method,
  /// Request target exactly as it appeared on the request line
  pub target: String,
  /// All request headers, repeated names preserved
  pub headers: HeaderMap,
}

/// Read and parse one request head from the client.
pub async fn read_request_head<R>(reader: &mut R) -> Result<RequestHead>
where
  R: AsyncBufReadExt + Unpin,
{
  let mut line = String::new();
  let n = reader.read_line(&mut line).await?;
  if n == 0 {
    return Err(Error::InvalidRequest("closed before request line".to_string()));
  }
  let parts: Vec<&str> = line.split_whitespace().collect();
  if parts.len() < 3 {
    return Err(Error::invalid_request(format!(
      "malformed request line: {:?}",
      line.trim_end()
    )));
  }
  let method = parts[0]
    .parse::<Method>()
    .map_err(|_| Error::invalid_request(format!("bad method: {}", parts[0])))?;
  let target = parts[1].to_string();
  if !matches!(parts[2], "HTTP/1.0" | "HTTP/1.1") {
    return Err(Error::invalid_request(format!(
      "unsupported version: {}",
      parts[2]
    )));
  }

  let mut headers = HeaderMap::new();
  let mut acc = line.len();
  loop {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 || line == "\r\n" || line == "\n" {
      break;
    }
    acc += n;
    if acc > MAX_HEAD_SIZE {
      return Err(Error::invalid_request("request head exceeds maximum size"));
    }
    if let Some(idx) = line.find(':') {
      let (name, value) = line.split_at(idx);
      let name = HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|_| Error::invalid_request(format!("bad header name: {}", name.trim())))?;
      let value = HeaderValue::from_str(value[1..].trim())
        .map_err(|_| Error::invalid_request(format!("bad header value for {}", name)))?;
      headers.append(name, value);
    }
  }

  Ok(RequestHead {
    method,
    target,
    headers,
  })
}

/// Read the request body: `Content-Length` bytes, a dechunked
/// `Transfer-Encoding: chunked` body, or empty when neither is announced.
pub async fn read_body<R>(reader: &mut R, headers: &HeaderMap) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  if is_chunked(headers) {
    return read_chunked_body(reader).await;
  }
  let len = match headers.get(CONTENT_LENGTH) {
    Some(v) => v
      .to_str()
      .ok()
      .and_then(|s| s.parse::<usize>().ok())
      .ok_or_else(|| Error::invalid_request("unparsable Content-Length"))?,
    None => return Ok(Bytes::new()),
  };
  if len > MAX_BODY_SIZE {
    return Err(Error::invalid_request("request body exceeds maximum size"));
  }
  let mut body = vec![0u8; len];
  reader.read_exact(&mut body).await?;
  Ok(Bytes::from(body))
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers.get_all(TRANSFER_ENCODING).iter().any(|v| {
    v.to_str().map_or(false, |s| {
      s.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked"))
    })
  })
}

/// Decode one chunked body, trailers included, into contiguous bytes.
///
/// Dechunking here means the upstream copy carries a plain `Content-Length`;
/// `serialize_request` drops the `Transfer-Encoding` header to match.
async fn read_chunked_body<R>(reader: &mut R) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  loop {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
      return Err(Error::invalid_request("connection closed inside chunked body"));
    }
    // Chunk extensions after ';' are ignored.
    let size_token = line.trim().split(';').next().unwrap_or("").trim();
    let size = usize::from_str_radix(size_token, 16)
      .map_err(|_| Error::invalid_request(format!("bad chunk size: {:?}", line.trim_end())))?;
    if size == 0 {
      break;
    }
    if body.len() + size > MAX_BODY_SIZE {
      return Err(Error::invalid_request("request body exceeds maximum size"));
    }
    let start = body.len();
    body.resize(start + size, 0);
    reader.read_exact(&mut body[start..]).await?;
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
    if &crlf != b"\r\n" {
      return Err(Error::invalid_request("chunk data not terminated by CRLF"));
    }
  }
  // Trailer section, up to and including the blank line.
  loop {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 || line == "\r\n" || line == "\n" {
      break;
    }
  }
  Ok(Bytes::from(body))
}

/// Serialize a request in origin-form for the upstream.
///
/// The request URI is reduced to path and query, proxy-facing headers are
/// assumed already stripped by the caller, `Host` is forced to the origin
/// authority and `Connection: close` is set so the response is delimited by
/// EOF regardless of transfer encoding. The body is always carried with a
/// `Content-Length`; any client `Transfer-Encoding` was already decoded by
/// [`read_body`] and its header must not survive onto the wire.
pub fn serialize_request(
  method: &Method,
  origin_form: &str,
  host: &str,
  headers: &HeaderMap,
  body: &[u8],
) -> Vec<u8> {
  let mut buf = Vec::new();
  buf.extend_from_slice(method.as_str().as_bytes());
  buf.push(b' ');
  buf.extend_from_slice(origin_form.as_bytes());
  buf.extend_from_slice(b" HTTP/1.1\r\n");

  buf.extend_from_slice(b"Host: ");
  buf.extend_from_slice(host.as_bytes());
  buf.extend_from_slice(b"\r\n");

  for (name, value) in headers {
    if name == HOST || name == CONNECTION || name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
      continue;
    }
    buf.extend_from_slice(name.as_str().as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
  }

  if !body.is_empty() {
    buf.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
  }
  buf.extend_from_slice(b"Connection: close\r\n\r\n");
  buf.extend_from_slice(body);
  buf
}

/// Relay the upstream response verbatim to the client.
///
/// The head is buffered only far enough to find the end of headers and pull
/// the status code for logging; every byte is written to the client exactly
/// as received, and the body is streamed until upstream EOF. Returns the
/// status code and the number of bytes copied after the head.
pub async fn relay_response<R, W>(origin: &mut R, client: &mut W) -> Result<(u16, u64)>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut head = Vec::new();
  let mut chunk = [0u8; 8192];
  let body_copied = loop {
    let n = origin
      .read(&mut chunk)
      .await
      .map_err(|e| Error::relay(format!("read response head: {}", e)))?;
    if n == 0 {
      return Err(Error::relay("origin closed before response head"));
    }
    head.extend_from_slice(&chunk[..n]);
    if let Some(end) = find_head_end(&head) {
      client
        .write_all(&head)
        .await
        .map_err(|e| Error::relay(format!("write response head: {}", e)))?;
      break (head.len() - end) as u64;
    }
    if head.len() > MAX_HEAD_SIZE {
      return Err(Error::relay("response head exceeds maximum size"));
    }
  };

  let status = parse_status(&head)?;
  let streamed = tokio::io::copy(origin, client)
    .await
    .map_err(|e| Error::relay(format!("stream response body: {}", e)))?;
  client
    .flush()
    .await
    .map_err(|e| Error::relay(format!("flush response: {}", e)))?;
  Ok((status, body_copied + streamed))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
  buf
    .windows(4)
    .position(|w| w == b"\r\n\r\n")
    .map(|i| i + 4)
}

fn parse_status(head: &[u8]) -> Result<u16> {
  let line_end = head
    .windows(2)
    .position(|w| w == b"\r\n")
    .unwrap_or(head.len());
  let line = String::from_utf8_lossy(&head[..line_end]);
  line
    .split_whitespace()
    .nth(1)
    .and_then(|s| s.parse::<u16>().ok())
    .ok_or_else(|| Error::relay(format!("malformed status line: {}", line)))
}

/// Best-effort 503 for failures that happen while the HTTP response channel
/// still exists.
pub async fn write_service_unavailable<W>(client: &mut W, reason: &str)
where
  W: AsyncWrite + Unpin,
{
  let body = format!("proxy error: {}\r\n", reason);
  let head = format!(
    "HTTP/1.1 503 Service Unavailable\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
    body.len()
  );
  let _ = client.write_all(head.as_bytes()).await;
  let _ = client.write_all(body.as_bytes()).await;
  let _ = client.flush().await;
}

/// Strip a trailing port from an authority, leaving bare IPv6 literals and
/// port-less authorities untouched.
pub fn host_of_authority(authority: &str) -> &str {
  if let Some(inner) = authority.strip_prefix('[') {
    return inner.split(']').next().unwrap_or(inner);
  }
  match authority.rsplit_once(':') {
    Some((host, port))
      if !host.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
    {
      host
    }
    _ => authority,
  }
}

/// Split a CONNECT authority-form target into host and port.
pub fn split_connect_target(target: &str) -> Result<(String, u16)> {
  let (host, port) = target
    .rsplit_once(':')
    .ok_or_else(|| Error::invalid_request(format!("CONNECT target without port: {}", target)))?;
  let port = port
    .parse::<u16>()
    .map_err(|_| Error::invalid_request(format!("bad port in CONNECT target: {}", target)))?;
  let host = host.trim_start_matches('[').trim_end_matches(']');
  if host.is_empty() {
    return Err(Error::invalid_request(format!(
      "empty host in CONNECT target: {}",
      target
    )));
  }
  Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;
  use tokio::io::BufReader;

  #[tokio::test]
  async fn parses_request_head_with_repeated_headers() {
    let raw = b"GET /path?a=1 HTTP/1.1\r\nHost: example.com\r\nX-Tag: one\r\nX-Tag: two\r\n\r\n";
    let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
    let head = read_request_head(&mut reader).await.unwrap();
    assert_eq!(head.method, Method::GET);
    assert_eq!(head.target, "/path?a=1");
    assert_eq!(
      head
        .headers
        .get_all("x-tag")
        .iter()
        .map(|v| v.to_str().unwrap())
        .collect::<Vec<_>>(),
      vec!["one", "two"]
    );
  }

  #[tokio::test]
  async fn body_follows_content_length() {
    let raw = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
    let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
    let head = read_request_head(&mut reader).await.unwrap();
    let body = read_body(&mut reader, &head.headers).await.unwrap();
    assert_eq!(&body[..], b"hello");
  }

  #[tokio::test]
  async fn chunked_body_is_decoded_with_extensions_and_trailers() {
    let raw = b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: t\r\n\r\n";
    let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
    let head = read_request_head(&mut reader).await.unwrap();
    let body = read_body(&mut reader, &head.headers).await.unwrap();
    assert_eq!(&body[..], b"hello world");
  }

  #[tokio::test]
  async fn truncated_chunked_body_is_rejected() {
    let raw = b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhel";
    let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
    let head = read_request_head(&mut reader).await.unwrap();
    assert!(read_body(&mut reader, &head.headers).await.is_err());
  }

  #[test]
  fn serialized_request_is_origin_form_with_close() {
    let mut headers = HeaderMap::new();
    headers.insert(HOST, HeaderValue::from_static("stale.example"));
    headers.insert("x-custom", HeaderValue::from_static("yes"));
    let buf = serialize_request(&Method::GET, "/path", "example.org", &headers, b"");
    let text = String::from_utf8(buf).unwrap();
    assert!(text.starts_with("GET /path HTTP/1.1\r\n"));
    assert!(text.contains("Host: example.org\r\n"));
    assert!(!text.contains("stale.example"));
    assert!(text.contains("Connection: close\r\n"));
  }

  #[test]
  fn serialized_body_uses_content_length_never_chunked() {
    let mut headers = HeaderMap::new();
    headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    let buf = serialize_request(&Method::POST, "/up", "example.org", &headers, b"hello");
    let text = String::from_utf8(buf).unwrap();
    assert!(text.contains("Content-Length: 5\r\n"));
    assert!(!text.to_lowercase().contains("transfer-encoding"));
    assert!(text.ends_with("\r\n\r\nhello"));
  }

  #[test]
  fn authority_port_stripping_keeps_ipv6_hosts_intact() {
    assert_eq!(host_of_authority("example.com:443"), "example.com");
    assert_eq!(host_of_authority("example.com"), "example.com");
    assert_eq!(host_of_authority("[::1]:8443"), "::1");
    assert_eq!(host_of_authority("::1"), "::1");
    assert_eq!(host_of_authority("127.0.0.1:8080"), "127.0.0.1");
  }

  #[tokio::test]
  async fn response_relayed_verbatim() {
    let upstream = b"HTTP/1.1 203 Non-Authoritative\r\nX-Odd: 1\r\n\r\nbody bytes".to_vec();
    let mut origin = Cursor::new(upstream.clone());
    let mut client = Vec::new();
    let (status, copied) = relay_response(&mut origin, &mut client).await.unwrap();
    assert_eq!(status, 203);
    assert_eq!(copied, "body bytes".len() as u64);
    assert_eq!(client, upstream);
  }

  #[test]
  fn connect_target_splits_host_and_port() {
    assert_eq!(
      split_connect_target("example.com:443").unwrap(),
      ("example.com".to_string(), 443)
    );
    assert_eq!(
      split_connect_target("[::1]:8443").unwrap(),
      ("::1".to_string(), 8443)
    );
    assert!(split_connect_target("example.com").is_err());
  }
}
