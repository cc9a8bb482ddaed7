//! Capture interface between the interception core and external recorders
//!
//! The core produces one [`CapturedRequest`] per completed request/response
//! exchange and hands it to whatever [`Recorder`] is installed. Recorder
//! failures are best-effort telemetry: they are logged by the caller and
//! never block the in-flight exchange.

use crate::error::Result;
use bytes::Bytes;
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One intercepted request, decoupled from any wire representation.
///
/// Header and query multimaps are carried as serialized JSON so recorders can
/// persist them as opaque columns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapturedRequest {
  /// Request method
  pub method: String,
  /// Host the request was addressed to, without the port
  pub host: String,
  /// `http` for forwarded requests, `https` for intercepted tunnels
  pub scheme: String,
  /// Path component of the request target
  pub path: String,
  /// JSON object: header name -> list of values
  pub headers: String,
  /// JSON object: query parameter -> list of values
  pub params: String,
  /// Request body, excluded from serialized form
  #[serde(skip)]
  pub body: Bytes,
}

impl CapturedRequest {
  /// Build a capture from parsed request parts.
  ///
  /// `target` is the request target in origin-form (path plus optional query).
  pub fn new(
    method: &Method,
    scheme: &str,
    host: &str,
    target: &str,
    headers: &HeaderMap,
    body: Bytes,
  ) -> Self {
    let (path, query) = match target.split_once('?') {
      Some((path, query)) => (path, query),
      None => (target, ""),
    };

    let mut header_map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
      header_map
        .entry(name.as_str().to_string())
        .or_default()
        .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    let mut param_map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
      param_map
        .entry(key.into_owned())
        .or_default()
        .push(value.into_owned());
    }

    Self {
      method: method.as_str().to_string(),
      host: host.to_string(),
      scheme: scheme.to_string(),
      path: path.to_string(),
      headers: serde_json::to_string(&header_map).unwrap_or_default(),
      params: serde_json::to_string(&param_map).unwrap_or_default(),
      body,
    }
  }
}

/// Sink for captured requests, implemented by the external recording layer
#[async_trait::async_trait]
pub trait Recorder: Send + Sync {
  /// Record one completed exchange
  async fn record(&self, request: CapturedRequest) -> Result<()>;
}

/// Default recorder that logs captures through `tracing`
pub struct LogRecorder;

#[async_trait::async_trait]
impl Recorder for LogRecorder {
  async fn record(&self, request: CapturedRequest) -> Result<()> {
    tracing::info!(
      "captured {} {}://{}{} ({} body bytes)",
      request.method,
      request.scheme,
      request.host,
      request.path,
      request.body.len()
    );
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use http::header::HeaderValue;

  #[test]
  fn multimaps_serialize_repeated_entries() {
    let mut headers = HeaderMap::new();
    headers.append("x-tag", HeaderValue::from_static("one"));
    headers.append("x-tag", HeaderValue::from_static("two"));
    let capture = CapturedRequest::new(
      &Method::GET,
      "https",
      "example.com",
      "/search?q=a&q=b&lang=en",
      &headers,
      Bytes::new(),
    );

    assert_eq!(capture.path, "/search");
    let params: BTreeMap<String, Vec<String>> = serde_json::from_str(&capture.params).unwrap();
    assert_eq!(params["q"], vec!["a", "b"]);
    assert_eq!(params["lang"], vec!["en"]);
    let headers: BTreeMap<String, Vec<String>> = serde_json::from_str(&capture.headers).unwrap();
    assert_eq!(headers["x-tag"], vec!["one", "two"]);
  }

  #[test]
  fn target_without_query_has_empty_params() {
    let capture = CapturedRequest::new(
      &Method::POST,
      "http",
      "example.org",
      "/submit",
      &HeaderMap::new(),
      Bytes::from_static(b"payload"),
    );
    assert_eq!(capture.path, "/submit");
    assert_eq!(capture.params, "{}");
    assert_eq!(&capture.body[..], b"payload");
  }
}
