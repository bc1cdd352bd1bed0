//! Core types for the cache bucket store.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

/// A resource request as seen by the agent.
///
/// The identity of a request inside a cache bucket is its method plus its
/// absolute URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self { method, url }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  /// Stable, fixed-length key for this request identity.
  pub fn cache_key(&self) -> String {
    let input = format!("{} {}", self.method, self.url);
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Origin classification of a response, mirroring the fetch API's
/// `Response.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
  /// Same-origin response
  Basic,
  /// Cross-origin response readable via CORS
  Cors,
  /// Cross-origin response with hidden status and body
  Opaque,
  /// Network error placeholder
  Error,
}

impl ResponseType {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResponseType::Basic => "basic",
      ResponseType::Cors => "cors",
      ResponseType::Opaque => "opaque",
      ResponseType::Error => "error",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "basic" => Some(ResponseType::Basic),
      "cors" => Some(ResponseType::Cors),
      "opaque" => Some(ResponseType::Opaque),
      "error" => Some(ResponseType::Error),
      _ => None,
    }
  }
}

/// A response returned by the network or read back from a cache bucket.
///
/// The body is reference counted, so cloning a response to both store and
/// return it does not copy the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub url: Url,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
  pub response_type: ResponseType,
}

impl Response {
  /// Whether the status is in the 200-299 range.
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Only same-origin 200 responses may enter a cache bucket.
  pub fn is_storable(&self) -> bool {
    self.status == 200 && self.response_type == ResponseType::Basic
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// A response read from a cache bucket.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The stored response
  pub response: Response,
  /// When the response was stored
  pub cached_at: DateTime<Utc>,
}

/// Summary of one entry in a cache bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
  pub url: String,
  pub status: u16,
  pub cached_at: DateTime<Utc>,
}
