//! Network access for the agent and the host's default fetch handling.

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::cache::{Request, Response, ResponseType};

/// Transport-level fetch failures.
///
/// HTTP error statuses are not errors here: a 404 is a response like any
/// other, exactly as with the fetch API.
#[derive(Error, Debug)]
pub enum NetworkError {
  /// The request could not be sent or the body could not be read.
  #[error("Request to {url} failed: {source}")]
  Transport {
    url: String,
    #[source]
    source: reqwest::Error,
  },

  /// No connection could be established.
  #[error("Network unreachable for {url}")]
  Unreachable { url: String },
}

/// Abstraction over the network for testability.
#[async_trait]
pub trait Network: Send + Sync + 'static {
  /// Perform a live fetch for the request.
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// Network implementation backed by reqwest.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  /// Responses from this origin are classified as same-origin
  origin: Url,
}

impl HttpNetwork {
  pub fn new(origin: Url) -> Self {
    Self {
      client: reqwest::Client::new(),
      origin,
    }
  }

  fn classify(&self, url: &Url) -> ResponseType {
    if url.origin() == self.origin.origin() {
      ResponseType::Basic
    } else {
      ResponseType::Cors
    }
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    let transport = |source: reqwest::Error| {
      let url = request.url.to_string();
      if source.is_connect() {
        NetworkError::Unreachable { url }
      } else {
        NetworkError::Transport { url, source }
      }
    };

    let resp = self
      .client
      .request(request.method.clone(), request.url.clone())
      .send()
      .await
      .map_err(transport)?;

    let status = resp.status().as_u16();
    let url = resp.url().clone();
    let headers = resp
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let response_type = self.classify(&url);
    let body = resp.bytes().await.map_err(transport)?;

    debug!(%url, status, bytes = body.len(), "network response");

    Ok(Response {
      url,
      status,
      headers,
      body,
      response_type,
    })
  }
}
