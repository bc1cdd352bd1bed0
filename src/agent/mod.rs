//! Offline cache agent: pre-cache on install, prune on activate, serve
//! cache-first with a background refresh on fetch.

pub mod manifest;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, Request, Response};
use crate::error::AgentError;
use crate::host::{Disposition, FetchEvent, Worker, WorkerScope};
use crate::net::Network;

pub use manifest::Manifest;

/// The offline agent for one deployed version.
///
/// Storage and network are injected, so the same agent runs against SQLite
/// and reqwest in the CLI and against in-memory fakes in tests.
pub struct OfflineAgent<S: CacheStorage, N: Network> {
  scope: Url,
  manifest: Arc<Manifest>,
  storage: Arc<S>,
  network: Arc<N>,
}

impl<S: CacheStorage + 'static, N: Network> OfflineAgent<S, N> {
  pub fn new(scope: Url, manifest: Manifest, storage: Arc<S>, network: Arc<N>) -> Self {
    Self {
      scope,
      manifest: Arc::new(manifest),
      storage,
      network,
    }
  }

  pub fn manifest(&self) -> &Manifest {
    &self.manifest
  }

  fn resolve(&self, path: &str) -> Result<Url, AgentError> {
    manifest::resolve(&self.scope, path).map_err(|e| AgentError::AssetPath {
      path: path.to_string(),
      reason: e.to_string(),
    })
  }

  /// Fetch every asset and store them all in the current bucket.
  ///
  /// All-or-nothing: one failed fetch or non-ok status stores nothing.
  pub async fn precache(&self) -> Result<usize, AgentError> {
    let cache_name = self.manifest.cache_name();
    let requests = self
      .manifest
      .assets
      .iter()
      .map(|path| self.resolve(path).map(Request::get))
      .collect::<Result<Vec<_>, _>>()?;

    let entries = try_join_all(requests.into_iter().map(|request| async move {
      let response = self
        .network
        .fetch(&request)
        .await
        .map_err(|source| AgentError::PrecacheFetch {
          url: request.url.to_string(),
          source,
        })?;
      if !response.ok() {
        return Err(AgentError::PrecacheStatus {
          url: request.url.to_string(),
          status: response.status,
        });
      }
      Ok((request, response))
    }))
    .await?;

    // put_all creates the bucket with its entries, so a failed install
    // leaves no bucket behind
    self.storage.put_all(&cache_name, &entries)?;
    Ok(entries.len())
  }

  /// Delete every bucket of an older or newer version of this agent.
  ///
  /// Buckets without our prefix belong to someone else and are left alone.
  pub fn delete_stale_caches(&self) -> Result<Vec<String>, AgentError> {
    let stale: Vec<String> = self
      .storage
      .keys()?
      .into_iter()
      .filter(|name| self.manifest.is_stale(name))
      .collect();

    for name in &stale {
      self
        .storage
        .delete(name)
        .map_err(|e| AgentError::Cleanup {
          name: name.clone(),
          reason: e.to_string(),
        })?;
      info!(cache = %name, "deleted stale cache");
    }

    Ok(stale)
  }

  /// Store a response in the current bucket if it is eligible.
  ///
  /// Returns whether the response was stored.
  pub fn store(&self, request: &Request, response: &Response) -> Result<bool> {
    if !request.is_get() || !response.is_storable() {
      debug!(
        url = %request.url,
        status = response.status,
        kind = response.response_type.as_str(),
        "response not cacheable"
      );
      return Ok(false);
    }
    self
      .storage
      .put(&self.manifest.cache_name(), request, response)?;
    Ok(true)
  }

  /// Fetch a request from the network and store the result.
  pub async fn fetch_and_store(&self, request: &Request) -> Result<bool> {
    let response = self
      .network
      .fetch(request)
      .await
      .map_err(|e| eyre!("Refresh of {} failed: {}", request.url, e))?;
    self.store(request, &response)
  }

  /// Refresh an entry in the background. Failures leave the old entry.
  async fn refresh(self, request: Request) {
    match self.fetch_and_store(&request).await {
      Ok(stored) => debug!(url = %request.url, stored, "background refresh finished"),
      Err(e) => debug!(url = %request.url, error = %e, "background refresh failed"),
    }
  }

  fn lookup(&self, request: &Request) -> Result<Option<Response>> {
    Ok(
      self
        .storage
        .match_request(&self.manifest.cache_name(), request)?
        .map(|cached| cached.response),
    )
  }

  fn fallback(&self) -> Option<Response> {
    let url = self.resolve(&self.manifest.fallback).ok()?;
    match self.lookup(&Request::get(url)) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(error = %e, "fallback lookup failed");
        None
      }
    }
  }

  /// Cache-first answer for a GET request.
  ///
  /// A failed cache read fails the load; it never turns into a network fetch.
  async fn respond(&self, event: &FetchEvent) -> Option<Response> {
    let request = event.request();

    match self.lookup(request) {
      Ok(Some(cached)) => {
        debug!(url = %request.url, "cache hit");
        event.wait_until(self.clone().refresh(request.clone()));
        return Some(cached);
      }
      Ok(None) => {}
      Err(e) => {
        warn!(url = %request.url, error = %e, "cache lookup failed");
        return None;
      }
    }

    debug!(url = %request.url, "cache miss");
    match self.network.fetch(request).await {
      Ok(response) => {
        if let Err(e) = self.store(request, &response) {
          warn!(url = %request.url, error = %e, "failed to cache response");
        }
        Some(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "network failed, serving fallback");
        self.fallback()
      }
    }
  }
}

impl<S: CacheStorage, N: Network> Clone for OfflineAgent<S, N> {
  fn clone(&self) -> Self {
    Self {
      scope: self.scope.clone(),
      manifest: Arc::clone(&self.manifest),
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
    }
  }
}

#[async_trait]
impl<S: CacheStorage + 'static, N: Network> Worker for OfflineAgent<S, N> {
  fn version(&self) -> &str {
    &self.manifest.version
  }

  async fn install(&self, scope: &WorkerScope) -> Result<(), AgentError> {
    let count = self.precache().await?;
    info!(cache = %self.manifest.cache_name(), count, "pre-cached assets");
    scope.skip_waiting();
    Ok(())
  }

  async fn activate(&self, scope: &WorkerScope) -> Result<(), AgentError> {
    self.delete_stale_caches()?;
    scope.claim_clients();
    Ok(())
  }

  async fn fetch(&self, event: &FetchEvent) -> Disposition {
    if !event.request().is_get() {
      return Disposition::PassThrough;
    }
    Disposition::Respond(self.respond(event).await)
  }
}
