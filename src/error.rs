//! Error types for worker lifecycle events.

use thiserror::Error;

use crate::net::NetworkError;

/// Errors that fail an install or activate event.
#[derive(Error, Debug)]
pub enum AgentError {
  /// An asset could not be fetched while pre-caching.
  #[error("Pre-cache failed for {url}: {source}")]
  PrecacheFetch {
    url: String,
    #[source]
    source: NetworkError,
  },

  /// An asset answered with a non-ok status while pre-caching.
  #[error("Pre-cache failed for {url}: status {status}")]
  PrecacheStatus { url: String, status: u16 },

  /// An asset path could not be resolved against the worker scope.
  #[error("Invalid asset path {path}: {reason}")]
  AssetPath { path: String, reason: String },

  /// A stale bucket could not be deleted during activation.
  #[error("Failed to delete stale cache {name}: {reason}")]
  Cleanup { name: String, reason: String },

  /// The cache store failed.
  #[error("Cache storage error: {0}")]
  Storage(String),
}

impl From<color_eyre::Report> for AgentError {
  fn from(report: color_eyre::Report) -> Self {
    AgentError::Storage(report.to_string())
  }
}

/// Errors reported by the host runtime.
#[derive(Error, Debug)]
pub enum HostError {
  /// The install event failed; the worker is redundant.
  #[error("Install of worker {version} failed: {source}")]
  InstallFailed {
    version: String,
    #[source]
    source: AgentError,
  },

  /// The activate event failed; the worker is redundant.
  #[error("Activation of worker {version} failed: {source}")]
  ActivateFailed {
    version: String,
    #[source]
    source: AgentError,
  },

  /// There is no installed worker waiting to activate.
  #[error("No worker is waiting to activate")]
  NothingWaiting,

  /// The worker answered a fetch with no response.
  #[error("Failed to load {0}")]
  LoadFailed(String),

  /// A passthrough fetch failed at the network.
  #[error(transparent)]
  Network(#[from] NetworkError),
}
