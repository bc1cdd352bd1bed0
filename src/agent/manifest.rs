//! Build-time configuration of the offline agent.

use url::Url;

/// Prefix shared by every bucket this agent has ever created.
pub const CACHE_PREFIX: &str = "brewcalc";

/// Bump when the asset list changes.
pub const CACHE_VERSION: &str = "v1";

/// Resources needed to run the app offline, relative to the worker scope.
pub const OFFLINE_ASSETS: &[&str] = &[
  "./index.html",
  "./manifest.json",
  "./service-worker.js",
  "./css/calculator.css",
  "./js/calculator.js",
  "./icons/icon-192.png",
  "./icons/icon-512.png",
];

/// Served when a request misses the cache and the network is down.
pub const FALLBACK_PATH: &str = "./index.html";

/// Versioned asset manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
  pub prefix: String,
  pub version: String,
  pub assets: Vec<String>,
  pub fallback: String,
}

impl Default for Manifest {
  fn default() -> Self {
    Self {
      prefix: CACHE_PREFIX.to_string(),
      version: CACHE_VERSION.to_string(),
      assets: OFFLINE_ASSETS.iter().map(|s| s.to_string()).collect(),
      fallback: FALLBACK_PATH.to_string(),
    }
  }
}

impl Manifest {
  /// Name of the bucket for this version: `<prefix>-<version>`.
  pub fn cache_name(&self) -> String {
    format!("{}-{}", self.prefix, self.version)
  }

  /// Whether a bucket belongs to this agent (any version).
  pub fn owns(&self, cache_name: &str) -> bool {
    cache_name
      .strip_prefix(self.prefix.as_str())
      .is_some_and(|rest| rest.starts_with('-'))
  }

  /// Whether a bucket belongs to this agent but to another version.
  pub fn is_stale(&self, cache_name: &str) -> bool {
    self.owns(cache_name) && cache_name != self.cache_name()
  }
}

/// Resolve a manifest path against the worker scope.
pub fn resolve(scope: &Url, path: &str) -> Result<Url, url::ParseError> {
  scope.join(path)
}
