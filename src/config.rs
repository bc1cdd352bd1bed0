use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::agent::Manifest;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// URL the worker controls; manifest paths resolve against it
  pub scope: String,
  /// Cache database path (default: $XDG_DATA_HOME/brewcache/cache.db)
  pub database: Option<PathBuf>,
  /// Directory for daily rolling log files; stderr only when unset
  pub log_dir: Option<PathBuf>,
  pub manifest: ManifestOverride,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      scope: "http://localhost:8080/".to_string(),
      database: None,
      log_dir: None,
      manifest: ManifestOverride::default(),
    }
  }
}

/// Development overrides for the built-in manifest.
///
/// The bucket prefix is fixed; only the version, the asset list and the
/// fallback path can change.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestOverride {
  pub version: Option<String>,
  pub assets: Option<Vec<String>>,
  pub fallback: Option<String>,
}

impl ManifestOverride {
  pub fn apply(&self, manifest: Manifest) -> Manifest {
    Manifest {
      version: self.version.clone().unwrap_or(manifest.version),
      assets: self.assets.clone().unwrap_or(manifest.assets),
      fallback: self.fallback.clone().unwrap_or(manifest.fallback),
      ..manifest
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./brewcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/brewcache/config.yaml
  ///
  /// Without any file the defaults apply.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("brewcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("brewcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file deserializes to null rather than an empty mapping
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  /// The scope as a URL, always ending in `/` so relative paths land inside it.
  pub fn scope_url(&self) -> Result<Url> {
    let mut url =
      Url::parse(&self.scope).map_err(|e| eyre!("Invalid scope URL '{}': {}", self.scope, e))?;
    if !url.path().ends_with('/') {
      let path = format!("{}/", url.path());
      url.set_path(&path);
    }
    Ok(url)
  }

  pub fn manifest(&self) -> Manifest {
    self.manifest.apply(Manifest::default())
  }
}
