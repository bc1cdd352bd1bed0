//! Cache bucket storage trait with SQLite and in-memory implementations.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
#[cfg(test)]
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use url::Url;

use super::traits::{CachedEntry, CachedResponse, Request, Response, ResponseType};

/// Trait for cache bucket storage backends.
///
/// A backend holds any number of named buckets. Each bucket maps a request
/// identity to the last response stored for it. Individual calls are atomic,
/// so concurrent writers touching different keys never interfere.
pub trait CacheStorage: Send + Sync {
  /// Create the bucket if it does not exist yet.
  fn open(&self, name: &str) -> Result<()>;

  /// Whether a bucket with this name exists.
  fn has(&self, name: &str) -> Result<bool>;

  /// Names of all buckets, oldest first.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a bucket and everything in it. Returns false if it did not exist.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Look up the stored response for a request. Only GET requests can match.
  fn match_request(&self, name: &str, request: &Request) -> Result<Option<CachedResponse>>;

  /// Store a response, replacing any previous entry for the same request.
  fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()>;

  /// Store several responses at once. Either all of them land or none do.
  fn put_all(&self, name: &str, entries: &[(Request, Response)]) -> Result<()>;

  /// List the entries of a bucket, ordered by URL.
  fn entries(&self, name: &str) -> Result<Vec<CachedEntry>>;
}

fn ensure_get(request: &Request) -> Result<()> {
  if request.is_get() {
    Ok(())
  } else {
    Err(eyre!(
      "Refusing to cache {} request for {}: only GET is cacheable",
      request.method,
      request.url
    ))
  }
}

// ============================================================================
// In-memory storage
// ============================================================================

#[cfg(test)]
#[derive(Default)]
struct MemoryBucket {
  name: String,
  entries: HashMap<String, CachedResponse>,
}

/// Storage that keeps every bucket in process memory.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStorage {
  buckets: Mutex<Vec<MemoryBucket>>,
}

#[cfg(test)]
impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, Vec<MemoryBucket>>> {
    self
      .buckets
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

#[cfg(test)]
fn bucket_mut<'a>(buckets: &'a mut Vec<MemoryBucket>, name: &str) -> &'a mut MemoryBucket {
  let idx = match buckets.iter().position(|b| b.name == name) {
    Some(idx) => idx,
    None => {
      buckets.push(MemoryBucket {
        name: name.to_string(),
        entries: HashMap::new(),
      });
      buckets.len() - 1
    }
  };
  &mut buckets[idx]
}

#[cfg(test)]
impl CacheStorage for MemoryStorage {
  fn open(&self, name: &str) -> Result<()> {
    let mut buckets = self.lock()?;
    bucket_mut(&mut buckets, name);
    Ok(())
  }

  fn has(&self, name: &str) -> Result<bool> {
    Ok(self.lock()?.iter().any(|b| b.name == name))
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.iter().map(|b| b.name.clone()).collect())
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut buckets = self.lock()?;
    let before = buckets.len();
    buckets.retain(|b| b.name != name);
    Ok(buckets.len() != before)
  }

  fn match_request(&self, name: &str, request: &Request) -> Result<Option<CachedResponse>> {
    if !request.is_get() {
      return Ok(None);
    }
    let buckets = self.lock()?;
    Ok(
      buckets
        .iter()
        .find(|b| b.name == name)
        .and_then(|b| b.entries.get(&request.cache_key()))
        .cloned(),
    )
  }

  fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()> {
    ensure_get(request)?;
    let mut buckets = self.lock()?;
    bucket_mut(&mut buckets, name).entries.insert(
      request.cache_key(),
      CachedResponse {
        response: response.clone(),
        cached_at: Utc::now(),
      },
    );
    Ok(())
  }

  fn put_all(&self, name: &str, entries: &[(Request, Response)]) -> Result<()> {
    for (request, _) in entries {
      ensure_get(request)?;
    }
    let mut buckets = self.lock()?;
    let bucket = bucket_mut(&mut buckets, name);
    let now = Utc::now();
    for (request, response) in entries {
      bucket.entries.insert(
        request.cache_key(),
        CachedResponse {
          response: response.clone(),
          cached_at: now,
        },
      );
    }
    Ok(())
  }

  fn entries(&self, name: &str) -> Result<Vec<CachedEntry>> {
    let buckets = self.lock()?;
    let mut entries: Vec<CachedEntry> = buckets
      .iter()
      .find(|b| b.name == name)
      .map(|b| {
        b.entries
          .values()
          .map(|c| CachedEntry {
            url: c.response.url.to_string(),
            status: c.response.status,
            cached_at: c.cached_at,
          })
          .collect()
      })
      .unwrap_or_default();
    entries.sort_by(|a, b| a.url.cmp(&b.url));
    Ok(entries)
  }
}

// ============================================================================
// SQLite storage
// ============================================================================

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the database at the given path, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
      }
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  #[allow(dead_code)]
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("brewcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Named buckets, one per agent version
CREATE TABLE IF NOT EXISTS cache_buckets (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses keyed by request identity
CREATE TABLE IF NOT EXISTS cache_entries (
    bucket TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    response_type TEXT NOT NULL,
    headers BLOB NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket, request_key),
    FOREIGN KEY (bucket) REFERENCES cache_buckets(name) ON DELETE CASCADE
);
"#;

fn insert_bucket(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_buckets (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to open cache bucket {}: {}", name, e))?;
  Ok(())
}

fn insert_entry(conn: &Connection, name: &str, request: &Request, response: &Response) -> Result<()> {
  let headers = serde_json::to_vec(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (bucket, request_key, url, status, response_type, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        name,
        request.cache_key(),
        response.url.as_str(),
        response.status,
        response.response_type.as_str(),
        headers,
        response.body.as_ref(),
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", request.url, name, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    insert_bucket(&conn, name)
  }

  fn has(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM cache_buckets WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache bucket {}: {}", name, e))?;
    Ok(found.is_some())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_buckets ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache bucket name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE bucket = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM cache_buckets WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache bucket {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_request(&self, name: &str, request: &Request) -> Result<Option<CachedResponse>> {
    if !request.is_get() {
      return Ok(None);
    }

    let conn = self.lock()?;
    let row: Option<(String, u16, String, Vec<u8>, Vec<u8>, String)> = conn
      .query_row(
        "SELECT url, status, response_type, headers, body, cached_at FROM cache_entries
         WHERE bucket = ? AND request_key = ?",
        params![name, request.cache_key()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to match {} in {}: {}", request.url, name, e))?;

    let Some((url, status, response_type, headers, body, cached_at)) = row else {
      return Ok(None);
    };

    let url = Url::parse(&url).map_err(|e| eyre!("Corrupt cached URL '{}': {}", url, e))?;
    let headers: Vec<(String, String)> = serde_json::from_slice(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
    let response_type = ResponseType::parse(&response_type)
      .ok_or_else(|| eyre!("Unknown response type '{}'", response_type))?;

    Ok(Some(CachedResponse {
      response: Response {
        url,
        status,
        headers,
        body: Bytes::from(body),
        response_type,
      },
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()> {
    ensure_get(request)?;
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    insert_bucket(&tx, name)?;
    insert_entry(&tx, name, request, response)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn put_all(&self, name: &str, entries: &[(Request, Response)]) -> Result<()> {
    for (request, _) in entries {
      ensure_get(request)?;
    }

    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    insert_bucket(&tx, name)?;
    for (request, response) in entries {
      insert_entry(&tx, name, request, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn entries(&self, name: &str) -> Result<Vec<CachedEntry>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT url, status, cached_at FROM cache_entries
         WHERE bucket = ?
         ORDER BY url",
      )
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    let rows = stmt
      .query_map(params![name], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, u16>(1)?, row.get::<_, String>(2)?))
      })
      .map_err(|e| eyre!("Failed to query entries of {}: {}", name, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry of {}: {}", name, e))?;

    rows
      .into_iter()
      .map(|(url, status, cached_at)| {
        Ok(CachedEntry {
          url,
          status,
          cached_at: parse_datetime(&cached_at)?,
        })
      })
      .collect()
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::Method;
  use tempfile::TempDir;

  fn url(path: &str) -> Url {
    Url::parse("http://localhost:8080/").unwrap().join(path).unwrap()
  }

  fn ok_response(path: &str, body: &'static str) -> Response {
    Response {
      url: url(path),
      status: 200,
      headers: vec![("content-type".to_string(), "text/plain".to_string())],
      body: Bytes::from_static(body.as_bytes()),
      response_type: ResponseType::Basic,
    }
  }

  fn backends() -> Vec<(&'static str, Box<dyn CacheStorage>)> {
    vec![
      ("memory", Box::new(MemoryStorage::new())),
      ("sqlite", Box::new(SqliteStorage::in_memory().unwrap())),
    ]
  }

  #[test]
  fn test_open_is_idempotent_and_keys_keep_creation_order() {
    for (label, storage) in backends() {
      storage.open("brewcalc-v1").unwrap();
      storage.open("other-cache").unwrap();
      storage.open("brewcalc-v1").unwrap();

      assert_eq!(
        storage.keys().unwrap(),
        vec!["brewcalc-v1".to_string(), "other-cache".to_string()],
        "{label}"
      );
      assert!(storage.has("other-cache").unwrap(), "{label}");
      assert!(!storage.has("brewcalc-v2").unwrap(), "{label}");
    }
  }

  #[test]
  fn test_put_then_match_returns_stored_response() {
    for (label, storage) in backends() {
      let request = Request::get(url("app.css"));
      let response = ok_response("app.css", "body{}");
      storage.put("brewcalc-v1", &request, &response).unwrap();

      let cached = storage
        .match_request("brewcalc-v1", &request)
        .unwrap()
        .expect(label);
      assert_eq!(cached.response, response, "{label}");
      assert!(storage.has("brewcalc-v1").unwrap(), "{label}");
    }
  }

  #[test]
  fn test_put_overwrites_previous_entry() {
    for (label, storage) in backends() {
      let request = Request::get(url("app.css"));
      storage
        .put("brewcalc-v1", &request, &ok_response("app.css", "old"))
        .unwrap();
      storage
        .put("brewcalc-v1", &request, &ok_response("app.css", "new"))
        .unwrap();

      let cached = storage.match_request("brewcalc-v1", &request).unwrap().unwrap();
      assert_eq!(cached.response.body, Bytes::from_static(b"new"), "{label}");
      assert_eq!(storage.entries("brewcalc-v1").unwrap().len(), 1, "{label}");
    }
  }

  #[test]
  fn test_match_is_scoped_to_bucket() {
    for (label, storage) in backends() {
      let request = Request::get(url("app.css"));
      storage
        .put("brewcalc-v1", &request, &ok_response("app.css", "v1"))
        .unwrap();
      storage.open("brewcalc-v2").unwrap();

      assert!(storage.match_request("brewcalc-v2", &request).unwrap().is_none(), "{label}");
      assert!(storage.match_request("missing", &request).unwrap().is_none(), "{label}");
    }
  }

  #[test]
  fn test_non_get_requests_never_enter_or_leave() {
    for (label, storage) in backends() {
      let get = Request::get(url("form"));
      let post = Request::new(Method::POST, url("form"));
      let response = ok_response("form", "ok");

      assert!(storage.put("brewcalc-v1", &post, &response).is_err(), "{label}");
      assert!(
        storage
          .put_all("brewcalc-v1", &[(get.clone(), response.clone()), (post.clone(), response.clone())])
          .is_err(),
        "{label}"
      );
      assert!(storage.entries("brewcalc-v1").unwrap().is_empty(), "{label}");

      storage.put("brewcalc-v1", &get, &response).unwrap();
      assert!(storage.match_request("brewcalc-v1", &post).unwrap().is_none(), "{label}");
    }
  }

  #[test]
  fn test_delete_removes_bucket_and_entries() {
    for (label, storage) in backends() {
      let request = Request::get(url("index.html"));
      storage
        .put("brewcalc-v1", &request, &ok_response("index.html", "<html>"))
        .unwrap();

      assert!(storage.delete("brewcalc-v1").unwrap(), "{label}");
      assert!(!storage.delete("brewcalc-v1").unwrap(), "{label}");
      assert!(!storage.has("brewcalc-v1").unwrap(), "{label}");
      assert!(storage.entries("brewcalc-v1").unwrap().is_empty(), "{label}");

      // Re-creating the bucket must not resurrect old entries
      storage.open("brewcalc-v1").unwrap();
      assert!(storage.match_request("brewcalc-v1", &request).unwrap().is_none(), "{label}");
    }
  }

  #[test]
  fn test_entries_sorted_by_url() {
    for (label, storage) in backends() {
      let batch = vec![
        (Request::get(url("js/calculator.js")), ok_response("js/calculator.js", "js")),
        (Request::get(url("index.html")), ok_response("index.html", "html")),
        (Request::get(url("css/calculator.css")), ok_response("css/calculator.css", "css")),
      ];
      storage.put_all("brewcalc-v1", &batch).unwrap();

      let urls: Vec<String> = storage
        .entries("brewcalc-v1")
        .unwrap()
        .into_iter()
        .map(|e| e.url)
        .collect();
      assert_eq!(
        urls,
        vec![
          "http://localhost:8080/css/calculator.css".to_string(),
          "http://localhost:8080/index.html".to_string(),
          "http://localhost:8080/js/calculator.js".to_string(),
        ],
        "{label}"
      );
    }
  }

  #[test]
  fn test_sqlite_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    let request = Request::get(url("index.html"));

    {
      let storage = SqliteStorage::open(Some(&path)).unwrap();
      storage
        .put("brewcalc-v1", &request, &ok_response("index.html", "<html>"))
        .unwrap();
    }

    let storage = SqliteStorage::open(Some(&path)).unwrap();
    assert_eq!(storage.keys().unwrap(), vec!["brewcalc-v1".to_string()]);
    let cached = storage.match_request("brewcalc-v1", &request).unwrap().unwrap();
    assert_eq!(cached.response.body, Bytes::from_static(b"<html>"));
    assert_eq!(cached.response.header("Content-Type"), Some("text/plain"));
  }

  #[test]
  fn test_parse_datetime() {
    let dt = parse_datetime("2024-01-15 10:30:00").unwrap();
    assert_eq!(dt.to_rfc3339(), "2024-01-15T10:30:00+00:00");
    assert!(parse_datetime("yesterday").is_err());
  }
}
