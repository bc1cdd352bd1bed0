//! Client pages and the scope handle a worker sees during lifecycle events.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

/// Identifier of an open client page.
pub type ClientId = u64;

#[derive(Default)]
struct ClientsInner {
  next_id: ClientId,
  /// Controlling worker version per open client
  controllers: BTreeMap<ClientId, Option<String>>,
}

/// The set of open client pages and which worker controls each.
#[derive(Clone, Default)]
pub struct Clients {
  inner: Arc<Mutex<ClientsInner>>,
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, ClientsInner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Open a client, optionally already controlled by a worker version.
  pub fn open(&self, controller: Option<String>) -> ClientId {
    let mut inner = self.lock();
    inner.next_id += 1;
    let id = inner.next_id;
    inner.controllers.insert(id, controller);
    id
  }

  #[allow(dead_code)]
  pub fn close(&self, id: ClientId) {
    self.lock().controllers.remove(&id);
  }

  /// The worker version controlling a client, if any.
  pub fn controller(&self, id: ClientId) -> Option<String> {
    self.lock().controllers.get(&id).cloned().flatten()
  }

  /// Number of open clients controlled by the given version.
  pub fn controlled_by(&self, version: &str) -> usize {
    self
      .lock()
      .controllers
      .values()
      .filter(|c| c.as_deref() == Some(version))
      .count()
  }

  /// Make `version` the controller of every open client.
  pub fn claim(&self, version: &str) -> usize {
    let mut inner = self.lock();
    for controller in inner.controllers.values_mut() {
      *controller = Some(version.to_string());
    }
    let claimed = inner.controllers.len();
    info!(version, claimed, "claimed clients");
    claimed
  }
}

/// What a worker may ask of the host while handling a lifecycle event.
#[derive(Clone)]
pub struct WorkerScope {
  version: String,
  skip_waiting: Arc<AtomicBool>,
  clients: Clients,
}

impl WorkerScope {
  pub fn new(version: impl Into<String>, clients: Clients) -> Self {
    Self {
      version: version.into(),
      skip_waiting: Arc::new(AtomicBool::new(false)),
      clients,
    }
  }

  /// Activate as soon as installed instead of waiting for old clients to go.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  /// Take control of every open client.
  pub fn claim_clients(&self) -> usize {
    self.clients.claim(&self.version)
  }
}
