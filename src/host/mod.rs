//! Host runtime that drives worker lifecycles and dispatches fetches.
//!
//! The host owns everything a browser would: the registration (which worker
//! is active, which one is waiting), the open clients, and the default network
//! fetch used when a worker declines a request. A worker only supplies the
//! work for install and activate and the interception logic for fetch.

mod clients;
mod event;

pub use clients::{ClientId, Clients, WorkerScope};
pub use event::{Disposition, Extensions, FetchEvent};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

use crate::cache::{Request, Response};
use crate::error::{AgentError, HostError};
use crate::net::Network;

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Install event in progress
  Installing,
  /// Installed, waiting for the previous worker's clients to go away
  Installed,
  /// Activate event in progress
  Activating,
  /// Active and intercepting fetches
  Activated,
  /// Failed or superseded
  Redundant,
}

impl std::fmt::Display for WorkerState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      WorkerState::Installing => write!(f, "installing"),
      WorkerState::Installed => write!(f, "installed"),
      WorkerState::Activating => write!(f, "activating"),
      WorkerState::Activated => write!(f, "activated"),
      WorkerState::Redundant => write!(f, "redundant"),
    }
  }
}

/// Registration points a worker exposes to the host.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
  /// Version tag identifying this worker.
  fn version(&self) -> &str;

  /// Work to finish before the worker counts as installed.
  async fn install(&self, scope: &WorkerScope) -> Result<(), AgentError>;

  /// Work to finish before the worker counts as active.
  async fn activate(&self, scope: &WorkerScope) -> Result<(), AgentError>;

  /// Intercept a request from a controlled client.
  async fn fetch(&self, event: &FetchEvent) -> Disposition;
}

#[derive(Default)]
struct Registration {
  active: Option<Arc<dyn Worker>>,
  waiting: Option<Arc<dyn Worker>>,
  states: HashMap<String, WorkerState>,
}

impl Registration {
  fn set_state(&mut self, version: &str, state: WorkerState) {
    info!(version, %state, "worker state changed");
    self.states.insert(version.to_string(), state);
  }
}

/// A single-scope host runtime.
pub struct ServiceHost<N: Network> {
  network: Arc<N>,
  clients: Clients,
  extensions: Extensions,
  registration: Mutex<Registration>,
}

impl<N: Network> ServiceHost<N> {
  pub fn new(network: Arc<N>) -> Self {
    Self {
      network,
      clients: Clients::new(),
      extensions: Extensions::new(),
      registration: Mutex::new(Registration::default()),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Registration> {
    self
      .registration
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Lifecycle state of a worker version, if it was ever seen.
  #[allow(dead_code)]
  pub fn state(&self, version: &str) -> Option<WorkerState> {
    self.lock().states.get(version).copied()
  }

  pub fn active_version(&self) -> Option<String> {
    self.lock().active.as_ref().map(|w| w.version().to_string())
  }

  #[allow(dead_code)]
  pub fn waiting_version(&self) -> Option<String> {
    self.lock().waiting.as_ref().map(|w| w.version().to_string())
  }

  /// Open a client page. It is controlled by the active worker, if any.
  pub fn open_client(&self) -> ClientId {
    self.clients.open(self.active_version())
  }

  #[allow(dead_code)]
  pub fn clients(&self) -> &Clients {
    &self.clients
  }

  /// Install a worker and activate it when nothing holds it back.
  ///
  /// Returns the state the worker ends up in: `Activated`, or `Installed` if
  /// it has to wait for the current worker's clients.
  pub async fn register(&self, worker: Arc<dyn Worker>) -> Result<WorkerState, HostError> {
    let version = worker.version().to_string();
    let scope = WorkerScope::new(version.clone(), self.clients.clone());

    self.lock().set_state(&version, WorkerState::Installing);
    if let Err(source) = worker.install(&scope).await {
      warn!(%version, error = %source, "install failed");
      self.lock().set_state(&version, WorkerState::Redundant);
      return Err(HostError::InstallFailed { version, source });
    }

    let must_wait = {
      let mut reg = self.lock();
      if let Some(previous) = reg.waiting.replace(Arc::clone(&worker)) {
        let previous = previous.version().to_string();
        if previous != version {
          reg.set_state(&previous, WorkerState::Redundant);
        }
      }
      reg.set_state(&version, WorkerState::Installed);

      let active_in_use = reg
        .active
        .as_ref()
        .map(|active| self.clients.controlled_by(active.version()) > 0)
        .unwrap_or(false);
      active_in_use && !scope.skip_waiting_requested()
    };

    if must_wait {
      info!(%version, "waiting for clients of the active worker");
      return Ok(WorkerState::Installed);
    }

    self.activate_waiting().await?;
    Ok(WorkerState::Activated)
  }

  /// Adopt a worker installed in an earlier session as waiting.
  pub fn restore_installed(&self, worker: Arc<dyn Worker>) {
    let mut reg = self.lock();
    reg.set_state(worker.version(), WorkerState::Installed);
    reg.waiting = Some(worker);
  }

  /// Adopt a worker activated in an earlier session as active.
  pub fn resume(&self, worker: Arc<dyn Worker>) {
    let mut reg = self.lock();
    reg.set_state(worker.version(), WorkerState::Activated);
    reg.active = Some(worker);
  }

  /// Activate the waiting worker, superseding the active one.
  pub async fn activate_waiting(&self) -> Result<(), HostError> {
    let worker = {
      let mut reg = self.lock();
      let worker = reg.waiting.take().ok_or(HostError::NothingWaiting)?;
      reg.set_state(worker.version(), WorkerState::Activating);
      worker
    };

    let version = worker.version().to_string();
    let scope = WorkerScope::new(version.clone(), self.clients.clone());

    if let Err(source) = worker.activate(&scope).await {
      warn!(%version, error = %source, "activate failed");
      self.lock().set_state(&version, WorkerState::Redundant);
      return Err(HostError::ActivateFailed { version, source });
    }

    let mut reg = self.lock();
    if let Some(previous) = reg.active.replace(worker) {
      let previous = previous.version().to_string();
      if previous != version {
        reg.set_state(&previous, WorkerState::Redundant);
      }
    }
    reg.set_state(&version, WorkerState::Activated);
    Ok(())
  }

  /// Load a resource for a client.
  ///
  /// Requests from clients the active worker controls go through the worker;
  /// everything else goes straight to the network.
  pub async fn fetch(&self, client: ClientId, request: Request) -> Result<Response, HostError> {
    let worker = {
      let reg = self.lock();
      match (&reg.active, self.clients.controller(client)) {
        (Some(active), Some(controller)) if active.version() == controller => {
          Some(Arc::clone(active))
        }
        _ => None,
      }
    };

    let Some(worker) = worker else {
      return Ok(self.network.fetch(&request).await?);
    };

    let event = FetchEvent::new(request, self.extensions.clone());
    match worker.fetch(&event).await {
      Disposition::PassThrough => Ok(self.network.fetch(event.request()).await?),
      Disposition::Respond(Some(response)) => Ok(response),
      Disposition::Respond(None) => Err(HostError::LoadFailed(event.request().url.to_string())),
    }
  }

  /// Wait for all work extended past its event, such as background refreshes.
  pub async fn settle(&self) {
    self.extensions.settle().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ResponseType;
  use crate::net::NetworkError;
  use bytes::Bytes;
  use reqwest::Method;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::{OnceLock, Weak};
  use url::Url;

  /// Network that answers every request with a fixed body.
  struct EchoNetwork {
    calls: AtomicUsize,
  }

  impl EchoNetwork {
    fn new() -> Self {
      Self {
        calls: AtomicUsize::new(0),
      }
    }
  }

  #[async_trait]
  impl Network for EchoNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(response(&request.url, "network"))
    }
  }

  fn response(url: &Url, body: &'static str) -> Response {
    Response {
      url: url.clone(),
      status: 200,
      headers: Vec::new(),
      body: Bytes::from_static(body.as_bytes()),
      response_type: ResponseType::Basic,
    }
  }

  /// Worker with scripted lifecycle behavior.
  struct ScriptedWorker {
    version: String,
    fail_install: bool,
    fail_activate: bool,
    skip_waiting: bool,
    claim: bool,
    answer: Disposition,
  }

  impl ScriptedWorker {
    fn new(version: &str) -> Self {
      Self {
        version: version.to_string(),
        fail_install: false,
        fail_activate: false,
        skip_waiting: false,
        claim: true,
        answer: Disposition::PassThrough,
      }
    }
  }

  #[async_trait]
  impl Worker for ScriptedWorker {
    fn version(&self) -> &str {
      &self.version
    }

    async fn install(&self, scope: &WorkerScope) -> Result<(), AgentError> {
      if self.fail_install {
        return Err(AgentError::PrecacheStatus {
          url: "http://localhost/index.html".to_string(),
          status: 500,
        });
      }
      if self.skip_waiting {
        scope.skip_waiting();
      }
      Ok(())
    }

    async fn activate(&self, scope: &WorkerScope) -> Result<(), AgentError> {
      if self.fail_activate {
        return Err(AgentError::Cleanup {
          name: "brewcalc-v0".to_string(),
          reason: "locked".to_string(),
        });
      }
      if self.claim {
        scope.claim_clients();
      }
      Ok(())
    }

    async fn fetch(&self, _event: &FetchEvent) -> Disposition {
      self.answer.clone()
    }
  }

  fn host() -> ServiceHost<EchoNetwork> {
    ServiceHost::new(Arc::new(EchoNetwork::new()))
  }

  fn get(path: &str) -> Request {
    Request::get(Url::parse("http://localhost/").unwrap().join(path).unwrap())
  }

  #[tokio::test]
  async fn test_first_worker_activates_immediately() {
    let host = host();
    let state = host
      .register(Arc::new(ScriptedWorker::new("v1")))
      .await
      .unwrap();

    assert_eq!(state, WorkerState::Activated);
    assert_eq!(host.active_version(), Some("v1".to_string()));
    assert_eq!(host.waiting_version(), None);
    assert_eq!(host.state("v1"), Some(WorkerState::Activated));
  }

  /// Worker that records the state the host reports while its events run.
  struct ObservingWorker {
    host: OnceLock<Weak<ServiceHost<EchoNetwork>>>,
    seen: Mutex<Vec<Option<WorkerState>>>,
  }

  impl ObservingWorker {
    fn record(&self) {
      let state = self
        .host
        .get()
        .and_then(Weak::upgrade)
        .and_then(|host| host.state("v1"));
      self.seen.lock().unwrap().push(state);
    }
  }

  #[async_trait]
  impl Worker for ObservingWorker {
    fn version(&self) -> &str {
      "v1"
    }

    async fn install(&self, _scope: &WorkerScope) -> Result<(), AgentError> {
      self.record();
      Ok(())
    }

    async fn activate(&self, _scope: &WorkerScope) -> Result<(), AgentError> {
      self.record();
      Ok(())
    }

    async fn fetch(&self, _event: &FetchEvent) -> Disposition {
      Disposition::PassThrough
    }
  }

  #[tokio::test]
  async fn test_lifecycle_starts_at_installing() {
    let host = Arc::new(host());
    let worker = Arc::new(ObservingWorker {
      host: OnceLock::new(),
      seen: Mutex::new(Vec::new()),
    });
    assert!(worker.host.set(Arc::downgrade(&host)).is_ok());
    assert_eq!(host.state("v1"), None);

    host.register(Arc::clone(&worker) as Arc<dyn Worker>).await.unwrap();

    assert_eq!(
      *worker.seen.lock().unwrap(),
      vec![Some(WorkerState::Installing), Some(WorkerState::Activating)]
    );
    assert_eq!(host.state("v1"), Some(WorkerState::Activated));
  }

  #[tokio::test]
  async fn test_failed_install_is_redundant() {
    let host = host();
    let mut worker = ScriptedWorker::new("v1");
    worker.fail_install = true;

    let err = host.register(Arc::new(worker)).await.unwrap_err();
    assert!(matches!(err, HostError::InstallFailed { .. }));
    assert_eq!(host.state("v1"), Some(WorkerState::Redundant));
    assert_eq!(host.active_version(), None);
  }

  #[tokio::test]
  async fn test_new_version_waits_while_clients_are_controlled() {
    let host = host();
    host
      .register(Arc::new(ScriptedWorker::new("v1")))
      .await
      .unwrap();
    let client = host.open_client();
    assert_eq!(host.clients().controller(client), Some("v1".to_string()));

    let state = host
      .register(Arc::new(ScriptedWorker::new("v2")))
      .await
      .unwrap();
    assert_eq!(state, WorkerState::Installed);
    assert_eq!(host.waiting_version(), Some("v2".to_string()));
    assert_eq!(host.active_version(), Some("v1".to_string()));

    host.activate_waiting().await.unwrap();
    assert_eq!(host.active_version(), Some("v2".to_string()));
    assert_eq!(host.state("v1"), Some(WorkerState::Redundant));
    assert_eq!(host.clients().controller(client), Some("v2".to_string()));
  }

  #[tokio::test]
  async fn test_skip_waiting_activates_despite_clients() {
    let host = host();
    host
      .register(Arc::new(ScriptedWorker::new("v1")))
      .await
      .unwrap();
    let client = host.open_client();

    let mut v2 = ScriptedWorker::new("v2");
    v2.skip_waiting = true;
    let state = host.register(Arc::new(v2)).await.unwrap();

    assert_eq!(state, WorkerState::Activated);
    assert_eq!(host.state("v1"), Some(WorkerState::Redundant));
    assert_eq!(host.clients().controller(client), Some("v2".to_string()));
  }

  #[tokio::test]
  async fn test_failed_activation_keeps_previous_worker() {
    let host = host();
    host
      .register(Arc::new(ScriptedWorker::new("v1")))
      .await
      .unwrap();

    let mut v2 = ScriptedWorker::new("v2");
    v2.fail_activate = true;
    let err = host.register(Arc::new(v2)).await.unwrap_err();

    assert!(matches!(err, HostError::ActivateFailed { .. }));
    assert_eq!(host.state("v2"), Some(WorkerState::Redundant));
    assert_eq!(host.active_version(), Some("v1".to_string()));
  }

  #[tokio::test]
  async fn test_activate_without_waiting_worker() {
    let host = host();
    assert!(matches!(
      host.activate_waiting().await,
      Err(HostError::NothingWaiting)
    ));
  }

  #[tokio::test]
  async fn test_restore_installed_then_activate() {
    let host = host();
    host.restore_installed(Arc::new(ScriptedWorker::new("v3")));
    assert_eq!(host.state("v3"), Some(WorkerState::Installed));

    host.activate_waiting().await.unwrap();
    assert_eq!(host.active_version(), Some("v3".to_string()));
  }

  #[tokio::test]
  async fn test_uncontrolled_client_goes_to_network() {
    let network = Arc::new(EchoNetwork::new());
    let host = ServiceHost::new(Arc::clone(&network));
    let client = host.open_client();

    let mut worker = ScriptedWorker::new("v1");
    worker.claim = false;
    worker.answer = Disposition::Respond(None);
    host.register(Arc::new(worker)).await.unwrap();

    let resp = host.fetch(client, get("index.html")).await.unwrap();
    assert_eq!(resp.body, Bytes::from_static(b"network"));
    assert_eq!(network.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_controlled_fetch_uses_worker_answer() {
    let network = Arc::new(EchoNetwork::new());
    let host = ServiceHost::new(Arc::clone(&network));

    let mut worker = ScriptedWorker::new("v1");
    let url = Url::parse("http://localhost/index.html").unwrap();
    worker.answer = Disposition::Respond(Some(response(&url, "cached")));
    host.resume(Arc::new(worker));
    let client = host.open_client();

    let resp = host.fetch(client, get("index.html")).await.unwrap();
    assert_eq!(resp.body, Bytes::from_static(b"cached"));
    assert_eq!(network.calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_passthrough_and_failed_load() {
    let host = host();
    host.resume(Arc::new(ScriptedWorker::new("v1")));
    let client = host.open_client();

    let post = Request::new(Method::POST, Url::parse("http://localhost/api").unwrap());
    let resp = host.fetch(client, post).await.unwrap();
    assert_eq!(resp.body, Bytes::from_static(b"network"));

    let mut failing = ScriptedWorker::new("v2");
    failing.answer = Disposition::Respond(None);
    host.resume(Arc::new(failing));
    let client = host.open_client();
    let err = host.fetch(client, get("missing.png")).await.unwrap_err();
    assert!(matches!(err, HostError::LoadFailed(url) if url.ends_with("/missing.png")));
  }
}
