//! Events dispatched to a worker and their extended lifetimes.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::{JoinError, JoinSet};
use tracing::warn;

use crate::cache::{Request, Response};

/// How a worker answered a fetch event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
  /// The worker declined; the host performs its default network fetch.
  PassThrough,
  /// The worker responded. `None` means the load fails.
  Respond(Option<Response>),
}

/// Work that outlives the event that started it.
///
/// Tasks run on the tokio runtime as soon as they are added. The host awaits
/// them through [`Extensions::settle`] without ever delaying a response.
#[derive(Clone, Default)]
pub struct Extensions {
  tasks: Arc<Mutex<JoinSet<()>>>,
}

impl Extensions {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
    self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Start a task and track it until it finishes.
  ///
  /// Tasks that already finished are dropped first, so a long-lived host
  /// only holds work that is still running.
  pub fn spawn<F>(&self, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let mut tasks = self.lock();
    reap(&mut tasks);
    tasks.spawn(task);
  }

  /// Number of tracked tasks still running.
  #[allow(dead_code)]
  pub fn pending(&self) -> usize {
    let mut tasks = self.lock();
    reap(&mut tasks);
    tasks.len()
  }

  /// Wait for every tracked task, including tasks added while waiting.
  pub async fn settle(&self) {
    loop {
      let mut tasks = std::mem::take(&mut *self.lock());
      if tasks.is_empty() {
        break;
      }
      while let Some(result) = tasks.join_next().await {
        report(result);
      }
    }
  }
}

fn reap(tasks: &mut JoinSet<()>) {
  while let Some(result) = tasks.try_join_next() {
    report(result);
  }
}

fn report(result: Result<(), JoinError>) {
  if let Err(e) = result {
    warn!(error = %e, "extended task did not complete");
  }
}

/// A resource request from a controlled client.
pub struct FetchEvent {
  request: Request,
  extensions: Extensions,
}

impl FetchEvent {
  pub fn new(request: Request, extensions: Extensions) -> Self {
    Self {
      request,
      extensions,
    }
  }

  pub fn request(&self) -> &Request {
    &self.request
  }

  /// Extend the event's lifetime until the task completes.
  pub fn wait_until<F>(&self, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    self.extensions.spawn(task);
  }
}
