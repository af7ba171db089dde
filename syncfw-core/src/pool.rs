use anyhow::Context;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome<R> {
  Completed(R),
  TimedOut,
  Failed,
}

/// Bounded executor for blocking lookups, backed by a dedicated tokio runtime.
///
/// A semaphore caps how many tasks run at once. Each task runs on the blocking pool and
/// holds its permit until it actually returns, so an abandoned task keeps counting
/// against the limit. A task that panics is reported as failed.
pub struct WorkerPool {
  runtime: Option<Runtime>,
  handle: Handle,
}

impl WorkerPool {
  pub fn new() -> anyhow::Result<Self> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
      .worker_threads(2)
      .thread_name("syncfw-worker")
      .enable_all()
      .build()
      .context("build worker runtime")?;
    let handle = runtime.handle().clone();
    Ok(Self {
      runtime: Some(runtime),
      handle,
    })
  }

  /// Runtime handle for components whose own I/O must live as long as the pool.
  pub fn handle(&self) -> Handle {
    self.handle.clone()
  }

  /// Submits one task per item, at most `limit` running at once. The timeout starts
  /// once a task holds its permit. Results come back in submission order.
  pub fn map<T, R, F>(
    &self,
    items: Vec<T>,
    limit: usize,
    timeout: Duration,
    task: F,
  ) -> OrderedResults<R>
  where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> R + Send + Sync + 'static,
  {
    let permits = Arc::new(Semaphore::new(limit.max(1)));
    let task = Arc::new(task);

    let pending = items
      .into_iter()
      .map(|item| {
        let permits = Arc::clone(&permits);
        let task = Arc::clone(&task);
        self.handle.spawn(async move {
          let Ok(permit) = permits.acquire_owned().await else {
            return TaskOutcome::Failed;
          };
          let running = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            task(item)
          });
          match tokio::time::timeout(timeout, running).await {
            Ok(Ok(value)) => TaskOutcome::Completed(value),
            Ok(Err(_)) => TaskOutcome::Failed,
            Err(_) => TaskOutcome::TimedOut,
          }
        })
      })
      .collect();

    OrderedResults {
      handle: self.handle.clone(),
      pending,
    }
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    // Hung lookups must not hold up shutdown.
    if let Some(runtime) = self.runtime.take() {
      runtime.shutdown_background();
    }
  }
}

/// Results of [`WorkerPool::map`], awaited one by one in submission order.
pub struct OrderedResults<R> {
  handle: Handle,
  pending: VecDeque<JoinHandle<TaskOutcome<R>>>,
}

impl<R> OrderedResults<R> {
  /// True when tasks remain after the caller consumed every result it expected.
  pub fn has_pending(&self) -> bool {
    !self.pending.is_empty()
  }
}

impl<R> Iterator for OrderedResults<R> {
  type Item = TaskOutcome<R>;

  fn next(&mut self) -> Option<Self::Item> {
    let task = self.pending.pop_front()?;
    Some(self.handle.block_on(task).unwrap_or(TaskOutcome::Failed))
  }
}
