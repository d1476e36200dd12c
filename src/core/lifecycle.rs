// src/core/lifecycle.rs

//! `LifecycleGroup` tracks every task a session spawns so the session can be
//! torn down as a unit.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, warn};

/// How long `shutdown` waits between progress checks on stuck workers.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A named set of workers owned by one session.
#[derive(Debug)]
pub struct LifecycleGroup {
    name: String,
    tasks: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl LifecycleGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Spawns `future` into the group. Returns `None` once the group is closed.
    pub fn spawn<F>(&self, future: F) -> Option<AbortHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        if self.is_closed() {
            return None;
        }
        // Reap finished workers so long-lived sessions don't accumulate results.
        while tasks.try_join_next().is_some() {}
        Some(tasks.spawn(future))
    }

    /// Number of workers not yet reaped.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops every worker in the group and waits for all of them to finish.
    ///
    /// After this returns, no task spawned into the group is still running and
    /// further `spawn` calls are refused.
    pub async fn shutdown(&self) {
        let mut tasks = {
            let mut guard = self.tasks.lock();
            self.closed.store(true, Ordering::Release);
            std::mem::take(&mut *guard)
        };

        tasks.abort_all();
        let mut waited = Duration::ZERO;
        loop {
            match tokio::time::timeout(JOIN_POLL_INTERVAL, tasks.join_next()).await {
                Ok(Some(Err(e))) if e.is_panic() => {
                    warn!("Worker in session '{}' panicked: {e:?}", self.name);
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    waited += JOIN_POLL_INTERVAL;
                    warn!(
                        "Still waiting on {} worker(s) of session '{}' after {:?}.",
                        tasks.len(),
                        self.name,
                        waited
                    );
                }
            }
        }
        debug!("All workers of session '{}' have stopped.", self.name);
    }
}
