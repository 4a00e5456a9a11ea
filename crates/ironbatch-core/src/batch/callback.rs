//! Completion callbacks for top-level job executions.
//!
//! Each execution is marked complete exactly once. One-shot callbacks
//! registered for that execution and every global listener fire then, and
//! waiters blocked in [`CompletionRegistry::wait`] are woken.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ironbatch_types::status::BatchStatus;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// Stand-in deadline for timeouts too large to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

type Callback = Box<dyn FnOnce(Uuid, BatchStatus) + Send>;
type Listener = Arc<dyn Fn(Uuid, BatchStatus) + Send + Sync>;

#[derive(Default)]
struct Registrations {
    completed: HashMap<Uuid, BatchStatus>,
    callbacks: HashMap<Uuid, Vec<Callback>>,
    listeners: Vec<Listener>,
}

#[derive(Default)]
pub struct CompletionRegistry {
    inner: Mutex<Registrations>,
    notify: Notify,
}

impl std::fmt::Debug for CompletionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("CompletionRegistry")
            .field("completed", &inner.completed.len())
            .field("pending_callbacks", &inner.callbacks.len())
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

impl CompletionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` once `execution_id` completes, or right away if it
    /// already has.
    pub fn on_completion<F>(&self, execution_id: Uuid, callback: F)
    where
        F: FnOnce(Uuid, BatchStatus) + Send + 'static,
    {
        let mut inner = self.lock();
        if let Some(status) = inner.completed.get(&execution_id).copied() {
            drop(inner);
            callback(execution_id, status);
            return;
        }
        inner
            .callbacks
            .entry(execution_id)
            .or_default()
            .push(Box::new(callback));
    }

    /// Run `listener` for every execution completed from now on.
    pub fn subscribe_all<F>(&self, listener: F)
    where
        F: Fn(Uuid, BatchStatus) + Send + Sync + 'static,
    {
        self.lock().listeners.push(Arc::new(listener));
    }

    /// Record the final status. Returns `false` (and fires nothing) if the
    /// execution was already marked complete.
    pub fn mark_completed(&self, execution_id: Uuid, status: BatchStatus) -> bool {
        let (callbacks, listeners) = {
            let mut inner = self.lock();
            if inner.completed.contains_key(&execution_id) {
                return false;
            }
            inner.completed.insert(execution_id, status);
            (
                inner.callbacks.remove(&execution_id).unwrap_or_default(),
                inner.listeners.clone(),
            )
        };

        for callback in callbacks {
            callback(execution_id, status);
        }
        for listener in listeners {
            listener(execution_id, status);
        }
        self.notify.notify_waiters();
        true
    }

    pub fn status(&self, execution_id: &Uuid) -> Option<BatchStatus> {
        self.lock().completed.get(execution_id).copied()
    }

    /// Wait up to `timeout` for `execution_id` to complete.
    pub async fn wait(&self, execution_id: Uuid, timeout: Duration) -> Option<BatchStatus> {
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);
        let notified = self.notify.notified();
        tokio::pin!(notified);
        loop {
            // Register interest before checking so a completion between the
            // check and the await is not missed.
            notified.as_mut().enable();
            if let Some(status) = self.status(&execution_id) {
                return Some(status);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            if tokio::time::timeout(remaining, notified.as_mut()).await.is_err() {
                return self.status(&execution_id);
            }
            notified.set(self.notify.notified());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registrations> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
