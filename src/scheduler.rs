//! # Analysis Scheduler
//!
//! Debounces bursts of edit/speech events into a single deferred analysis
//! trigger per session. Every `schedule` call for a session cancels and
//! replaces that session's pending timer, so only `debounce` worth of
//! silence lets the callback fire.
//!
//! ## Invariants:
//! - At most one pending timer per session at any time, enforced
//!   structurally: the map slot is replaced under the lock and the old
//!   timer task is aborted before the new one is inserted
//! - A cancelled timer's callback can never fire: cancellation aborts the
//!   sleeping task, and a task that wakes up only runs its callback if its
//!   generation token still owns the map slot
//! - `cancel` on a session with nothing pending is a no-op

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

struct Pending {
    handle: JoinHandle<()>,

    /// Generation token; a woken timer task only proceeds if the slot
    /// still holds its token
    token: u64,

    /// When this timer was armed, for the background age sweep
    armed_at: Instant,
}

/// Per-session debounce timer table, shared process-wide.
pub struct AnalysisScheduler {
    pending: Mutex<HashMap<String, Pending>>,
    next_token: AtomicU64,
}

impl AnalysisScheduler {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
        }
    }

    /// Arm (or re-arm) the debounce timer for `session_id`. After
    /// `debounce` of silence the callback future runs; any earlier
    /// `schedule` or `cancel` for the same session replaces or kills it.
    pub fn schedule<F>(self: &Arc<Self>, session_id: &str, debounce: Duration, callback: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let scheduler = Arc::clone(self);
        let id = session_id.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;

            // Claim the slot. If another schedule/cancel got there first,
            // this timer no longer owns the session and must not fire.
            let owned = {
                let mut pending = scheduler.pending.lock().unwrap();
                match pending.get(&id) {
                    Some(entry) if entry.token == token => {
                        pending.remove(&id);
                        true
                    }
                    _ => false,
                }
            };

            if owned {
                callback.await;
            }
        });

        let mut pending = self.pending.lock().unwrap();
        if let Some(old) = pending.insert(
            session_id.to_string(),
            Pending {
                handle,
                token,
                armed_at: Instant::now(),
            },
        ) {
            debug!(session_id, "replacing pending analysis timer");
            old.handle.abort();
        }
    }

    /// Clear the pending timer for a session, if any.
    pub fn cancel(&self, session_id: &str) {
        if let Some(entry) = self.pending.lock().unwrap().remove(session_id) {
            entry.handle.abort();
        }
    }

    /// Whether a timer is currently armed for this session.
    pub fn is_pending(&self, session_id: &str) -> bool {
        self.pending.lock().unwrap().contains_key(session_id)
    }

    /// Number of armed timers across all sessions (for the health surface).
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Cancel timers older than `max_age`. Run from the periodic
    /// background sweep.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut pending = self.pending.lock().unwrap();
        let stale: Vec<String> = pending
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.armed_at) > max_age)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            if let Some(entry) = pending.remove(id) {
                entry.handle.abort();
            }
            debug!(session_id = %id, "swept stale analysis timer");
        }
        stale.len()
    }
}

impl Default for AnalysisScheduler {
    fn default() -> Self {
        Self::new()
    }
}
