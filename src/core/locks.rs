//! Keyed in-process locks with bounded waits.
//!
//! Mutations take one lock per context id (and per agent when the
//! active-context invariant is in play), so writers to the same context are
//! mutually exclusive while writers to different contexts run side by side.
//!
//! - Keys are scoped to a database path, so two stores never share a lock.
//! - A lock set is taken all at once or not at all; two callers asking for
//!   overlapping sets cannot deadlock.
//! - Waiting is bounded by the caller's timeout; expiry is a `Conflict`.

use crate::core::error::MoltError;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Registry of held keys for the whole process.
pub struct KeyedLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Held locks; released on drop.
#[must_use = "locks are released as soon as the set is dropped"]
pub struct LockSet {
    keys: Vec<String>,
    owner: &'static KeyedLocks,
}

impl LockSet {
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        let mut held = self.owner.held.lock();
        for key in &self.keys {
            held.remove(key);
        }
        drop(held);
        self.owner.released.notify_all();
    }
}

impl KeyedLocks {
    fn new() -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    /// Acquire every key in `keys` for `db_path` as one unit, waiting at most `timeout`.
    pub fn acquire(
        &'static self,
        db_path: &Path,
        keys: &[String],
        timeout: Duration,
    ) -> Result<LockSet, MoltError> {
        let mut scoped: Vec<String> = keys
            .iter()
            .map(|k| format!("{}#{}", db_path.display(), k))
            .collect();
        scoped.sort();
        scoped.dedup();

        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock();
        while let Some(busy) = scoped.iter().find(|k| held.contains(*k)) {
            if self.released.wait_until(&mut held, deadline).timed_out()
                && scoped.iter().any(|k| held.contains(k))
            {
                let bare = busy.rsplit_once('#').map(|(_, k)| k).unwrap_or(busy);
                tracing::warn!(key = bare, timeout_ms = timeout.as_millis() as u64, "lock wait expired");
                return Err(MoltError::Conflict(format!(
                    "timed out after {}ms waiting for exclusive access to '{}'",
                    timeout.as_millis(),
                    bare
                )));
            }
        }
        for key in &scoped {
            held.insert(key.clone());
        }
        Ok(LockSet {
            keys: scoped,
            owner: self,
        })
    }
}

/// Global lock registry (same lifetime as the process).
pub fn global_locks() -> &'static KeyedLocks {
    static LOCKS: OnceLock<KeyedLocks> = OnceLock::new();
    LOCKS.get_or_init(KeyedLocks::new)
}

pub fn context_key(id: &str) -> String {
    format!("context:{}", id)
}

pub fn agent_key(agent: &str) -> String {
    format!("agent:{}", agent)
}
