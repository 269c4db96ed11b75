use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Named mutual exclusion. Across the process, at most `limit` holders
/// exist for a given handle at any instant; acquisition blocks, and a
/// dropped guard (including a cancelled acquire) always releases.
///
/// Single-process deployments get the full semantics from this registry; a
/// clustered deployment swaps in a lease- or row-lock-backed equivalent
/// behind the same two calls.
pub struct SemaphoreRegistry {
    inner: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    sem: Arc<Semaphore>,
    refs: usize,
}

impl SemaphoreRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HashMap::new()),
        })
    }

    /// Blocks until a permit for `handle` is available. The first acquirer
    /// of a handle fixes its capacity.
    pub async fn acquire(&self, handle: &str, limit: usize) -> SemaphoreGuard<'_> {
        let sem = {
            let mut map = self.inner.lock().expect("semaphore registry poisoned");
            let entry = map.entry(handle.to_string()).or_insert_with(|| Entry {
                sem: Arc::new(Semaphore::new(limit)),
                refs: 0,
            });
            entry.refs += 1;
            Arc::clone(&entry.sem)
        };

        // The tracker is armed before awaiting so a cancelled acquire still
        // drops its map reference.
        let tracker = RefTracker {
            registry: self,
            handle: handle.to_string(),
        };

        let permit = sem
            .acquire_owned()
            .await
            .expect("registry semaphores are never closed");

        SemaphoreGuard {
            _permit: permit,
            _tracker: tracker,
        }
    }

    fn release_ref(&self, handle: &str) {
        let mut map = self.inner.lock().expect("semaphore registry poisoned");
        if let Some(entry) = map.get_mut(handle) {
            entry.refs -= 1;
            if entry.refs == 0 {
                map.remove(handle);
            }
        }
    }

    #[cfg(test)]
    pub fn handle_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

struct RefTracker<'a> {
    registry: &'a SemaphoreRegistry,
    handle: String,
}

impl Drop for RefTracker<'_> {
    fn drop(&mut self) {
        self.registry.release_ref(&self.handle);
    }
}

/// Field order matters: the permit must return to the semaphore before the
/// tracker can retire the handle's map entry.
pub struct SemaphoreGuard<'a> {
    _permit: OwnedSemaphorePermit,
    _tracker: RefTracker<'a>,
}

pub fn issue_handle(user_id: &str) -> String {
    format!("issue-{user_id}")
}

pub fn token_handle(token: &[u8]) -> String {
    format!("auth-token-{}", hex::encode(token))
}
