//! Per-location operation locks with call-chain re-entrancy.
//!
//! [`OperationSynchronizer`] hands out one async mutex per location
//! (case-insensitive), reference counted and dropped as soon as no call for
//! that location is running or waiting.
//!
//! Each held lock is recorded in a task-local call chain. A nested call for
//! a location the chain already holds (for example, a `Closing` listener
//! saving the project being closed) runs straight through instead of
//! deadlocking on itself. The event dispatcher carries the chain into
//! listener fan-outs it moves to the background, and every held entry has a
//! liveness flag so a chain that outlived its lock no longer bypasses it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::project::LocationKey;

tokio::task_local! {
    static CALL_CHAIN: CallChain;
}

/// One location lock held by a call chain.
#[derive(Debug, Clone)]
struct HeldLock {
    key: LocationKey,
    /// Cleared when the owning call releases the lock.
    live: Arc<AtomicBool>,
}

/// The set of location locks held by the current logical call.
#[derive(Debug, Clone, Default)]
pub(crate) struct CallChain {
    held: Arc<Vec<HeldLock>>,
}

impl CallChain {
    fn holds(&self, key: &LocationKey) -> bool {
        self.held
            .iter()
            .any(|held| held.key == *key && held.live.load(Ordering::Acquire))
    }

    fn extended(&self, key: LocationKey, live: Arc<AtomicBool>) -> Self {
        let mut held: Vec<HeldLock> = self
            .held
            .iter()
            .filter(|held| held.live.load(Ordering::Acquire))
            .cloned()
            .collect();
        held.push(HeldLock { key, live });
        Self {
            held: Arc::new(held),
        }
    }
}

/// Returns the call chain of the running task, or an empty chain outside any
/// exclusive section.
pub(crate) fn current_chain() -> CallChain {
    CALL_CHAIN.try_with(CallChain::clone).unwrap_or_default()
}

/// Run `future` with `chain` installed as its call chain.
pub(crate) async fn scope_chain<F: Future>(chain: CallChain, future: F) -> F::Output {
    CALL_CHAIN.scope(chain, future).await
}

#[derive(Debug)]
struct Entry {
    lock: Arc<tokio::sync::Mutex<()>>,
    refs: usize,
}

/// Registry of per-location exclusive locks.
///
/// Calls for the same location run one at a time in arrival order (tokio's
/// mutex is fair). Calls for different locations never wait on each other.
/// A registry entry exists exactly while at least one call for its location
/// is waiting or running.
///
/// # Examples
///
/// ```
/// use projectfold::OperationSynchronizer;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let sync = OperationSynchronizer::new();
/// let value = sync.run_exclusive("/work/a.proj", || async { 42 }).await;
/// assert_eq!(value, 42);
/// assert!(!sync.is_tracked("/work/a.proj"));
/// # }
/// ```
#[derive(Debug, Default)]
pub struct OperationSynchronizer {
    registry: Mutex<HashMap<LocationKey, Entry>>,
}

impl OperationSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` while holding the lock for `location`.
    ///
    /// If the current call chain already holds `location`, the operation
    /// runs immediately without touching the registry.
    ///
    /// The lock and the reference count are released on every exit path,
    /// including when the returned future is dropped before completion.
    ///
    /// # Arguments
    ///
    /// * `location` - The location to serialize on. Compared case-insensitively.
    /// * `operation` - Produces the future to run under the lock.
    ///
    /// # Returns
    ///
    /// Whatever `operation` resolves to.
    pub async fn run_exclusive<F, Fut, T>(&self, location: &str, operation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let key = LocationKey::new(location);
        let chain = current_chain();
        if chain.holds(&key) {
            tracing::trace!(location = %key, "re-entering held location lock");
            return operation().await;
        }

        let lock = self.retain(&key);
        let _lease = Lease {
            synchronizer: self,
            key: key.clone(),
        };
        let _guard = lock.lock_owned().await;

        let live = Arc::new(AtomicBool::new(true));
        let _held = LiveFlag(Arc::clone(&live));
        let chain = chain.extended(key, live);
        CALL_CHAIN.scope(chain, async move { operation().await }).await
    }

    /// Returns `true` while a call for `location` is waiting or running.
    pub fn is_tracked(&self, location: &str) -> bool {
        self.registry().contains_key(&LocationKey::new(location))
    }

    /// Number of locations with a waiting or running call.
    pub fn tracked_count(&self) -> usize {
        self.registry().len()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<LocationKey, Entry>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retain(&self, key: &LocationKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut registry = self.registry();
        let entry = registry.entry(key.clone()).or_insert_with(|| Entry {
            lock: Arc::new(tokio::sync::Mutex::new(())),
            refs: 0,
        });
        entry.refs += 1;
        Arc::clone(&entry.lock)
    }

    fn release(&self, key: &LocationKey) {
        let mut registry = self.registry();
        if let Some(entry) = registry.get_mut(key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                registry.remove(key);
            }
        }
    }
}

/// Drops one registry reference.
struct Lease<'a> {
    synchronizer: &'a OperationSynchronizer,
    key: LocationKey,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.synchronizer.release(&self.key);
    }
}

/// Marks a held lock as released.
struct LiveFlag(Arc<AtomicBool>);

impl Drop for LiveFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
