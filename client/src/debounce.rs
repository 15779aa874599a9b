//! Debounce scheduler.
//!
//! Coalesces bursts of calls into one action per key after a quiet interval.
//! Timers live in a registry keyed by `K`; re-arming a key supersedes its
//! previous timer, and cancelling a key that has no timer is a no-op.

use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug)]
struct Timer {
    generation: u64,
    /// `None` while the task is being spawned
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    fn abort(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

/// Registry of per-key re-armable timers.
#[derive(Debug)]
pub struct Debouncer<K>
where
    K: Eq + Hash,
{
    timers: Arc<DashMap<K, Timer>>,
    generation: AtomicU64,
}

impl<K> Default for Debouncer<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            timers: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Run `action` once `delay` has passed without another `schedule` for `key`.
    ///
    /// A timer that already fired is out of the registry before its action
    /// starts, so scheduling again begins a new cycle and never aborts a
    /// running action.
    pub fn schedule<F, Fut>(&self, key: K, delay: Duration, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        if let Some(previous) = self.timers.insert(
            key.clone(),
            Timer {
                generation,
                handle: None,
            },
        ) {
            previous.abort();
        }

        let timers = Arc::clone(&self.timers);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let fired = timers
                .remove_if(&task_key, |_, timer| timer.generation == generation)
                .is_some();
            if fired {
                action().await;
            }
        });

        match self.timers.get_mut(&key) {
            Some(mut timer) if timer.generation == generation => timer.handle = Some(handle),
            // Already fired, or superseded while spawning
            _ => {}
        }
    }

    /// Cancel the key's timer. Returns whether one was armed.
    pub fn cancel(&self, key: &K) -> bool {
        match self.timers.remove(key) {
            Some((_, timer)) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        self.timers.retain(|_, timer| {
            timer.abort();
            false
        });
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.timers.contains_key(key)
    }

    /// Number of armed timers.
    pub fn armed(&self) -> usize {
        self.timers.len()
    }
}

impl<K> Drop for Debouncer<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        for timer in self.timers.iter() {
            timer.abort();
        }
    }
}
