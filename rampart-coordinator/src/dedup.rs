//! In-flight deduplication.
//!
//! The first caller for a key becomes the leader and runs the operation.
//! Anyone arriving while the entry is live waits for the leader's outcome
//! instead of starting a second copy. Outcomes are shared by clone, errors
//! included.
//!
//! Entry lifecycle:
//! - `Pending` while the leader runs; waiters hold a watch receiver.
//! - `Settled` once the outcome is known; later callers inside the window
//!   get it directly.
//! - Removed after the grace delay, or immediately if the leader is
//!   dropped mid-flight.
//!
//! An entry is live for `window` after creation. A stale entry is simply
//! replaced; the generation counter keeps an old leader from touching its
//! successor.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rampart_core::{DedupConfig, OperationError};
use tokio::sync::watch;
use tokio::time::Instant;

type SharedValue = Arc<dyn Any + Send + Sync>;
type Outcome = Result<SharedValue, OperationError>;
type InFlightMap = HashMap<String, InFlightEntry>;

enum EntryState {
    Pending(watch::Receiver<Option<Outcome>>),
    Settled(Outcome),
}

struct InFlightEntry {
    created_at: Instant,
    generation: u64,
    state: EntryState,
}

fn lock(map: &Mutex<InFlightMap>) -> MutexGuard<'_, InFlightMap> {
    match map.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn downcast<T: Clone + 'static>(outcome: &Outcome) -> Option<Result<T, OperationError>> {
    match outcome {
        Ok(value) => value.downcast_ref::<T>().cloned().map(Ok),
        Err(error) => Some(Err(error.clone())),
    }
}

enum Role<T> {
    Leader(LeaderGuard),
    Follower(watch::Receiver<Option<Outcome>>),
    Done(Result<T, OperationError>),
}

/// Short-lived cache of in-flight operations keyed by caller-chosen keys.
pub struct DedupCache {
    entries: Arc<Mutex<InFlightMap>>,
    generation: AtomicU64,
    window: Duration,
    grace: Duration,
}

impl std::fmt::Debug for DedupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupCache")
            .field("window", &self.window)
            .field("grace", &self.grace)
            .field("entries", &lock(&self.entries).len())
            .finish()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(&DedupConfig::default())
    }
}

impl DedupCache {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            window: config.window(),
            grace: config.grace(),
        }
    }

    /// Run `op` unless an identical call is already live for `key`.
    pub async fn run<T, F, Fut>(&self, key: &str, op: F) -> Result<T, OperationError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        match self.claim::<T>(key) {
            Role::Done(result) => {
                tracing::debug!(key, "dedup served settled outcome");
                result
            }
            Role::Follower(mut rx) => {
                tracing::debug!(key, "dedup joined in-flight call");
                let outcome = match rx.wait_for(Option::is_some).await {
                    Ok(published) => published.clone(),
                    Err(_) => None,
                };
                match outcome {
                    Some(outcome) => match downcast::<T>(&outcome) {
                        Some(result) => result,
                        None => {
                            tracing::debug!(key, "dedup type mismatch; running directly");
                            op().await
                        }
                    },
                    None => Err(OperationError::abandoned(key)),
                }
            }
            Role::Leader(guard) => {
                let result = op().await;
                let outcome: Outcome = result
                    .clone()
                    .map(|value| Arc::new(value) as SharedValue);
                guard.settle(outcome);
                result
            }
        }
    }

    /// Pending entries.
    pub fn in_flight_count(&self) -> usize {
        lock(&self.entries)
            .values()
            .filter(|entry| matches!(entry.state, EntryState::Pending(_)))
            .count()
    }

    /// Entries of any state still tracked.
    pub fn tracked_count(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Forget every entry. Waiters already attached still get their outcome.
    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    fn claim<T: Clone + 'static>(&self, key: &str) -> Role<T> {
        let mut entries = lock(&self.entries);
        if let Some(entry) = entries.get(key) {
            if entry.created_at.elapsed() < self.window {
                match &entry.state {
                    EntryState::Pending(rx) => return Role::Follower(rx.clone()),
                    EntryState::Settled(outcome) => {
                        if let Some(result) = downcast::<T>(outcome) {
                            return Role::Done(result);
                        }
                    }
                }
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        entries.insert(
            key.to_string(),
            InFlightEntry {
                created_at: Instant::now(),
                generation,
                state: EntryState::Pending(rx),
            },
        );
        Role::Leader(LeaderGuard {
            entries: self.entries.clone(),
            key: key.to_string(),
            generation,
            grace: self.grace,
            sender: Some(tx),
        })
    }
}

/// Held by the leader while its operation runs.
///
/// Dropping it without settling (the leader's future was cancelled) wakes
/// waiters with an abandonment error and removes the entry.
struct LeaderGuard {
    entries: Arc<Mutex<InFlightMap>>,
    key: String,
    generation: u64,
    grace: Duration,
    sender: Option<watch::Sender<Option<Outcome>>>,
}

impl LeaderGuard {
    fn settle(mut self, outcome: Outcome) {
        if let Some(sender) = self.sender.take() {
            sender.send_replace(Some(outcome.clone()));
        }
        {
            let mut entries = lock(&self.entries);
            match entries.get_mut(&self.key) {
                Some(entry) if entry.generation == self.generation => {
                    entry.state = EntryState::Settled(outcome);
                }
                _ => return,
            }
        }

        let entries = self.entries.clone();
        let key = self.key.clone();
        let generation = self.generation;
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut entries = lock(&entries);
            if entries.get(&key).is_some_and(|e| e.generation == generation) {
                entries.remove(&key);
            }
        });
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        let Some(sender) = self.sender.take() else {
            return;
        };
        tracing::debug!(key = %self.key, "dedup leader dropped before settling");
        sender.send_replace(Some(Err(OperationError::abandoned(&self.key))));
        let mut entries = lock(&self.entries);
        if entries
            .get(&self.key)
            .is_some_and(|e| e.generation == self.generation)
        {
            entries.remove(&self.key);
        }
    }
}
