//! Reservation set: the keys currently in flight, plus the shared gate that
//! serializes reserve/release for every key.
//!
//! One mutex guards the set and one broadcast notification wakes every
//! waiter on every release. A woken waiter re-checks its own key, since the
//! release it saw may have been for a different one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::Key;

/// Keys currently being processed. At most one entry per equality class.
pub struct ReservationSet<K> {
    keys: Mutex<HashSet<K>>,
    released: Notify,
    interrupted: AtomicBool,
}

impl<K: Key> ReservationSet<K> {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashSet::new()),
            released: Notify::new(),
            interrupted: AtomicBool::new(false),
        }
    }

    // Nothing panics while holding the lock, but a poisoned set is still a
    // valid set.
    fn lock(&self) -> MutexGuard<'_, HashSet<K>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains(key)
    }

    /// Number of keys currently reserved.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve `key` if no equal key is reserved. Check and insert happen
    /// under one lock acquisition.
    pub fn try_add(&self, key: &K) -> bool {
        let mut keys = self.lock();
        if keys.contains(key) {
            return false;
        }
        keys.insert(key.clone())
    }

    /// Remove `key` and wake every waiter. Returns whether it was reserved.
    pub fn remove(&self, key: &K) -> bool {
        let removed = self.lock().remove(key);
        self.released.notify_waiters();
        removed
    }

    /// Wait until no equal key is reserved, then reserve `key`.
    ///
    /// Fails with [`Error::Interrupted`] if the set is interrupted while this
    /// call has to wait. A call that finds its key free never fails.
    pub async fn reserve(self: &Arc<Self>, key: &K) -> Result<Reservation<K>> {
        loop {
            // Register for the next release before checking, so a release
            // between the check and the await is not missed.
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.try_add(key) {
                return Ok(Reservation {
                    set: Arc::clone(self),
                    key: key.clone(),
                });
            }

            if self.interrupted.load(Ordering::SeqCst) {
                return Err(Error::Interrupted);
            }

            debug!(key = ?key, "key reserved elsewhere, waiting");
            released.await;
        }
    }

    /// Fail every current and future wait with [`Error::Interrupted`].
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.released.notify_waiters();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

impl<K: Key> Default for ReservationSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// A held reservation. Dropping it releases the key and wakes all waiters,
/// whatever path the holder leaves by.
#[must_use = "dropping a reservation releases the key immediately"]
pub struct Reservation<K: Key> {
    set: Arc<ReservationSet<K>>,
    key: K,
}

impl<K: Key> Reservation<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Key> Drop for Reservation<K> {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}
