//! Expiring mutual exclusion keyed by resource ID.
//!
//! A plain mutex is not enough here: a convergence task can outlive its
//! intended window (stuck on a slow command, say) and its lease expires so
//! a later pass may take over. When the slow task finally releases, the
//! token check keeps it from unlocking the later holder.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Opaque token identifying one acquisition of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseToken(u64);

#[derive(Debug)]
struct LeaseEntry {
    token: LeaseToken,
    expires_at: Instant,
}

/// Table of expiring, token-checked leases.
///
/// The whole table sits behind one mutex; holds are a map lookup long.
#[derive(Debug)]
pub struct LeasedLock {
    ttl: Duration,
    entries: Mutex<HashMap<String, LeaseEntry>>,
    next_token: AtomicU64,
}

impl LeasedLock {
    /// Create a lock table whose leases expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, LeaseEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Try to acquire `key`. Returns `None` while another live lease holds it.
    pub fn try_acquire(&self, key: &str) -> Option<LeaseToken> {
        self.try_acquire_at(key, Instant::now())
    }

    /// Same as [`try_acquire`](Self::try_acquire) with an explicit clock reading.
    pub fn try_acquire_at(&self, key: &str, now: Instant) -> Option<LeaseToken> {
        let mut entries = self.entries();

        if let Some(entry) = entries.get(key) {
            if entry.expires_at > now {
                return None;
            }
        }

        let token = LeaseToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        entries.insert(
            key.to_string(),
            LeaseEntry {
                token,
                expires_at: now + self.ttl,
            },
        );
        Some(token)
    }

    /// Release `key` if `token` is still the current holder.
    ///
    /// Returns false when the lease already expired and was taken over, or
    /// was never held; the table is left untouched in that case.
    pub fn release(&self, key: &str, token: LeaseToken) -> bool {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if entry.token == token => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Whether a live lease currently exists for `key`.
    pub fn is_held(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries()
            .get(key)
            .is_some_and(|entry| entry.expires_at > now)
    }

    /// Acquire `key` and return a guard that releases it on drop.
    pub fn try_acquire_owned(self: &Arc<Self>, key: &str) -> Option<OwnedLease> {
        let token = self.try_acquire(key)?;
        Some(OwnedLease {
            lock: Arc::clone(self),
            key: key.to_string(),
            token,
        })
    }
}

/// A held lease that is released (token-checked) when dropped.
#[derive(Debug)]
pub struct OwnedLease {
    lock: Arc<LeasedLock>,
    key: String,
    token: LeaseToken,
}

impl OwnedLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> LeaseToken {
        self.token
    }
}

impl Drop for OwnedLease {
    fn drop(&mut self) {
        self.lock.release(&self.key, self.token);
    }
}
