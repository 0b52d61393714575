//! Grace-period tracking for links reported as disconnected.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Remembers when each link was first seen disconnected.
///
/// A link only counts as expired once it has stayed disconnected for longer
/// than the grace period; a link that reconnects is forgotten.
#[derive(Debug, Clone)]
pub struct DisconnectTracker {
    grace: Duration,
    first_seen: BTreeMap<String, Instant>,
}

impl DisconnectTracker {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            first_seen: BTreeMap::new(),
        }
    }

    /// Record the currently disconnected links and return those past grace.
    ///
    /// Expired links are dropped from tracking so the grace period restarts
    /// after the caller acts on them.
    pub fn observe<I, S>(&mut self, disconnected: I, now: Instant) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let current: Vec<String> = disconnected.into_iter().map(Into::into).collect();
        self.first_seen.retain(|name, _| current.contains(name));

        let mut expired = Vec::new();
        for name in current {
            let first = *self.first_seen.entry(name.clone()).or_insert(now);
            if now.duration_since(first) > self.grace {
                expired.push(name);
            }
        }

        for name in &expired {
            self.first_seen.remove(name);
        }
        expired
    }

    pub fn tracked(&self) -> usize {
        self.first_seen.len()
    }
}
