//! Process-wide interrupt flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Raised once the agent is shutting down.
///
/// Lifecycle operations check it before acting and become no-ops once set.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
