//! Per-configuration admission control.
//!
//! At most one run per sync configuration may be in flight in this process.
//! Timer firings and manual triggers both go through the same guard.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Process-local set of sync configuration ids with a run in flight.
#[derive(Debug, Default)]
pub struct ConcurrencyGuard {
    running: Mutex<HashSet<String>>,
}

impl ConcurrencyGuard {
    /// Creates an empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the set half-updated,
    // so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.running
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Claims the slot for `config_id`. Returns `false`, changing nothing,
    /// when the slot is already held.
    pub fn try_acquire(&self, config_id: &str) -> bool {
        self.lock().insert(config_id.to_string())
    }

    /// Frees the slot for `config_id`. Releasing a free slot is a no-op.
    pub fn release(&self, config_id: &str) {
        self.lock().remove(config_id);
    }

    /// True while a run for `config_id` holds the slot.
    pub fn is_running(&self, config_id: &str) -> bool {
        self.lock().contains(config_id)
    }

    /// Ids currently holding a slot, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().iter().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Claims the slot and returns a permit that frees it on drop.
    pub fn admit(self: &Arc<Self>, config_id: &str) -> Option<AdmissionPermit> {
        self.try_acquire(config_id).then(|| AdmissionPermit {
            guard: Arc::clone(self),
            config_id: config_id.to_string(),
        })
    }
}

/// Proof of admission for one run; releases the slot when dropped.
#[derive(Debug)]
#[must_use = "dropping the permit releases the slot immediately"]
pub struct AdmissionPermit {
    guard: Arc<ConcurrencyGuard>,
    config_id: String,
}

impl AdmissionPermit {
    /// Configuration this permit admits.
    pub fn config_id(&self) -> &str {
        &self.config_id
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.guard.release(&self.config_id);
    }
}
