//! Execution Guard
//!
//! Admission control per remediation key: at most one execution in flight,
//! and no new execution within the action's cooldown after the previous one
//! completed. The state map is locked only for the test-and-set on admission
//! and for the unlock-and-stamp on completion, never while an action runs.
//!
//! State lives in memory only. After a restart every cooldown counts as
//! elapsed and nothing is in flight. Entries that are neither in flight nor
//! cooling down carry no information and are pruned.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::alert::RemediationKey;

/// Prune once the table has grown past this many entries (and past twice
/// the size left after the previous prune).
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Default, Clone, Copy)]
struct GuardState {
    locked: bool,
    last_executed_at: Option<Instant>,
    /// Cooldown of the last admitted execution
    cooldown: Duration,
}

impl GuardState {
    fn is_idle(&self, now: Instant) -> bool {
        !self.locked
            && self
                .last_executed_at
                .map_or(true, |last| now.saturating_duration_since(last) >= self.cooldown)
    }
}

#[derive(Debug)]
struct GuardTable {
    states: HashMap<RemediationKey, GuardState>,
    prune_at: usize,
}

impl Default for GuardTable {
    fn default() -> Self {
        Self {
            states: HashMap::new(),
            prune_at: PRUNE_THRESHOLD,
        }
    }
}

impl GuardTable {
    fn prune(&mut self, now: Instant) -> usize {
        let before = self.states.len();
        self.states.retain(|_, state| !state.is_idle(now));
        self.prune_at = (self.states.len() * 2).max(PRUNE_THRESHOLD);
        before - self.states.len()
    }
}

/// Result of asking the guard for permission to execute.
#[derive(Debug)]
pub enum Admission {
    Admitted(ExecutionPermit),
    InFlight,
    Cooldown { remaining: Duration },
}

/// Process-wide guard state. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct ExecutionGuard {
    table: Arc<Mutex<GuardTable>>,
}

impl ExecutionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically check both suppression rules and, if they pass, mark the
    /// key as in flight.
    pub fn try_acquire(&self, key: &RemediationKey, cooldown: Duration) -> Admission {
        let now = Instant::now();
        let mut table = lock(&self.table);
        if table.states.len() >= table.prune_at {
            let pruned = table.prune(now);
            debug!(pruned, remaining = table.states.len(), "Pruned idle guard entries");
        }
        let state = table.states.entry(key.clone()).or_default();

        if state.locked {
            return Admission::InFlight;
        }

        if let Some(last) = state.last_executed_at {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < cooldown {
                return Admission::Cooldown {
                    remaining: cooldown - elapsed,
                };
            }
        }

        state.locked = true;
        state.cooldown = cooldown;
        debug!(key = %key, "Execution admitted");

        Admission::Admitted(ExecutionPermit {
            key: key.clone(),
            table: Arc::clone(&self.table),
            released: false,
        })
    }

    pub fn is_in_flight(&self, key: &RemediationKey) -> bool {
        lock(&self.table)
            .states
            .get(key)
            .is_some_and(|state| state.locked)
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.table)
            .states
            .values()
            .filter(|state| state.locked)
            .count()
    }

    /// Keys currently in flight or cooling down (plus idle ones not yet pruned).
    pub fn tracked_keys(&self) -> usize {
        lock(&self.table).states.len()
    }

    /// Drop every key that is neither in flight nor within its cooldown.
    /// Returns the number of entries removed.
    pub fn prune(&self) -> usize {
        lock(&self.table).prune(Instant::now())
    }

    /// Time since the last completed execution for `key`, if still tracked.
    pub fn since_last_execution(&self, key: &RemediationKey) -> Option<Duration> {
        lock(&self.table)
            .states
            .get(key)
            .and_then(|state| state.last_executed_at)
            .map(|last| Instant::now().saturating_duration_since(last))
    }
}

/// Proof of admission for one key. Releasing it (explicitly or by drop)
/// unlocks the key and stamps the completion time, so a panicking or
/// cancelled execution can never leave a key locked.
#[derive(Debug)]
pub struct ExecutionPermit {
    key: RemediationKey,
    table: Arc<Mutex<GuardTable>>,
    released: bool,
}

impl ExecutionPermit {
    pub fn key(&self) -> &RemediationKey {
        &self.key
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let now = Instant::now();
        let mut table = lock(&self.table);
        let state = table.states.entry(self.key.clone()).or_default();
        state.locked = false;
        state.last_executed_at = Some(now);
        if state.is_idle(now) {
            // zero cooldown: nothing left to remember
            table.states.remove(&self.key);
        }
        debug!(key = %self.key, "Execution released");
    }
}

impl Drop for ExecutionPermit {
    fn drop(&mut self) {
        self.release_inner();
    }
}

// The critical sections never leave a half-updated entry behind, so the data
// is still consistent after a panic elsewhere.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
