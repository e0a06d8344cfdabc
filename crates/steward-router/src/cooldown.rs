//! Per-backend failure quarantine.
//!
//! Every consecutive failure doubles the window during which a backend is
//! skipped by the router, up to a ceiling. State lives for the process
//! lifetime only and is shared by cloning the tracker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Backoff parameters, loaded from the `[cooldown]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownPolicy {
    /// Window after the first failure, in seconds.
    pub base_secs: u64,
    /// Upper bound on any window, in seconds.
    pub ceiling_secs: u64,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            base_secs: 5,
            ceiling_secs: 60 * 60,
        }
    }
}

impl CooldownPolicy {
    /// Window for the `failures`-th consecutive failure:
    /// `min(ceiling, base * 2^(failures - 1))`.
    pub fn window(&self, failures: u32) -> Duration {
        let base = Duration::from_secs(self.base_secs);
        let ceiling = Duration::from_secs(self.ceiling_secs);
        let factor = 1u32
            .checked_shl(failures.saturating_sub(1))
            .unwrap_or(u32::MAX);
        base.saturating_mul(factor).min(ceiling)
    }
}

/// Failure state of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownState {
    pub consecutive_failures: u32,
    pub cooldown_until: Instant,
}

/// Thread-safe cooldown table keyed by backend id.
///
/// Cloning is cheap and clones share state.
#[derive(Debug, Clone, Default)]
pub struct CooldownTracker {
    policy: CooldownPolicy,
    states: Arc<DashMap<String, CooldownState>>,
}

impl CooldownTracker {
    pub fn new(policy: CooldownPolicy) -> Self {
        Self {
            policy,
            states: Arc::new(DashMap::new()),
        }
    }

    pub fn policy(&self) -> CooldownPolicy {
        self.policy
    }

    /// Record a failure and return the new quarantine window.
    pub fn mark_failed(&self, backend_id: &str) -> Duration {
        self.mark_failed_at(backend_id, Instant::now())
    }

    fn mark_failed_at(&self, backend_id: &str, now: Instant) -> Duration {
        let mut entry = self
            .states
            .entry(backend_id.to_string())
            .or_insert(CooldownState {
                consecutive_failures: 0,
                cooldown_until: now,
            });
        let state = entry.value_mut();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let window = self.policy.window(state.consecutive_failures);
        state.cooldown_until = state.cooldown_until.max(now + window);

        tracing::warn!(
            backend = %backend_id,
            failures = state.consecutive_failures,
            cooldown_secs = window.as_secs(),
            "backend failed, cooling down"
        );
        window
    }

    /// Whether `backend_id` is inside its quarantine window.
    pub fn is_cooling_down(&self, backend_id: &str) -> bool {
        !self.remaining(backend_id).is_zero()
    }

    /// Time left in the quarantine window, zero when usable.
    pub fn remaining(&self, backend_id: &str) -> Duration {
        self.states
            .get(backend_id)
            .map(|s| s.cooldown_until.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    pub fn state(&self, backend_id: &str) -> Option<CooldownState> {
        self.states.get(backend_id).map(|s| *s.value())
    }

    /// Forget one backend's failures.
    pub fn clear(&self, backend_id: &str) {
        if self.states.remove(backend_id).is_some() {
            tracing::debug!(backend = %backend_id, "cooldown cleared");
        }
    }

    /// Forget every backend's failures.
    pub fn clear_all(&self) {
        let cleared = self.states.len();
        self.states.clear();
        tracing::info!(cleared, "all cooldowns cleared");
    }

    /// Backends currently cooling down with their remaining windows, sorted
    /// by id.
    pub fn active(&self) -> Vec<(String, Duration)> {
        let now = Instant::now();
        let mut active: Vec<(String, Duration)> = self
            .states
            .iter()
            .map(|e| (e.key().clone(), e.cooldown_until.saturating_duration_since(now)))
            .filter(|(_, left)| !left.is_zero())
            .collect();
        active.sort_by(|a, b| a.0.cmp(&b.0));
        active
    }
}
