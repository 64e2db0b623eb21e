//! Per-section countdown that survives suspended execution.
//!
//! Every tick deducts the wall-clock time elapsed since the previous tick,
//! except when the gap is larger than the anomaly threshold (tab suspension,
//! OS sleep, heavy throttling): then only a fixed small deduction is taken.
//! The remaining time is mirrored to the local store after each tick so a
//! reload resumes where it left off.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::model::Section;
use crate::traits::LocalStore;

/// Tunables for the countdown.
///
/// The anomaly threshold and its fallback deduction are heuristics; they are
/// kept configurable rather than treated as fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerPolicy {
    /// Gaps longer than this many seconds are treated as anomalies.
    pub anomaly_threshold_secs: u64,
    /// Seconds deducted for an anomalous gap.
    pub anomaly_deduction_secs: u64,
    /// Remaining time below which a low-time warning is raised once.
    pub low_time_warning_secs: u64,
}

impl Default for TimerPolicy {
    fn default() -> Self {
        Self {
            anomaly_threshold_secs: 5,
            anomaly_deduction_secs: 1,
            low_time_warning_secs: 300,
        }
    }
}

/// Local store key holding a section's remaining seconds.
pub fn timer_key(section_id: &str) -> String {
    format!("timer:{section_id}")
}

/// Render seconds as `MM:SS`. Minutes are not wrapped into hours.
pub fn format_remaining(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    /// Seconds left after this tick.
    pub remaining: u64,
    /// Seconds taken off by this tick.
    pub deducted: u64,
    /// True on exactly one tick: the one that observed zero first.
    pub expired: bool,
    /// True on exactly one tick: the first below the warning threshold.
    pub low_time: bool,
}

/// Countdown for the currently active section.
pub struct TimerEngine {
    section_id: String,
    duration_secs: u64,
    remaining: u64,
    last_tick: DateTime<Utc>,
    /// Sub-second remainder of earlier ticks, in `-500..500`.
    carry_ms: i64,
    expired_signalled: bool,
    low_time_signalled: bool,
    policy: TimerPolicy,
    clock: Arc<dyn Clock>,
    store: Arc<dyn LocalStore>,
}

impl TimerEngine {
    /// Start the countdown for `section`, resuming from a persisted value if
    /// one exists.
    pub fn start(
        section: &Section,
        policy: TimerPolicy,
        clock: Arc<dyn Clock>,
        store: Arc<dyn LocalStore>,
    ) -> Self {
        let duration_secs = section.duration_secs();
        let remaining = read_persisted(store.as_ref(), &section.id).unwrap_or(duration_secs);
        let last_tick = clock.now();
        debug!(section = %section.id, remaining, "timer started");

        Self {
            section_id: section.id.clone(),
            duration_secs,
            remaining,
            last_tick,
            carry_ms: 0,
            expired_signalled: false,
            low_time_signalled: false,
            policy,
            clock,
            store,
        }
    }

    /// Re-initialize for `section`.
    ///
    /// For the section already running this re-reads the persisted remaining
    /// time instead of resetting it; for any other section the old countdown
    /// is discarded and a fresh one starts.
    pub fn ensure_section(&mut self, section: &Section) {
        if section.id != self.section_id {
            *self = Self::start(
                section,
                self.policy,
                Arc::clone(&self.clock),
                Arc::clone(&self.store),
            );
            return;
        }
        if self.expired_signalled {
            return;
        }
        if let Some(persisted) = read_persisted(self.store.as_ref(), &self.section_id) {
            self.remaining = persisted;
        }
        self.last_tick = self.clock.now();
    }

    /// Advance the countdown by the wall-clock time since the previous tick.
    pub fn tick(&mut self) -> TickOutcome {
        let now = self.clock.now();
        let elapsed_ms = (now - self.last_tick).num_milliseconds();
        self.last_tick = now;

        if self.expired_signalled {
            return TickOutcome {
                remaining: 0,
                deducted: 0,
                expired: false,
                low_time: false,
            };
        }

        let deducted = self.deduction_for(elapsed_ms).min(self.remaining);
        self.remaining -= deducted;

        let low_time = !self.low_time_signalled && self.remaining < self.policy.low_time_warning_secs;
        if low_time {
            self.low_time_signalled = true;
        }

        if self.remaining == 0 {
            self.expired_signalled = true;
            self.clear_persisted();
            debug!(section = %self.section_id, "timer expired");
            return TickOutcome {
                remaining: 0,
                deducted,
                expired: true,
                low_time,
            };
        }

        if let Err(e) = self
            .store
            .set(&timer_key(&self.section_id), &self.remaining.to_string())
        {
            warn!(section = %self.section_id, "failed to persist timer: {e}");
        }

        TickOutcome {
            remaining: self.remaining,
            deducted,
            expired: false,
            low_time,
        }
    }

    fn deduction_for(&mut self, elapsed_ms: i64) -> u64 {
        if elapsed_ms <= 0 {
            self.carry_ms = 0;
            return 0;
        }
        let gap_secs = (elapsed_ms as u64 + 500) / 1000;
        if gap_secs > self.policy.anomaly_threshold_secs {
            debug!(
                section = %self.section_id,
                gap_secs,
                "tick gap above anomaly threshold"
            );
            self.carry_ms = 0;
            return self.policy.anomaly_deduction_secs;
        }
        // Round the running total to whole seconds, half up.
        let total_ms = self.carry_ms + elapsed_ms;
        let secs = (total_ms + 500).div_euclid(1000);
        self.carry_ms = total_ms - secs * 1000;
        secs as u64
    }

    /// Persist zero remaining time for this section.
    pub fn persist_exhausted(&self) {
        if let Err(e) = self.store.set(&timer_key(&self.section_id), "0") {
            warn!(section = %self.section_id, "failed to persist timer: {e}");
        }
    }

    /// Remove this section's persisted remaining time.
    pub fn clear_persisted(&self) {
        if let Err(e) = self.store.remove(&timer_key(&self.section_id)) {
            warn!(section = %self.section_id, "failed to clear timer: {e}");
        }
    }

    pub fn section_id(&self) -> &str {
        &self.section_id
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn duration_secs(&self) -> u64 {
        self.duration_secs
    }
}

impl std::fmt::Debug for TimerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerEngine")
            .field("section_id", &self.section_id)
            .field("remaining", &self.remaining)
            .field("last_tick", &self.last_tick)
            .field("expired_signalled", &self.expired_signalled)
            .finish_non_exhaustive()
    }
}

/// Read a persisted remaining time. Negative, malformed or unreadable values
/// count as absent.
fn read_persisted(store: &dyn LocalStore, section_id: &str) -> Option<u64> {
    let raw = match store.get(&timer_key(section_id)) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            warn!(section = %section_id, "failed to read timer: {e}");
            return None;
        }
    };
    match raw.trim().parse::<i64>() {
        Ok(secs) if secs >= 0 => Some(secs as u64),
        _ => {
            warn!(section = %section_id, value = %raw, "discarding invalid persisted timer");
            None
        }
    }
}
