//! Cycle accumulator state machine.
//!
//! Turns raw, possibly decreasing counter values into monotonic cycle progress.
//! The accumulator is synchronous and performs no I/O: every input returns the
//! [`Effect`]s the owning instance has to carry out (persistence and message
//! store calls), in the order they were decided.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_core::config::EXTERNAL_RESET_REASON;
use tally_messages::CauseElimination;
use tally_storage::{CounterPatch, CounterState};

use crate::config::CycleConfig;

/// Whether a cycle message is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Active,
}

/// Side effect decided by the accumulator.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Persist the changed fields.
    Persist(CounterPatch),
    /// Threshold reached: open the message.
    Open { sub_counter: f64 },
    /// Progress changed while active: refresh metrics.
    Refresh { sub_counter: f64 },
    /// Tick while active.
    Heartbeat { sub_counter: f64 },
    /// External reset while active.
    EliminateCause(CauseElimination),
}

/// Accumulator of one rule instance.
#[derive(Debug, Clone)]
pub struct CycleAccumulator {
    period: f64,
    min_elapsed: Option<chrono::Duration>,
    /// `None` until loaded from the store or created by the first event.
    state: Option<CounterState>,
    phase: Phase,
}

impl CycleAccumulator {
    /// Accumulator without persisted state.
    pub fn new(config: &CycleConfig) -> Self {
        Self {
            period: config.period,
            min_elapsed: config
                .min_elapsed()
                .and_then(|d| chrono::Duration::from_std(d).ok()),
            state: None,
            phase: Phase::Idle,
        }
    }

    /// Accumulator continuing from a persisted record.
    ///
    /// A record that already completed a cycle comes up active and re-opens its
    /// message; writers treat the repeated upsert as a no-op.
    pub fn resume(
        config: &CycleConfig,
        loaded: Option<CounterState>,
        now: DateTime<Utc>,
    ) -> (Self, Vec<Effect>) {
        let mut acc = Self::new(config);
        let mut effects = Vec::new();

        if let Some(mut state) = loaded {
            if !state.sub_counter.is_finite() || state.sub_counter < 0.0 {
                tracing::warn!(
                    sub_counter = state.sub_counter,
                    "Persisted subCounter out of range, resetting to 0"
                );
                state.sub_counter = 0.0;
                effects.push(Effect::Persist(CounterPatch::default().sub_counter(0.0)));
            }
            acc.state = Some(state);
            if acc.threshold_reached() && acc.gate_open(now) {
                acc.phase = Phase::Active;
                effects.push(Effect::Open {
                    sub_counter: acc.sub_counter(),
                });
            }
        }

        (acc, effects)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase == Phase::Active
    }

    pub fn state(&self) -> Option<&CounterState> {
        self.state.as_ref()
    }

    pub fn sub_counter(&self) -> f64 {
        self.state.as_ref().map(|s| s.sub_counter).unwrap_or(0.0)
    }

    pub fn period(&self) -> f64 {
        self.period
    }

    /// A new raw value of the target signal.
    pub fn on_raw_value(&mut self, val: f64, now: DateTime<Utc>) -> Vec<Effect> {
        if !val.is_finite() {
            tracing::debug!(val, "Dropping non-finite raw value");
            return Vec::new();
        }
        let mut effects = Vec::new();
        let (state, mut patch) = self.state_for_update(now);

        let mut progressed = false;
        match state.last_counter {
            None => {
                // Baseline only
                state.last_counter = Some(val);
                patch.last_counter = Some(val);
            }
            Some(last) if val > last => {
                let next = state.sub_counter + (val - last);
                state.last_counter = Some(val);
                patch.last_counter = Some(val);
                if next.is_finite() {
                    state.sub_counter = next;
                    patch.sub_counter = Some(next);
                    progressed = true;
                } else {
                    // A record holding an infinite subCounter could not be read back
                    tracing::warn!(last, val, sub_counter = state.sub_counter, "Delta overflows subCounter, rebasing");
                }
            }
            Some(last) => {
                // Device-side rollback: rebase without losing progress
                if val != last {
                    state.last_counter = Some(val);
                    patch.last_counter = Some(val);
                }
            }
        }

        if !patch.is_empty() {
            effects.push(Effect::Persist(patch));
        }
        effects.extend(self.evaluate(now, progressed));
        effects
    }

    /// The persisted `subCounter` mirror was written.
    ///
    /// Only an unacknowledged write of `0` is an external reset; acknowledged
    /// writes are the engine's own.
    pub fn on_override(&mut self, val: f64, ack: bool, now: DateTime<Utc>) -> Vec<Effect> {
        if ack || !val.is_finite() || val != 0.0 {
            tracing::debug!(val, ack, "Ignoring subCounter write");
            return Vec::new();
        }

        let was_active = self.is_active();
        let mut effects = Vec::new();
        if was_active {
            effects.push(Effect::EliminateCause(CauseElimination::new(
                EXTERNAL_RESET_REASON,
                now,
            )));
        }
        effects.push(Effect::Persist(self.reset(now)));
        effects
    }

    /// Periodic tick.
    pub fn on_tick(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        match self.phase {
            Phase::Active => vec![Effect::Heartbeat {
                sub_counter: self.sub_counter(),
            }],
            // The elapsed gate may have opened since the last event
            Phase::Idle => self.evaluate(now, false).into_iter().collect(),
        }
    }

    /// The message was closed through its close action.
    ///
    /// `lastCounter` is kept so the next delta is measured from the physical
    /// baseline.
    pub fn on_close_action(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        vec![Effect::Persist(self.reset(now))]
    }

    fn reset(&mut self, now: DateTime<Utc>) -> CounterPatch {
        let (state, patch) = self.state_for_update(now);
        state.sub_counter = 0.0;
        state.last_reset_at = now;
        let patch = patch.sub_counter(0.0).last_reset_at(now);
        self.phase = Phase::Idle;
        patch
    }

    /// Mutable state plus the patch that creating it requires.
    fn state_for_update(&mut self, now: DateTime<Utc>) -> (&mut CounterState, CounterPatch) {
        let created = self.state.is_none();
        let state = self.state.get_or_insert_with(|| CounterState::fresh(now));
        let patch = if created {
            CounterPatch::full(state)
        } else {
            CounterPatch::default()
        };
        (state, patch)
    }

    fn threshold_reached(&self) -> bool {
        self.state
            .as_ref()
            .map(|s| s.sub_counter >= self.period)
            .unwrap_or(false)
    }

    fn gate_open(&self, now: DateTime<Utc>) -> bool {
        match (self.min_elapsed, &self.state) {
            (Some(min), Some(state)) => now.signed_duration_since(state.last_reset_at) >= min,
            _ => true,
        }
    }

    fn evaluate(&mut self, now: DateTime<Utc>, progressed: bool) -> Option<Effect> {
        match self.phase {
            Phase::Idle => {
                if !self.threshold_reached() {
                    return None;
                }
                if !self.gate_open(now) {
                    tracing::debug!(
                        sub_counter = self.sub_counter(),
                        "Threshold reached, waiting for minimum elapsed time"
                    );
                    return None;
                }
                self.phase = Phase::Active;
                Some(Effect::Open {
                    sub_counter: self.sub_counter(),
                })
            }
            Phase::Active if progressed => Some(Effect::Refresh {
                sub_counter: self.sub_counter(),
            }),
            Phase::Active => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn acc(period: f64) -> CycleAccumulator {
        CycleAccumulator::new(&CycleConfig::new(period))
    }

    fn feed(acc: &mut CycleAccumulator, values: &[f64]) -> Vec<Effect> {
        let now = Utc::now();
        values
            .iter()
            .flat_map(|v| acc.on_raw_value(*v, now))
            .collect()
    }

    fn opens(effects: &[Effect]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::Open { .. }))
            .count()
    }

    #[test]
    fn test_first_value_is_baseline() {
        let mut acc = acc(100.0);
        let now = Utc::now();
        let effects = acc.on_raw_value(42.0, now);

        let state = acc.state().unwrap();
        assert_eq!(state.last_counter, Some(42.0));
        assert_eq!(state.sub_counter, 0.0);
        assert_eq!(state.last_reset_at, now);
        // The record is created in one full write, no message effects
        assert_eq!(
            effects,
            vec![Effect::Persist(CounterPatch {
                last_counter: Some(42.0),
                sub_counter: Some(0.0),
                last_reset_at: Some(now),
            })]
        );
    }

    #[test]
    fn test_increasing_sequence() {
        let mut acc = acc(1000.0);
        feed(&mut acc, &[3.0, 5.0, 9.0, 20.0]);
        assert_eq!(acc.sub_counter(), 17.0);
    }

    #[test]
    fn test_rollback_keeps_progress() {
        let mut acc = acc(1000.0);
        feed(&mut acc, &[10.0, 15.0, 2.0, 3.0]);
        assert_eq!(acc.sub_counter(), 6.0);
        assert_eq!(acc.state().unwrap().last_counter, Some(3.0));
    }

    #[test]
    fn test_overflowing_delta_rebases() {
        let mut acc = acc(1e300);
        feed(&mut acc, &[-1.7e308]);

        // 1.7e308 - (-1.7e308) is not representable
        let effects = acc.on_raw_value(1.7e308, Utc::now());
        assert_eq!(acc.sub_counter(), 0.0);
        assert_eq!(acc.state().unwrap().last_counter, Some(1.7e308));
        assert_eq!(
            effects,
            vec![Effect::Persist(CounterPatch::default().last_counter(1.7e308))]
        );

        // Later deltas are measured from the rebased value
        feed(&mut acc, &[1.79e308]);
        let sub = acc.sub_counter();
        assert!(sub.is_finite() && sub > 0.0);
    }

    #[test]
    fn test_non_finite_values_are_dropped() {
        let mut acc = acc(1000.0);
        feed(&mut acc, &[10.0]);
        assert!(acc.on_raw_value(f64::NAN, Utc::now()).is_empty());
        assert!(acc.on_raw_value(f64::INFINITY, Utc::now()).is_empty());
        assert_eq!(acc.state().unwrap().last_counter, Some(10.0));

        feed(&mut acc, &[15.0]);
        assert_eq!(acc.sub_counter(), 5.0);

        assert!(acc.on_override(f64::NAN, false, Utc::now()).is_empty());
        assert_eq!(acc.sub_counter(), 5.0);
    }

    #[test]
    fn test_repeated_value_is_silent() {
        let mut acc = acc(10.0);
        feed(&mut acc, &[1.0]);
        assert!(acc.on_raw_value(1.0, Utc::now()).is_empty());
    }

    #[test]
    fn test_activation_then_refresh() {
        let mut acc = acc(10.0);
        let effects = feed(&mut acc, &[0.0, 4.0, 10.0]);
        assert_eq!(opens(&effects), 1);
        assert!(acc.is_active());

        let effects = acc.on_raw_value(12.0, Utc::now());
        assert_eq!(opens(&effects), 0);
        assert!(effects.contains(&Effect::Refresh { sub_counter: 12.0 }));

        // Rollback while active changes nothing observable
        let effects = acc.on_raw_value(1.0, Utc::now());
        assert_eq!(
            effects,
            vec![Effect::Persist(CounterPatch::default().last_counter(1.0))]
        );
    }

    #[test]
    fn test_idle_tick_is_noop() {
        let mut acc = acc(10.0);
        assert!(acc.on_tick(Utc::now()).is_empty());
        feed(&mut acc, &[0.0, 3.0]);
        assert!(acc.on_tick(Utc::now()).is_empty());
    }

    #[test]
    fn test_active_tick_heartbeat() {
        let mut acc = acc(5.0);
        feed(&mut acc, &[0.0, 6.0]);
        assert_eq!(
            acc.on_tick(Utc::now()),
            vec![Effect::Heartbeat { sub_counter: 6.0 }]
        );
    }

    #[test]
    fn test_external_reset_while_active() {
        let mut acc = acc(5.0);
        feed(&mut acc, &[0.0, 6.0]);

        let now = Utc::now();
        let effects = acc.on_override(0.0, false, now);
        assert!(matches!(&effects[0], Effect::EliminateCause(e) if e.reason == "external-reset"));
        assert_eq!(acc.sub_counter(), 0.0);
        assert_eq!(acc.phase(), Phase::Idle);
        assert_eq!(acc.state().unwrap().last_reset_at, now);

        // A second reset finds nothing to eliminate
        let effects = acc.on_override(0.0, false, Utc::now());
        assert!(!effects.iter().any(|e| matches!(e, Effect::EliminateCause(_))));
    }

    #[test]
    fn test_acknowledged_or_nonzero_override_ignored() {
        let mut acc = acc(5.0);
        feed(&mut acc, &[0.0, 6.0]);

        assert!(acc.on_override(0.0, true, Utc::now()).is_empty());
        assert!(acc.on_override(3.0, false, Utc::now()).is_empty());
        assert!(acc.is_active());
        assert_eq!(acc.sub_counter(), 6.0);
    }

    #[test]
    fn test_close_action_keeps_baseline() {
        let mut acc = acc(5.0);
        feed(&mut acc, &[10.0, 16.0]);

        let now = Utc::now();
        let effects = acc.on_close_action(now);
        assert_eq!(
            effects,
            vec![Effect::Persist(
                CounterPatch::default().sub_counter(0.0).last_reset_at(now)
            )]
        );
        assert_eq!(acc.state().unwrap().last_counter, Some(16.0));

        feed(&mut acc, &[18.0]);
        assert_eq!(acc.sub_counter(), 2.0);
    }

    #[test]
    fn test_resume_continues_progress() {
        let config = CycleConfig::new(100.0);
        let loaded = CounterState {
            last_counter: Some(10.0),
            sub_counter: 5.0,
            last_reset_at: Utc::now(),
        };
        let (mut acc, effects) = CycleAccumulator::resume(&config, Some(loaded), Utc::now());
        assert!(effects.is_empty());

        acc.on_raw_value(13.0, Utc::now());
        assert_eq!(acc.sub_counter(), 8.0);
    }

    #[test]
    fn test_resume_completed_cycle_reopens() {
        let config = CycleConfig::new(5.0);
        let loaded = CounterState {
            last_counter: Some(10.0),
            sub_counter: 7.0,
            last_reset_at: Utc::now(),
        };
        let (acc, effects) = CycleAccumulator::resume(&config, Some(loaded), Utc::now());
        assert!(acc.is_active());
        assert_eq!(effects, vec![Effect::Open { sub_counter: 7.0 }]);
    }

    #[test]
    fn test_resume_repairs_negative_sub_counter() {
        let loaded = CounterState {
            last_counter: Some(1.0),
            sub_counter: -4.0,
            last_reset_at: Utc::now(),
        };
        let (acc, effects) =
            CycleAccumulator::resume(&CycleConfig::new(5.0), Some(loaded), Utc::now());
        assert_eq!(acc.sub_counter(), 0.0);
        assert_eq!(
            effects,
            vec![Effect::Persist(CounterPatch::default().sub_counter(0.0))]
        );
    }

    #[test]
    fn test_elapsed_gate_delays_activation() {
        let config = CycleConfig::new(5.0).with_min_elapsed(std::time::Duration::from_secs(3600));
        let mut acc = CycleAccumulator::new(&config);
        let start = Utc::now();

        acc.on_raw_value(0.0, start);
        let effects = acc.on_raw_value(10.0, start + Duration::minutes(5));
        assert_eq!(opens(&effects), 0);
        assert!(!acc.is_active());

        // Still closed
        assert!(acc.on_tick(start + Duration::minutes(30)).is_empty());

        let effects = acc.on_tick(start + Duration::hours(2));
        assert_eq!(effects, vec![Effect::Open { sub_counter: 10.0 }]);
        assert!(acc.is_active());
    }

    #[test]
    fn test_override_on_fresh_instance_creates_record() {
        let mut acc = acc(5.0);
        let now = Utc::now();
        let effects = acc.on_override(0.0, false, now);
        assert_eq!(
            effects,
            vec![Effect::Persist(CounterPatch {
                last_counter: None,
                sub_counter: Some(0.0),
                last_reset_at: Some(now),
            })]
        );
        assert_eq!(acc.state().unwrap().last_counter, None);
    }
}
