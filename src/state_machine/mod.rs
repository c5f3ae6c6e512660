//! Signal State Machine - lifecycle transition enforcement
//!
//! Validates transitions against the fixed table in
//! [`SignalState::valid_next_states`], detects stuck signals and sweeps
//! stale ones to EXPIRED. Validation and application happen under the bus's
//! lock, so concurrent attempts for the same signal are resolved by lock
//! ordering (the loser is re-validated against the winner's result).
//!
//! The per-signal transition history kept here is in-memory audit context
//! only; a restart loses it while the durable event log retains the
//! authoritative record.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::signal_bus::{SignalBus, SignalFilter, StuckSignal, TransitionOutcome};
use crate::types::{now_ms, SignalState};

/// One entry in the in-memory transition history
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub old_state: SignalState,
    pub new_state: SignalState,
    pub ts: i64,
    pub reason: Option<String>,
}

/// State machine service over a shared [`SignalBus`]
pub struct SignalStateMachine {
    bus: Arc<SignalBus>,
    history: Mutex<HashMap<String, Vec<TransitionRecord>>>,
}

impl SignalStateMachine {
    pub fn new(bus: Arc<SignalBus>) -> Self {
        Self {
            bus,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Attempt a lifecycle transition. Invalid transitions are rejected with
    /// a warning and no mutation; unknown signals return false the same way.
    pub fn transition(
        &self,
        signal_id: &str,
        new_state: SignalState,
        metadata: Option<Map<String, Value>>,
        reason: Option<&str>,
    ) -> bool {
        match self.bus.apply_transition(signal_id, new_state, metadata, reason) {
            TransitionOutcome::Applied(old_state) => {
                if let Ok(mut history) = self.history.lock() {
                    history.entry(signal_id.to_string()).or_default().push(
                        TransitionRecord {
                            old_state,
                            new_state,
                            ts: now_ms(),
                            reason: reason.map(|r| r.to_string()),
                        },
                    );
                }
                true
            }
            TransitionOutcome::Invalid(current) => {
                warn!(
                    signal_id = %signal_id,
                    current = %current,
                    attempted = %new_state,
                    "Invalid signal transition rejected"
                );
                false
            }
            TransitionOutcome::NotFound => {
                warn!(signal_id = %signal_id, "Transition on unknown signal");
                false
            }
        }
    }

    /// In-memory transition history for one signal (empty after a restart)
    pub fn get_transition_history(&self, signal_id: &str) -> Vec<TransitionRecord> {
        self.history
            .lock()
            .map(|h| h.get(signal_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Non-terminal signals whose last state change is older than
    /// `max_age_secs`. A signal exactly at the threshold is not yet stuck.
    /// Pure read, no side effects.
    pub fn get_stuck_signals(&self, max_age_secs: i64) -> Vec<StuckSignal> {
        let now = now_ms();
        self.bus
            .get_signals(&SignalFilter::default())
            .into_iter()
            .filter(|rec| !rec.state.is_terminal())
            .filter_map(|rec| {
                let age_ms = now - rec.last_state_change;
                if age_ms > max_age_secs * 1000 {
                    Some(StuckSignal {
                        signal_id: rec.signal_id,
                        symbol: rec.signal.symbol,
                        state: rec.state,
                        source: rec.source,
                        age_secs: age_ms / 1000,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    /// Force-expire non-terminal, non-executed signals older than
    /// `max_age_secs`. Each expiry goes through [`Self::transition`] so the
    /// validity table still applies; one failed transition does not abort
    /// the batch. Returns the count successfully expired.
    pub fn auto_expire_old_signals(&self, max_age_secs: i64) -> usize {
        let now = now_ms();
        let candidates: Vec<String> = self
            .bus
            .get_signals(&SignalFilter::default())
            .into_iter()
            .filter(|rec| !rec.state.is_terminal() && rec.state != SignalState::Executed)
            .filter(|rec| now - rec.last_state_change > max_age_secs * 1000)
            .map(|rec| rec.signal_id)
            .collect();

        let mut expired = 0usize;
        for signal_id in candidates {
            if self.transition(
                &signal_id,
                SignalState::Expired,
                None,
                Some("auto-expired: exceeded max age"),
            ) {
                expired += 1;
            }
        }
        if expired > 0 {
            info!(expired, max_age_secs, "⏳ Auto-expired stale signals");
        }
        expired
    }
}
