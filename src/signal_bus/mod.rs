//! Signal Bus - single source of truth for signal lifecycle state
//!
//! Maps `signal_id -> {payload, state, source, timestamps}` backed by the
//! append-only event log. One lock guards both the log append and the index
//! mutation, so the pair is atomic relative to every other bus operation
//! (simplicity over throughput - appropriate at low-thousands of signals
//! per day).
//!
//! The index starts empty on every construction: durable events are for
//! audit/replay, not automatic recovery. Callers that want replay-on-startup
//! opt in explicitly via [`SignalBus::rebuild_index_from_log`].

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::event_log::EventLog;
use crate::types::{generate_signal_id, now_ms, rfc3339, BusEvent, Signal, SignalState};

/// Default stuck threshold: one hour without a state change
pub const DEFAULT_STUCK_AFTER_SECS: i64 = 3600;

/// Indexed record for one signal
#[derive(Debug, Clone, Serialize)]
pub struct SignalRecord {
    pub signal_id: String,
    pub signal: Signal,
    pub source: String,
    pub state: SignalState,
    /// Epoch ms when the signal was emitted
    pub created_ts: i64,
    /// Epoch ms of the most recent state change (creation time if none)
    pub last_state_change: i64,
    /// Metadata merged in across state updates
    pub metadata: Map<String, Value>,
}

/// Conjunctive filters for [`SignalBus::get_signals`]; all optional.
#[derive(Debug, Clone, Default)]
pub struct SignalFilter {
    pub state: Option<SignalState>,
    pub symbol: Option<String>,
    pub source: Option<String>,
    pub since_ts: Option<i64>,
    pub limit: Option<usize>,
}

/// A non-terminal signal that has gone too long without a state change
#[derive(Debug, Clone, Serialize)]
pub struct StuckSignal {
    pub signal_id: String,
    pub symbol: String,
    pub state: SignalState,
    pub source: String,
    pub age_secs: i64,
}

/// On-demand health snapshot of the bus index
#[derive(Debug, Clone, Serialize)]
pub struct PipelineHealth {
    pub ts: i64,
    pub total_signals: usize,
    pub by_state: HashMap<String, usize>,
    pub by_source: HashMap<String, usize>,
    pub stuck: Vec<StuckSignal>,
}

/// Outcome of a validated transition attempt (used by the state machine)
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// Transition applied; carries the previous state
    Applied(SignalState),
    /// Rejected by the transition table; carries the current state
    Invalid(SignalState),
    /// No such signal in the index
    NotFound,
}

struct BusInner {
    index: HashMap<String, SignalRecord>,
    log: EventLog,
}

/// Signal Bus service. Construct once per process and share via `Arc`.
pub struct SignalBus {
    inner: Mutex<BusInner>,
    stuck_after_secs: i64,
}

impl SignalBus {
    /// Open the bus over the event log at `log_path`. The in-memory index
    /// starts empty regardless of what the log contains.
    pub fn open(log_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::open_with_stuck_threshold(log_path, DEFAULT_STUCK_AFTER_SECS)
    }

    pub fn open_with_stuck_threshold(
        log_path: impl AsRef<Path>,
        stuck_after_secs: i64,
    ) -> anyhow::Result<Self> {
        let log = EventLog::open(log_path)?;
        info!(path = %log.path().display(), "📡 Signal bus opened");
        Ok(Self {
            inner: Mutex::new(BusInner {
                index: HashMap::new(),
                log,
            }),
            stuck_after_secs,
        })
    }

    /// Emit a new signal. Assigns a fresh unique ID, stamps creation time if
    /// absent, appends a `signal_generated` event and indexes the signal as
    /// GENERATED. A failed log append is logged as a warning; the index is
    /// still updated for the current process session (documented durability
    /// risk window - the design favors in-memory consistency).
    pub fn emit_signal(&self, mut signal: Signal, source: &str) -> String {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        if signal.ts == 0 {
            signal.ts = now_ms();
        }
        let mut signal_id = generate_signal_id(&signal.symbol);
        // The random suffix makes collisions vanishingly rare; regenerate
        // under the lock if one happens anyway.
        while inner.index.contains_key(&signal_id) {
            signal_id = generate_signal_id(&signal.symbol);
        }

        let ts = now_ms();
        let event = BusEvent::SignalGenerated {
            event_id: Uuid::new_v4().to_string(),
            signal_id: signal_id.clone(),
            ts,
            timestamp: rfc3339(ts),
            source: source.to_string(),
            signal: signal.clone(),
            state: SignalState::Generated,
        };
        if let Err(e) = inner.log.append(&event) {
            warn!(signal_id = %signal_id, error = %e, "Failed appending signal_generated event");
        }

        inner.index.insert(
            signal_id.clone(),
            SignalRecord {
                signal_id: signal_id.clone(),
                signal,
                source: source.to_string(),
                state: SignalState::Generated,
                created_ts: ts,
                last_state_change: ts,
                metadata: Map::new(),
            },
        );

        signal_id
    }

    /// Unconditionally move a signal to `new_state`. Returns false when the
    /// signal is unknown (an expected query outcome, not an error). Appends a
    /// `state_change` event and merges `metadata` into the index entry.
    pub fn update_state(
        &self,
        signal_id: &str,
        new_state: SignalState,
        metadata: Option<Map<String, Value>>,
        reason: Option<&str>,
    ) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let old_state = match inner.index.get(signal_id) {
            Some(rec) => rec.state,
            None => return false,
        };
        Self::apply_state_change(&mut inner, signal_id, old_state, new_state, metadata, reason);
        true
    }

    /// Move a signal to `new_state` only if the transition table allows it
    /// from the current indexed state. Validation and application happen
    /// under the same lock acquisition, so two concurrent attempts for the
    /// same signal are serialized: the second sees the first's result and is
    /// validated against it.
    pub fn apply_transition(
        &self,
        signal_id: &str,
        new_state: SignalState,
        metadata: Option<Map<String, Value>>,
        reason: Option<&str>,
    ) -> TransitionOutcome {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let current = match inner.index.get(signal_id) {
            Some(rec) => rec.state,
            None => return TransitionOutcome::NotFound,
        };
        if !current.can_transition_to(new_state) {
            return TransitionOutcome::Invalid(current);
        }
        Self::apply_state_change(&mut inner, signal_id, current, new_state, metadata, reason);
        TransitionOutcome::Applied(current)
    }

    fn apply_state_change(
        inner: &mut BusInner,
        signal_id: &str,
        old_state: SignalState,
        new_state: SignalState,
        metadata: Option<Map<String, Value>>,
        reason: Option<&str>,
    ) {
        let ts = now_ms();
        let event = BusEvent::StateChange {
            event_id: Uuid::new_v4().to_string(),
            signal_id: signal_id.to_string(),
            old_state,
            new_state,
            ts,
            timestamp: rfc3339(ts),
            reason: reason.map(|r| r.to_string()),
            metadata: metadata.clone(),
        };
        if let Err(e) = inner.log.append(&event) {
            warn!(signal_id = %signal_id, error = %e, "Failed appending state_change event");
        }

        if let Some(rec) = inner.index.get_mut(signal_id) {
            rec.state = new_state;
            rec.last_state_change = ts;
            if let Some(meta) = metadata {
                for (k, v) in meta {
                    rec.metadata.insert(k, v);
                }
            }
        }
    }

    /// Look up one signal record
    pub fn get_signal(&self, signal_id: &str) -> Option<SignalRecord> {
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.index.get(signal_id).cloned()
    }

    /// Filtered query, newest-first. All filters are conjunctive.
    pub fn get_signals(&self, filter: &SignalFilter) -> Vec<SignalRecord> {
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut records: Vec<SignalRecord> = inner
            .index
            .values()
            .filter(|rec| {
                filter.state.map_or(true, |s| rec.state == s)
                    && filter
                        .symbol
                        .as_ref()
                        .map_or(true, |sym| rec.signal.symbol == *sym)
                    && filter
                        .source
                        .as_ref()
                        .map_or(true, |src| rec.source == *src)
                    && filter.since_ts.map_or(true, |ts| rec.created_ts >= ts)
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_ts.cmp(&a.created_ts));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        records
    }

    /// Compute a health snapshot on demand from the index (never cached)
    pub fn get_pipeline_health(&self) -> PipelineHealth {
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = now_ms();
        let mut by_state: HashMap<String, usize> = HashMap::new();
        let mut by_source: HashMap<String, usize> = HashMap::new();
        let mut stuck = Vec::new();

        for rec in inner.index.values() {
            *by_state.entry(rec.state.as_str().to_string()).or_insert(0) += 1;
            *by_source.entry(rec.source.clone()).or_insert(0) += 1;

            if !rec.state.is_terminal() {
                // Millisecond comparison so a signal exactly at the
                // threshold is not yet stuck
                let age_ms = now - rec.last_state_change;
                if age_ms > self.stuck_after_secs * 1000 {
                    stuck.push(StuckSignal {
                        signal_id: rec.signal_id.clone(),
                        symbol: rec.signal.symbol.clone(),
                        state: rec.state,
                        source: rec.source.clone(),
                        age_secs: age_ms / 1000,
                    });
                }
            }
        }

        PipelineHealth {
            ts: now,
            total_signals: inner.index.len(),
            by_state,
            by_source,
            stuck,
        }
    }

    /// Read typed events back from the durable log, independent of the
    /// in-memory index. Unparseable records are skipped.
    pub fn replay_events(&self, since_ts: Option<i64>) -> Vec<BusEvent> {
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let raw = match inner.log.read_all(since_ts) {
            Ok(values) => values,
            Err(e) => {
                warn!(error = %e, "Failed reading event log for replay");
                return Vec::new();
            }
        };
        raw.into_iter()
            .filter_map(|v| serde_json::from_value::<BusEvent>(v).ok())
            .collect()
    }

    /// Fold events in timestamp order into the current state per signal.
    /// This is the event-sourcing invariant: the fold must match the live
    /// index for every signal the index knows about.
    pub fn fold_current_states(events: &[BusEvent]) -> HashMap<String, SignalState> {
        let mut sorted: Vec<&BusEvent> = events.iter().collect();
        sorted.sort_by_key(|e| e.ts());

        let mut states = HashMap::new();
        for event in sorted {
            match event {
                BusEvent::SignalGenerated {
                    signal_id, state, ..
                } => {
                    states.insert(signal_id.clone(), *state);
                }
                BusEvent::StateChange {
                    signal_id,
                    new_state,
                    ..
                } => {
                    states.insert(signal_id.clone(), *new_state);
                }
            }
        }
        states
    }

    /// Explicit opt-in recovery: repopulate the index by replaying the
    /// durable log. Existing index entries for replayed IDs are overwritten.
    /// Deliberately NOT called by constructors (see module docs).
    pub fn rebuild_index_from_log(&self) -> usize {
        let events = self.replay_events(None);
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut sorted: Vec<&BusEvent> = events.iter().collect();
        sorted.sort_by_key(|e| e.ts());

        let mut rebuilt = 0usize;
        for event in sorted {
            match event {
                BusEvent::SignalGenerated {
                    signal_id,
                    ts,
                    source,
                    signal,
                    state,
                    ..
                } => {
                    inner.index.insert(
                        signal_id.clone(),
                        SignalRecord {
                            signal_id: signal_id.clone(),
                            signal: signal.clone(),
                            source: source.clone(),
                            state: *state,
                            created_ts: *ts,
                            last_state_change: *ts,
                            metadata: Map::new(),
                        },
                    );
                    rebuilt += 1;
                }
                BusEvent::StateChange {
                    signal_id,
                    new_state,
                    ts,
                    metadata,
                    ..
                } => {
                    if let Some(rec) = inner.index.get_mut(signal_id) {
                        rec.state = *new_state;
                        rec.last_state_change = *ts;
                        if let Some(meta) = metadata {
                            for (k, v) in meta {
                                rec.metadata.insert(k.clone(), v.clone());
                            }
                        }
                    }
                }
            }
        }
        info!(rebuilt, "🔄 Signal bus index rebuilt from event log");
        rebuilt
    }

    /// Stuck threshold in seconds this bus was configured with
    pub fn stuck_after_secs(&self) -> i64 {
        self.stuck_after_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, StrategyMeta};
    use std::collections::HashSet;

    fn make_signal(symbol: &str, direction: Direction) -> Signal {
        Signal::new(
            symbol,
            direction,
            StrategyMeta {
                name: "momentum_v1".to_string(),
                regime: Some("trending".to_string()),
                confidence: 0.8,
                indicators: vec!["rsi".to_string()],
            },
        )
    }

    fn open_bus(dir: &tempfile::TempDir) -> SignalBus {
        SignalBus::open(dir.path().join("signal_events.jsonl")).unwrap()
    }

    #[test]
    fn test_emit_assigns_unique_ids() {
        let dir = tempfile::tempdir().unwrap();
        let bus = open_bus(&dir);

        let mut ids = HashSet::new();
        for _ in 0..200 {
            ids.insert(bus.emit_signal(make_signal("BTCUSDT", Direction::Long), "strategy"));
        }
        assert_eq!(ids.len(), 200);
    }

    #[test]
    fn test_emit_indexes_as_generated() {
        let dir = tempfile::tempdir().unwrap();
        let bus = open_bus(&dir);

        let id = bus.emit_signal(make_signal("ETHUSDT", Direction::Short), "strategy");
        let rec = bus.get_signal(&id).unwrap();
        assert_eq!(rec.state, SignalState::Generated);
        assert_eq!(rec.signal.symbol, "ETHUSDT");
        assert_eq!(rec.source, "strategy");
        assert!(rec.created_ts > 0);
    }

    #[test]
    fn test_update_state_unknown_signal_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let bus = open_bus(&dir);
        assert!(!bus.update_state("nope", SignalState::Evaluating, None, None));
    }

    #[test]
    fn test_update_state_merges_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let bus = open_bus(&dir);

        let id = bus.emit_signal(make_signal("BTCUSDT", Direction::Long), "strategy");
        let mut meta = Map::new();
        meta.insert("gate".to_string(), serde_json::json!("RiskGate"));
        assert!(bus.update_state(&id, SignalState::Evaluating, Some(meta), Some("picked up")));

        let rec = bus.get_signal(&id).unwrap();
        assert_eq!(rec.state, SignalState::Evaluating);
        assert_eq!(rec.metadata["gate"], "RiskGate");
    }

    #[test]
    fn test_get_signals_filters_are_conjunctive() {
        let dir = tempfile::tempdir().unwrap();
        let bus = open_bus(&dir);

        bus.emit_signal(make_signal("BTCUSDT", Direction::Long), "strat_a");
        bus.emit_signal(make_signal("BTCUSDT", Direction::Long), "strat_b");
        bus.emit_signal(make_signal("ETHUSDT", Direction::Short), "strat_a");

        let btc_a = bus.get_signals(&SignalFilter {
            symbol: Some("BTCUSDT".to_string()),
            source: Some("strat_a".to_string()),
            ..Default::default()
        });
        assert_eq!(btc_a.len(), 1);

        let all = bus.get_signals(&SignalFilter::default());
        assert_eq!(all.len(), 3);

        let limited = bus.get_signals(&SignalFilter {
            limit: Some(2),
            ..Default::default()
        });
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_get_signals_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let bus = open_bus(&dir);

        let first = bus.emit_signal(make_signal("BTCUSDT", Direction::Long), "s");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = bus.emit_signal(make_signal("BTCUSDT", Direction::Long), "s");

        let all = bus.get_signals(&SignalFilter::default());
        assert_eq!(all[0].signal_id, second);
        assert_eq!(all[1].signal_id, first);
    }

    #[test]
    fn test_apply_transition_validates_against_current_state() {
        let dir = tempfile::tempdir().unwrap();
        let bus = open_bus(&dir);

        let id = bus.emit_signal(make_signal("BTCUSDT", Direction::Long), "s");
        assert_eq!(
            bus.apply_transition(&id, SignalState::Evaluating, None, None),
            TransitionOutcome::Applied(SignalState::Generated)
        );
        // EVALUATING -> EXECUTED skips APPROVED/EXECUTING and must be rejected
        assert_eq!(
            bus.apply_transition(&id, SignalState::Executed, None, None),
            TransitionOutcome::Invalid(SignalState::Evaluating)
        );
        assert_eq!(
            bus.apply_transition("missing", SignalState::Evaluating, None, None),
            TransitionOutcome::NotFound
        );
    }

    #[test]
    fn test_replay_matches_index_fold() {
        let dir = tempfile::tempdir().unwrap();
        let bus = open_bus(&dir);

        let a = bus.emit_signal(make_signal("BTCUSDT", Direction::Long), "s");
        let b = bus.emit_signal(make_signal("ETHUSDT", Direction::Short), "s");
        bus.update_state(&a, SignalState::Evaluating, None, None);
        bus.update_state(&a, SignalState::Blocked, None, Some("spread too wide"));
        bus.update_state(&b, SignalState::Evaluating, None, None);

        let events = bus.replay_events(None);
        let folded = SignalBus::fold_current_states(&events);
        assert_eq!(folded[&a], SignalState::Blocked);
        assert_eq!(folded[&b], SignalState::Evaluating);
        assert_eq!(folded[&a], bus.get_signal(&a).unwrap().state);
        assert_eq!(folded[&b], bus.get_signal(&b).unwrap().state);
    }

    #[test]
    fn test_index_empty_after_reopen_until_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signal_events.jsonl");

        let id = {
            let bus = SignalBus::open(&path).unwrap();
            let id = bus.emit_signal(make_signal("BTCUSDT", Direction::Long), "s");
            bus.update_state(&id, SignalState::Evaluating, None, None);
            id
        };

        let bus = SignalBus::open(&path).unwrap();
        assert!(bus.get_signal(&id).is_none());

        let rebuilt = bus.rebuild_index_from_log();
        assert_eq!(rebuilt, 1);
        assert_eq!(bus.get_signal(&id).unwrap().state, SignalState::Evaluating);
    }

    #[test]
    fn test_health_counts_by_state_and_source() {
        let dir = tempfile::tempdir().unwrap();
        let bus = open_bus(&dir);

        let a = bus.emit_signal(make_signal("BTCUSDT", Direction::Long), "strat_a");
        bus.emit_signal(make_signal("ETHUSDT", Direction::Short), "strat_b");
        bus.update_state(&a, SignalState::Evaluating, None, None);

        let health = bus.get_pipeline_health();
        assert_eq!(health.total_signals, 2);
        assert_eq!(health.by_state["EVALUATING"], 1);
        assert_eq!(health.by_state["GENERATED"], 1);
        assert_eq!(health.by_source["strat_a"], 1);
        assert!(health.stuck.is_empty());
    }
}
