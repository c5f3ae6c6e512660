//! Decision Tracker
//!
//! Every approve/block verdict from the gating pipeline lands here twice
//! over: once as a `DecisionEvent` on the dedicated decisions log (enriched
//! with a best-effort market snapshot) and once as a state change on the
//! signal bus. The duplication is deliberate: analytics reads the decisions
//! log without replaying bus history.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::event_log::EventLog;
use crate::feed::PriceFeed;
use crate::signal_bus::SignalBus;
use crate::types::{
    now_ms, rfc3339, Decision, DecisionEvent, MarketSnapshot, SignalState, StrategyMeta,
};

pub struct DecisionTracker {
    bus: Arc<SignalBus>,
    /// Market context source; None means snapshots are skipped entirely
    feed: Option<Arc<dyn PriceFeed>>,
    log: Mutex<EventLog>,
    log_path: PathBuf,
}

impl DecisionTracker {
    pub fn open(
        bus: Arc<SignalBus>,
        feed: Option<Arc<dyn PriceFeed>>,
        log_path: impl AsRef<Path>,
    ) -> anyhow::Result<Self> {
        let log_path = log_path.as_ref().to_path_buf();
        let log = EventLog::open(&log_path)?;
        info!(path = %log_path.display(), "📋 Decision tracker opened");
        Ok(Self {
            bus,
            feed,
            log: Mutex::new(log),
            log_path,
        })
    }

    /// Record a pipeline verdict for a signal. The DecisionEvent is built
    /// from the caller-supplied `symbol`/`signal_metadata`, falling back to
    /// the bus record when those are absent, and is always appended to the
    /// decisions log - the log does not depend on the bus index, which is
    /// empty after a restart. Only the state mirror onto the bus degrades
    /// to a no-op when the bus does not know the signal. Returns false only
    /// when the log append itself failed.
    pub async fn track_decision(
        &self,
        signal_id: &str,
        decision: Decision,
        blocker_component: &str,
        blocker_reason: &str,
        symbol: Option<&str>,
        signal_metadata: Option<StrategyMeta>,
    ) -> bool {
        let record = self.bus.get_signal(signal_id);

        let symbol = symbol
            .map(|s| s.to_string())
            .or_else(|| record.as_ref().map(|r| r.signal.symbol.clone()))
            .unwrap_or_default();
        let signal_metadata =
            signal_metadata.or_else(|| record.as_ref().map(|r| r.signal.strategy.clone()));

        let snapshot = if symbol.is_empty() {
            None
        } else {
            self.capture_snapshot(&symbol).await
        };
        let ts = now_ms();
        let event = DecisionEvent {
            ts,
            timestamp: rfc3339(ts),
            signal_id: signal_id.to_string(),
            symbol,
            decision,
            blocker_component: blocker_component.to_string(),
            blocker_reason: blocker_reason.to_string(),
            market_snapshot: snapshot,
            signal_metadata,
        };

        let appended = {
            let mut log = match self.log.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            match log.append(&event) {
                Ok(()) => true,
                Err(e) => {
                    warn!(signal_id = %signal_id, error = %e, "Failed appending decision event");
                    false
                }
            }
        };

        // Cancelled verdicts are log-only; the other three mirror onto the bus
        let new_state = match decision {
            Decision::Approved => Some(SignalState::Approved),
            Decision::Blocked => Some(SignalState::Blocked),
            Decision::Expired => Some(SignalState::Expired),
            Decision::Cancelled => None,
        };
        match (new_state, record.is_some()) {
            (Some(new_state), true) => {
                let mut metadata = Map::new();
                metadata.insert(
                    "blocker_component".to_string(),
                    Value::String(blocker_component.to_string()),
                );
                self.bus
                    .update_state(signal_id, new_state, Some(metadata), Some(blocker_reason));
            }
            (Some(_), false) => {
                warn!(signal_id = %signal_id, "Signal not indexed, decision logged without state mirror");
            }
            (None, _) => {}
        }

        info!(
            signal_id = %signal_id,
            decision = ?decision,
            component = %blocker_component,
            "📋 Decision tracked"
        );
        appended
    }

    /// Convenience wrapper for a block verdict
    pub async fn track_block(&self, signal_id: &str, component: &str, reason: &str) -> bool {
        self.track_decision(signal_id, Decision::Blocked, component, reason, None, None)
            .await
    }

    /// Convenience wrapper for an approval
    pub async fn track_approval(&self, signal_id: &str) -> bool {
        self.track_decision(signal_id, Decision::Approved, "pipeline", "approved", None, None)
            .await
    }

    /// Parsed decisions since `since_ts`, oldest first. Unparseable lines
    /// are skipped.
    pub fn read_decisions(&self, since_ts: Option<i64>) -> Vec<DecisionEvent> {
        let lines = EventLog::read_path(&self.log_path, since_ts).unwrap_or_default();
        lines
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    async fn capture_snapshot(&self, symbol: &str) -> Option<MarketSnapshot> {
        let feed = self.feed.as_ref()?;
        match feed.get_price(symbol).await {
            Ok(price) => Some(MarketSnapshot {
                price: Some(price),
                ..Default::default()
            }),
            Err(e) => {
                // Best effort: a dead feed never blocks decision recording
                warn!(symbol = %symbol, error = %e, "Snapshot price unavailable");
                Some(MarketSnapshot::default())
            }
        }
    }
}
