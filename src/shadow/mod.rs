//! Shadow Execution Engine
//!
//! Maintains a virtual counterfactual portfolio: every signal gets a shadow
//! position against real market prices regardless of whether the real
//! pipeline approved or blocked it. Closed counterfactuals quantify what
//! each gate cost or saved.
//!
//! Shadow state is deliberately NOT transactional with bus/state-machine
//! state: a signal can be BLOCKED on the bus while its shadow position sits
//! OPEN here. The two subsystems share only the `signal_id` correlation key;
//! expiring a signal on the bus never cascades to its shadow position.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::event_log::EventLog;
use crate::types::{now_ms, rfc3339, Direction, Signal};

/// Default virtual position size
pub const DEFAULT_POSITION_SIZE_USD: f64 = 1000.0;
/// Bound on the in-memory closed-position ring; the on-disk results log is
/// unbounded
pub const MAX_CLOSED_POSITIONS: usize = 10_000;
/// Relative margin by which shadow must outperform live before guard
/// optimization is flagged
const GUARD_REVIEW_MARGIN: f64 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "CLOSED")]
    Closed,
}

/// A virtual trade correlated to a real signal by ID
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowPosition {
    pub signal_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub size_usd: f64,
    pub entry_price: f64,
    pub entry_ts: i64,
    /// Null until closed; entry fields are frozen once set
    pub exit_price: Option<f64>,
    pub exit_ts: Option<i64>,
    pub pnl_usd: f64,
    pub pnl_pct: f64,
    pub status: PositionStatus,
    /// Non-null means this position is the counterfactual for a signal the
    /// real pipeline blocked
    pub blocked_reason: Option<String>,
}

/// One record on the shadow results log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum ShadowRecord {
    #[serde(rename = "SHADOW_ENTRY")]
    Entry {
        ts: i64,
        timestamp: String,
        signal_id: String,
        symbol: String,
        direction: Direction,
        size_usd: f64,
        entry_price: f64,
        #[serde(default)]
        blocked_reason: Option<String>,
    },
    #[serde(rename = "SHADOW_EXIT")]
    Exit {
        ts: i64,
        timestamp: String,
        signal_id: String,
        symbol: String,
        direction: Direction,
        size_usd: f64,
        entry_price: f64,
        exit_price: f64,
        pnl_usd: f64,
        pnl_pct: f64,
        hold_secs: i64,
        #[serde(default)]
        blocked_reason: Option<String>,
    },
}

/// Lightweight open/closed count snapshot - a recovery hint for operators,
/// never authoritative
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShadowStateSnapshot {
    pub open_count: usize,
    pub closed_count: usize,
    pub total_pnl_usd: f64,
    pub saved_at: i64,
}

impl ShadowStateSnapshot {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let json = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&json)?)
    }

    fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Rolling performance summary over closed positions
#[derive(Debug, Clone, Serialize, Default)]
pub struct PerformanceSummary {
    pub total_trades: usize,
    pub total_pnl_usd: f64,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub avg_pnl_pct: f64,
}

/// Per-reason stats inside the blocked-opportunity report
#[derive(Debug, Clone, Serialize, Default)]
pub struct BlockedReasonStats {
    pub count: usize,
    pub total_pnl: f64,
    pub avg_pnl: f64,
}

/// What the gates cost: counterfactual P&L of blocked signals
#[derive(Debug, Clone, Serialize, Default)]
pub struct BlockedOpportunityCost {
    pub blocked_trades: usize,
    pub missed_pnl_usd: f64,
    pub blocked_reasons: HashMap<String, BlockedReasonStats>,
}

/// Shadow vs live comparison over the same window
#[derive(Debug, Clone, Serialize)]
pub struct ShadowVsLive {
    pub days: i64,
    pub shadow_trades: usize,
    pub shadow_pnl_usd: f64,
    pub live_trades: usize,
    pub live_pnl_usd: f64,
    pub delta_usd: f64,
    /// Shadow outperformed live by more than the fixed 15% relative margin -
    /// a hint that blocking logic may be net-harmful
    pub should_optimize_guards: bool,
}

/// Shadow engine configuration
#[derive(Debug, Clone)]
pub struct ShadowConfig {
    /// Virtual size per position
    pub position_size_usd: f64,
    /// Append-only SHADOW_ENTRY / SHADOW_EXIT log
    pub results_log: PathBuf,
    /// Open/closed count snapshot file
    pub snapshot_file: PathBuf,
    /// Live (paper) portfolio closed-trades JSONL for comparison
    pub live_trades_log: PathBuf,
}

impl ShadowConfig {
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        let dir = data_dir.as_ref();
        Self {
            position_size_usd: DEFAULT_POSITION_SIZE_USD,
            results_log: dir.join("shadow_results.jsonl"),
            snapshot_file: dir.join("shadow_state.json"),
            live_trades_log: dir.join("live_trades.jsonl"),
        }
    }
}

struct ShadowInner {
    open: HashMap<String, ShadowPosition>,
    closed: VecDeque<ShadowPosition>,
    log: EventLog,
}

/// Shadow execution engine service. Construct once and share via `Arc`.
pub struct ShadowEngine {
    inner: Mutex<ShadowInner>,
    config: ShadowConfig,
}

impl ShadowEngine {
    pub fn open(config: ShadowConfig) -> anyhow::Result<Self> {
        let log = EventLog::open(&config.results_log)?;
        info!(path = %config.results_log.display(), "👻 Shadow engine opened");
        Ok(Self {
            inner: Mutex::new(ShadowInner {
                open: HashMap::new(),
                closed: VecDeque::new(),
                log,
            }),
            config,
        })
    }

    /// Open a shadow position for a signal, blocked or not. Returns the
    /// position ID (the signal's ID, or a synthetic one if absent). A
    /// duplicate open for the same ID keeps the original entry frozen and
    /// returns its ID unchanged.
    pub fn execute_signal(
        &self,
        signal_id: Option<&str>,
        signal: &Signal,
        entry_price: f64,
        blocked_reason: Option<&str>,
    ) -> String {
        let position_id = signal_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| format!("shadow_{}", Uuid::new_v4()));

        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.open.contains_key(&position_id) {
            warn!(signal_id = %position_id, "Shadow position already open, entry kept");
            return position_id;
        }

        let ts = now_ms();
        let position = ShadowPosition {
            signal_id: position_id.clone(),
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            size_usd: self.config.position_size_usd,
            entry_price,
            entry_ts: ts,
            exit_price: None,
            exit_ts: None,
            pnl_usd: 0.0,
            pnl_pct: 0.0,
            status: PositionStatus::Open,
            blocked_reason: blocked_reason.map(|r| r.to_string()),
        };

        let record = ShadowRecord::Entry {
            ts,
            timestamp: rfc3339(ts),
            signal_id: position_id.clone(),
            symbol: position.symbol.clone(),
            direction: position.direction,
            size_usd: position.size_usd,
            entry_price,
            blocked_reason: position.blocked_reason.clone(),
        };
        if let Err(e) = inner.log.append(&record) {
            warn!(signal_id = %position_id, error = %e, "Failed appending SHADOW_ENTRY");
        }

        inner.open.insert(position_id.clone(), position);
        self.write_snapshot(&inner);
        position_id
    }

    /// Close an open shadow position at `exit_price`. Returns the closed
    /// position, or None when no position with this ID is open - calling
    /// twice is an idempotent no-op, not an error.
    pub fn close_position(&self, signal_id: &str, exit_price: f64) -> Option<ShadowPosition> {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut position = inner.open.remove(signal_id)?;

        let ts = now_ms();
        let raw_pct = match position.direction {
            Direction::Long => (exit_price - position.entry_price) / position.entry_price,
            Direction::Short => (position.entry_price - exit_price) / position.entry_price,
        };
        position.exit_price = Some(exit_price);
        position.exit_ts = Some(ts);
        position.pnl_pct = raw_pct * 100.0;
        position.pnl_usd = raw_pct * position.size_usd;
        position.status = PositionStatus::Closed;

        let record = ShadowRecord::Exit {
            ts,
            timestamp: rfc3339(ts),
            signal_id: signal_id.to_string(),
            symbol: position.symbol.clone(),
            direction: position.direction,
            size_usd: position.size_usd,
            entry_price: position.entry_price,
            exit_price,
            pnl_usd: position.pnl_usd,
            pnl_pct: position.pnl_pct,
            hold_secs: (ts - position.entry_ts) / 1000,
            blocked_reason: position.blocked_reason.clone(),
        };
        if let Err(e) = inner.log.append(&record) {
            warn!(signal_id = %signal_id, error = %e, "Failed appending SHADOW_EXIT");
        }

        if inner.closed.len() >= MAX_CLOSED_POSITIONS {
            inner.closed.pop_front();
        }
        inner.closed.push_back(position.clone());
        self.write_snapshot(&inner);
        Some(position)
    }

    /// Performance of closed positions whose exit falls within the last
    /// `days`. All-zero summary when the window is empty.
    pub fn get_performance_summary(&self, days: i64) -> PerformanceSummary {
        let since = now_ms() - days * 86_400_000;
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        let in_window: Vec<&ShadowPosition> = inner
            .closed
            .iter()
            .filter(|p| p.exit_ts.map_or(false, |ts| ts >= since))
            .collect();
        if in_window.is_empty() {
            return PerformanceSummary::default();
        }

        let total_trades = in_window.len();
        let total_pnl_usd: f64 = in_window.iter().map(|p| p.pnl_usd).sum();
        let wins = in_window.iter().filter(|p| p.pnl_usd > 0.0).count();
        let losses = total_trades - wins;
        let avg_pnl_pct =
            in_window.iter().map(|p| p.pnl_pct).sum::<f64>() / total_trades as f64;

        PerformanceSummary {
            total_trades,
            total_pnl_usd,
            wins,
            losses,
            win_rate: wins as f64 / total_trades as f64,
            avg_pnl_pct,
        }
    }

    /// Counterfactual P&L of closed positions the real pipeline blocked,
    /// grouped by blocking reason to attribute cost per gate.
    pub fn get_blocked_opportunity_cost(&self, days: i64) -> BlockedOpportunityCost {
        let since = now_ms() - days * 86_400_000;
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut report = BlockedOpportunityCost::default();
        for position in inner
            .closed
            .iter()
            .filter(|p| p.blocked_reason.is_some())
            .filter(|p| p.exit_ts.map_or(false, |ts| ts >= since))
        {
            let reason = position
                .blocked_reason
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            report.blocked_trades += 1;
            report.missed_pnl_usd += position.pnl_usd;
            let stats = report.blocked_reasons.entry(reason).or_default();
            stats.count += 1;
            stats.total_pnl += position.pnl_usd;
        }
        for stats in report.blocked_reasons.values_mut() {
            stats.avg_pnl = stats.total_pnl / stats.count as f64;
        }
        report
    }

    /// Cross-reference shadow P&L against the live portfolio's closed-trade
    /// log over the same window. The live log is JSONL with `pnl_usd` and
    /// `exit_ts` per line; a missing file yields an empty live side, not an
    /// error.
    pub fn compare_shadow_vs_live_performance(&self, days: i64) -> ShadowVsLive {
        let shadow = self.get_performance_summary(days);
        let since = now_ms() - days * 86_400_000;

        let live_lines =
            EventLog::read_path(&self.config.live_trades_log, None).unwrap_or_default();
        let live: Vec<(i64, f64)> = live_lines
            .iter()
            .filter_map(|v: &Value| {
                let exit_ts = v.get("exit_ts").and_then(|t| t.as_i64())?;
                let pnl = v.get("pnl_usd").and_then(|p| p.as_f64())?;
                Some((exit_ts, pnl))
            })
            .filter(|(exit_ts, _)| *exit_ts >= since)
            .collect();
        let live_pnl_usd: f64 = live.iter().map(|(_, pnl)| pnl).sum();

        let delta_usd = shadow.total_pnl_usd - live_pnl_usd;
        let should_optimize_guards = delta_usd > GUARD_REVIEW_MARGIN * live_pnl_usd.abs()
            && (shadow.total_pnl_usd != 0.0 || live_pnl_usd != 0.0);

        ShadowVsLive {
            days,
            shadow_trades: shadow.total_trades,
            shadow_pnl_usd: shadow.total_pnl_usd,
            live_trades: live.len(),
            live_pnl_usd,
            delta_usd,
            should_optimize_guards,
        }
    }

    /// Open positions (reporting reads; a position moving open->closed may
    /// momentarily appear in neither list - an accepted bounded window)
    pub fn get_open_positions(&self) -> Vec<ShadowPosition> {
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.open.values().cloned().collect()
    }

    pub fn get_closed_positions(&self) -> Vec<ShadowPosition> {
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.closed.iter().cloned().collect()
    }

    pub fn results_log_path(&self) -> &Path {
        &self.config.results_log
    }

    fn write_snapshot(&self, inner: &ShadowInner) {
        let snapshot = ShadowStateSnapshot {
            open_count: inner.open.len(),
            closed_count: inner.closed.len(),
            total_pnl_usd: inner.closed.iter().map(|p| p.pnl_usd).sum(),
            saved_at: now_ms(),
        };
        if let Err(e) = snapshot.save(&self.config.snapshot_file) {
            warn!(error = %e, "Failed writing shadow state snapshot");
        }
    }
}
