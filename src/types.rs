//! Core types used throughout ShadowBus
//!
//! Defines the signal payload, lifecycle states, and the durable event
//! records shared by the bus, state machine, shadow engine and analytics.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Trading direction of a proposed trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Long
    }
}

impl Direction {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "LONG" | "BUY" | "UP" => Some(Direction::Long),
            "SHORT" | "SELL" | "DOWN" => Some(Direction::Short),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// Lifecycle state of a signal in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalState {
    #[serde(rename = "GENERATED")]
    Generated,
    #[serde(rename = "EVALUATING")]
    Evaluating,
    #[serde(rename = "APPROVED")]
    Approved,
    #[serde(rename = "EXECUTING")]
    Executing,
    #[serde(rename = "EXECUTED")]
    Executed,
    #[serde(rename = "BLOCKED")]
    Blocked,
    #[serde(rename = "EXPIRED")]
    Expired,
    #[serde(rename = "LEARNED")]
    Learned,
}

impl SignalState {
    /// Terminal states have no outgoing transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, SignalState::Expired | SignalState::Learned)
    }

    /// Legal next states from this one. The lifecycle strictly progresses
    /// toward a terminal state; there are no cycles.
    pub fn valid_next_states(&self) -> &'static [SignalState] {
        match self {
            SignalState::Generated => &[SignalState::Evaluating, SignalState::Expired],
            SignalState::Evaluating => &[
                SignalState::Approved,
                SignalState::Blocked,
                SignalState::Expired,
            ],
            SignalState::Approved => &[SignalState::Executing, SignalState::Expired],
            SignalState::Executing => &[SignalState::Executed, SignalState::Expired],
            SignalState::Executed => &[SignalState::Learned],
            SignalState::Blocked => &[SignalState::Learned],
            SignalState::Expired => &[],
            SignalState::Learned => &[],
        }
    }

    /// Check whether a transition to `next` is allowed
    pub fn can_transition_to(&self, next: SignalState) -> bool {
        self.valid_next_states().contains(&next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalState::Generated => "GENERATED",
            SignalState::Evaluating => "EVALUATING",
            SignalState::Approved => "APPROVED",
            SignalState::Executing => "EXECUTING",
            SignalState::Executed => "EXECUTED",
            SignalState::Blocked => "BLOCKED",
            SignalState::Expired => "EXPIRED",
            SignalState::Learned => "LEARNED",
        }
    }
}

impl fmt::Display for SignalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Decision outcome recorded for a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    #[serde(rename = "APPROVED")]
    Approved,
    #[serde(rename = "BLOCKED")]
    Blocked,
    #[serde(rename = "EXPIRED")]
    Expired,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Approved => write!(f, "APPROVED"),
            Decision::Blocked => write!(f, "BLOCKED"),
            Decision::Expired => write!(f, "EXPIRED"),
            Decision::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Strategy metadata attached to a signal at generation time
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StrategyMeta {
    /// Strategy that generated this signal
    pub name: String,
    /// Market regime label at generation time (e.g. "trending")
    #[serde(default)]
    pub regime: Option<String>,
    /// Confidence level (0.0 - 1.0)
    #[serde(default)]
    pub confidence: f64,
    /// Indicators that contributed to this signal
    #[serde(default)]
    pub indicators: Vec<String>,
}

/// A proposed trade. Immutable once emitted - lifecycle changes are recorded
/// as new events referencing it by ID, never as payload mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Trading pair (e.g. "BTCUSDT")
    pub symbol: String,
    /// Proposed direction
    pub direction: Direction,
    /// Creation time in epoch milliseconds (stamped at emission if zero)
    #[serde(default)]
    pub ts: i64,
    /// Strategy metadata
    #[serde(default)]
    pub strategy: StrategyMeta,
    /// Open extension bag for strategy-specific fields
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl Signal {
    pub fn new(symbol: &str, direction: Direction, strategy: StrategyMeta) -> Self {
        Self {
            symbol: symbol.to_string(),
            direction,
            ts: Utc::now().timestamp_millis(),
            strategy,
            extra: Map::new(),
        }
    }
}

/// Market context captured at decision time (best-effort; any field may be
/// missing when the price feed was unavailable)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MarketSnapshot {
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub spread: Option<f64>,
    #[serde(default)]
    pub volatility: Option<f64>,
    #[serde(default)]
    pub regime: Option<String>,
}

/// Durable record on the signal-bus event log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum BusEvent {
    #[serde(rename = "signal_generated")]
    SignalGenerated {
        event_id: String,
        signal_id: String,
        /// Epoch milliseconds
        ts: i64,
        /// RFC3339, for humans grepping the log
        timestamp: String,
        source: String,
        signal: Signal,
        state: SignalState,
    },
    #[serde(rename = "state_change")]
    StateChange {
        event_id: String,
        signal_id: String,
        old_state: SignalState,
        new_state: SignalState,
        ts: i64,
        timestamp: String,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        metadata: Option<Map<String, Value>>,
    },
}

impl BusEvent {
    pub fn signal_id(&self) -> &str {
        match self {
            BusEvent::SignalGenerated { signal_id, .. } => signal_id,
            BusEvent::StateChange { signal_id, .. } => signal_id,
        }
    }

    pub fn ts(&self) -> i64 {
        match self {
            BusEvent::SignalGenerated { ts, .. } => *ts,
            BusEvent::StateChange { ts, .. } => *ts,
        }
    }
}

/// One record on the dedicated decisions log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEvent {
    pub ts: i64,
    pub timestamp: String,
    pub signal_id: String,
    pub symbol: String,
    pub decision: Decision,
    /// Which gate acted (e.g. "VolatilityGuard")
    pub blocker_component: String,
    pub blocker_reason: String,
    #[serde(default)]
    pub market_snapshot: Option<MarketSnapshot>,
    /// Snapshot of the signal's strategy metadata at decision time
    #[serde(default)]
    pub signal_metadata: Option<StrategyMeta>,
}

/// Generate a globally unique signal ID: `{symbol}_{epoch_ms}_{suffix}`.
/// The random suffix keeps IDs distinct even within the same millisecond.
pub fn generate_signal_id(symbol: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| {
            const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
            CHARS[rng.gen_range(0..CHARS.len())] as char
        })
        .collect();
    format!("{}_{}_{}", symbol, Utc::now().timestamp_millis(), suffix)
}

/// Current epoch milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// RFC3339 string for the given epoch milliseconds
pub fn rfc3339(ts: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}
