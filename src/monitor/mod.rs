//! Pipeline Monitor - read-only health aggregation
//!
//! Combines the bus's raw counts with the state machine's stuck-signal scan
//! and last-hour throughput into a tri-level status for dashboards and
//! health checks. Never mutates anything.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::signal_bus::{SignalBus, SignalFilter, StuckSignal};
use crate::state_machine::SignalStateMachine;
use crate::types::now_ms;

/// Stuck-count threshold above which the pipeline is CRITICAL
pub const STUCK_CRITICAL_COUNT: usize = 10;
/// Throughput window for the last-hour breakdown
pub const THROUGHPUT_WINDOW_SECS: i64 = 3600;

/// Tri-level pipeline status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineStatus {
    #[serde(rename = "HEALTHY")]
    Healthy,
    #[serde(rename = "WARNING")]
    Warning,
    #[serde(rename = "CRITICAL")]
    Critical,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStatus::Healthy => write!(f, "HEALTHY"),
            PipelineStatus::Warning => write!(f, "WARNING"),
            PipelineStatus::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Extended health snapshot for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct ExtendedPipelineHealth {
    pub ts: i64,
    pub status: PipelineStatus,
    pub total_signals: usize,
    pub by_state: HashMap<String, usize>,
    pub by_source: HashMap<String, usize>,
    pub stuck_count: usize,
    pub stuck: Vec<StuckSignal>,
    /// Signals created within the last hour
    pub last_hour_total: usize,
    /// Last-hour signals broken down by current state
    pub last_hour_by_state: HashMap<String, usize>,
}

/// Activity summary over an arbitrary window
#[derive(Debug, Clone, Serialize)]
pub struct RecentActivity {
    pub hours: i64,
    pub total: usize,
    pub by_state: HashMap<String, usize>,
    pub by_source: HashMap<String, usize>,
}

/// Read-only monitor over the bus and state machine
pub struct PipelineMonitor {
    bus: Arc<SignalBus>,
    state_machine: Arc<SignalStateMachine>,
}

impl PipelineMonitor {
    pub fn new(bus: Arc<SignalBus>, state_machine: Arc<SignalStateMachine>) -> Self {
        Self { bus, state_machine }
    }

    /// Extended health snapshot. CRITICAL when more than
    /// [`STUCK_CRITICAL_COUNT`] signals are stuck; WARNING when any signal
    /// is stuck or an otherwise-populated pipeline produced nothing in the
    /// last hour; HEALTHY otherwise (an empty pipeline is healthy, not
    /// idle).
    pub fn get_pipeline_health(&self) -> ExtendedPipelineHealth {
        let base = self.bus.get_pipeline_health();
        let stuck = self.state_machine.get_stuck_signals(self.bus.stuck_after_secs());

        let window_start = now_ms() - THROUGHPUT_WINDOW_SECS * 1000;
        let recent = self.bus.get_signals(&SignalFilter {
            since_ts: Some(window_start),
            ..Default::default()
        });
        let mut last_hour_by_state: HashMap<String, usize> = HashMap::new();
        for rec in &recent {
            *last_hour_by_state
                .entry(rec.state.as_str().to_string())
                .or_insert(0) += 1;
        }

        let status = if stuck.len() > STUCK_CRITICAL_COUNT {
            PipelineStatus::Critical
        } else if !stuck.is_empty() || (base.total_signals > 0 && recent.is_empty()) {
            PipelineStatus::Warning
        } else {
            PipelineStatus::Healthy
        };

        ExtendedPipelineHealth {
            ts: base.ts,
            status,
            total_signals: base.total_signals,
            by_state: base.by_state,
            by_source: base.by_source,
            stuck_count: stuck.len(),
            stuck,
            last_hour_total: recent.len(),
            last_hour_by_state,
        }
    }

    /// Signals created within the last `hours`, broken down by state and
    /// source
    pub fn get_recent_activity(&self, hours: i64) -> RecentActivity {
        let since = now_ms() - hours * 3600 * 1000;
        let records = self.bus.get_signals(&SignalFilter {
            since_ts: Some(since),
            ..Default::default()
        });

        let mut by_state: HashMap<String, usize> = HashMap::new();
        let mut by_source: HashMap<String, usize> = HashMap::new();
        for rec in &records {
            *by_state.entry(rec.state.as_str().to_string()).or_insert(0) += 1;
            *by_source.entry(rec.source.clone()).or_insert(0) += 1;
        }

        RecentActivity {
            hours,
            total: records.len(),
            by_state,
            by_source,
        }
    }
}
