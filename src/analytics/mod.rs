//! Pipeline analytics
//!
//! Joins the decisions log with counterfactual results from the shadow
//! engine to answer the operator questions: what did each gate cost, how
//! fast do signals move through the pipeline, and which strategies earn
//! their keep.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::decisions::DecisionTracker;
use crate::shadow::ShadowEngine;
use crate::signal_bus::SignalBus;
use crate::types::{now_ms, Decision};

/// Default reporting window
pub const DEFAULT_WINDOW_HOURS: i64 = 24;

/// Generation-to-execution latency distribution, in seconds
#[derive(Debug, Clone, Serialize, Default)]
pub struct DecayStats {
    pub count: usize,
    pub mean_secs: f64,
    pub median_secs: i64,
    pub min_secs: i64,
    pub max_secs: i64,
}

/// Closed shadow P&L attributed to the strategy that generated the signal
#[derive(Debug, Clone, Serialize)]
pub struct StrategyPerf {
    pub strategy: String,
    pub trades: usize,
    pub total_pnl_usd: f64,
    pub win_rate: f64,
}

/// Per-gate verdict from counterfactual P&L of what it blocked
#[derive(Debug, Clone, Serialize)]
pub struct GuardVerdict {
    pub component: String,
    pub blocked_count: usize,
    /// Net shadow P&L of this gate's blocked signals. Negative means the
    /// gate saved money.
    pub net_counterfactual_pnl_usd: f64,
    pub verdict: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsReport {
    pub generated_at: i64,
    pub window_hours: i64,
    pub decisions_total: usize,
    pub approved: usize,
    pub blocked: usize,
    pub blocked_by_component: HashMap<String, usize>,
    pub signal_decay: DecayStats,
    /// Sorted by total P&L, best first
    pub strategy_leaderboard: Vec<StrategyPerf>,
    pub guard_effectiveness: Vec<GuardVerdict>,
}

pub struct AnalyticsReportGenerator {
    bus: Arc<SignalBus>,
    tracker: Arc<DecisionTracker>,
    shadow: Arc<ShadowEngine>,
}

impl AnalyticsReportGenerator {
    pub fn new(
        bus: Arc<SignalBus>,
        tracker: Arc<DecisionTracker>,
        shadow: Arc<ShadowEngine>,
    ) -> Self {
        Self { bus, tracker, shadow }
    }

    pub fn generate_report(&self, window_hours: i64) -> AnalyticsReport {
        let since = now_ms() - window_hours * 3_600_000;
        let decisions = self.tracker.read_decisions(Some(since));

        let approved = decisions
            .iter()
            .filter(|d| d.decision == Decision::Approved)
            .count();
        let blocked_decisions: Vec<_> = decisions
            .iter()
            .filter(|d| d.decision == Decision::Blocked)
            .collect();

        let mut blocked_by_component: HashMap<String, usize> = HashMap::new();
        for d in &blocked_decisions {
            *blocked_by_component
                .entry(d.blocker_component.clone())
                .or_default() += 1;
        }

        // Closed shadow positions keyed by signal ID, for joins below
        let closed: HashMap<String, f64> = self
            .shadow
            .get_closed_positions()
            .into_iter()
            .filter(|p| p.exit_ts.map_or(false, |ts| ts >= since))
            .map(|p| (p.signal_id.clone(), p.pnl_usd))
            .collect();

        let report = AnalyticsReport {
            generated_at: now_ms(),
            window_hours,
            decisions_total: decisions.len(),
            approved,
            blocked: blocked_decisions.len(),
            blocked_by_component,
            signal_decay: self.signal_decay(&decisions),
            strategy_leaderboard: Self::strategy_leaderboard(&decisions, &closed),
            guard_effectiveness: Self::guard_effectiveness(&blocked_decisions, &closed),
        };

        info!(
            window_hours,
            decisions = report.decisions_total,
            approved = report.approved,
            blocked = report.blocked,
            "📊 Analytics report generated"
        );
        report
    }

    /// Seconds from generation to execution, per decided signal. Execution
    /// time is the shadow entry for that signal ID; decisions whose signal
    /// never executed (really or virtually), or that the bus no longer
    /// indexes (e.g. emitted before a restart), are skipped.
    fn signal_decay(&self, decisions: &[crate::types::DecisionEvent]) -> DecayStats {
        let executed_at: HashMap<String, i64> = self
            .shadow
            .get_open_positions()
            .into_iter()
            .chain(self.shadow.get_closed_positions())
            .map(|p| (p.signal_id, p.entry_ts))
            .collect();

        let mut latencies: Vec<i64> = decisions
            .iter()
            .filter_map(|d| {
                let entry_ts = *executed_at.get(&d.signal_id)?;
                let record = self.bus.get_signal(&d.signal_id)?;
                Some((entry_ts - record.created_ts).max(0) / 1000)
            })
            .collect();
        if latencies.is_empty() {
            return DecayStats::default();
        }
        latencies.sort_unstable();

        let count = latencies.len();
        DecayStats {
            count,
            mean_secs: latencies.iter().sum::<i64>() as f64 / count as f64,
            median_secs: latencies[count / 2],
            min_secs: latencies[0],
            max_secs: latencies[count - 1],
        }
    }

    fn strategy_leaderboard(
        decisions: &[crate::types::DecisionEvent],
        closed: &HashMap<String, f64>,
    ) -> Vec<StrategyPerf> {
        struct Acc {
            trades: usize,
            total_pnl: f64,
            wins: usize,
        }
        let mut by_strategy: HashMap<String, Acc> = HashMap::new();
        for d in decisions {
            let Some(&pnl) = closed.get(&d.signal_id) else {
                continue;
            };
            let name = d
                .signal_metadata
                .as_ref()
                .map(|m| m.name.clone())
                .unwrap_or_else(|| "unknown".to_string());
            let acc = by_strategy.entry(name).or_insert(Acc {
                trades: 0,
                total_pnl: 0.0,
                wins: 0,
            });
            acc.trades += 1;
            acc.total_pnl += pnl;
            if pnl > 0.0 {
                acc.wins += 1;
            }
        }

        let mut leaderboard: Vec<StrategyPerf> = by_strategy
            .into_iter()
            .map(|(strategy, acc)| StrategyPerf {
                strategy,
                trades: acc.trades,
                total_pnl_usd: acc.total_pnl,
                win_rate: acc.wins as f64 / acc.trades as f64,
            })
            .collect();
        leaderboard.sort_by(|a, b| {
            b.total_pnl_usd
                .partial_cmp(&a.total_pnl_usd)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        leaderboard
    }

    fn guard_effectiveness(
        blocked: &[&crate::types::DecisionEvent],
        closed: &HashMap<String, f64>,
    ) -> Vec<GuardVerdict> {
        struct Acc {
            count: usize,
            net_pnl: f64,
        }
        let mut by_component: HashMap<String, Acc> = HashMap::new();
        for d in blocked {
            let acc = by_component
                .entry(d.blocker_component.clone())
                .or_insert(Acc {
                    count: 0,
                    net_pnl: 0.0,
                });
            acc.count += 1;
            acc.net_pnl += closed.get(&d.signal_id).copied().unwrap_or(0.0);
        }

        let mut verdicts: Vec<GuardVerdict> = by_component
            .into_iter()
            .map(|(component, acc)| GuardVerdict {
                component,
                blocked_count: acc.count,
                net_counterfactual_pnl_usd: acc.net_pnl,
                verdict: if acc.net_pnl < 0.0 { "Good" } else { "Review" },
            })
            .collect();
        verdicts.sort_by(|a, b| a.component.cmp(&b.component));
        verdicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{PriceFeed, StaticFeed};
    use crate::shadow::ShadowConfig;
    use crate::types::{Direction, Signal, StrategyMeta};

    struct Harness {
        _dir: tempfile::TempDir,
        bus: Arc<SignalBus>,
        tracker: Arc<DecisionTracker>,
        shadow: Arc<ShadowEngine>,
        generator: AnalyticsReportGenerator,
    }

    fn setup() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(SignalBus::open(dir.path().join("bus.jsonl")).unwrap());
        let feed: Arc<dyn PriceFeed> =
            Arc::new(StaticFeed::new([("BTCUSDT".to_string(), 50_000.0)]));
        let tracker = Arc::new(
            DecisionTracker::open(bus.clone(), Some(feed), dir.path().join("decisions.jsonl"))
                .unwrap(),
        );
        let shadow = Arc::new(ShadowEngine::open(ShadowConfig::in_dir(dir.path())).unwrap());
        let generator =
            AnalyticsReportGenerator::new(bus.clone(), tracker.clone(), shadow.clone());
        Harness {
            _dir: dir,
            bus,
            tracker,
            shadow,
            generator,
        }
    }

    fn make_signal(strategy: &str) -> Signal {
        Signal::new(
            "BTCUSDT",
            Direction::Long,
            StrategyMeta {
                name: strategy.to_string(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_empty_window_report() {
        let h = setup();
        let report = h.generator.generate_report(DEFAULT_WINDOW_HOURS);
        assert_eq!(report.decisions_total, 0);
        assert_eq!(report.signal_decay.count, 0);
        assert!(report.strategy_leaderboard.is_empty());
        assert!(report.guard_effectiveness.is_empty());
    }

    #[tokio::test]
    async fn test_guard_verdicts() {
        let h = setup();

        // VolatilityGuard blocks a signal that would have won: Review
        let winner = h.bus.emit_signal(make_signal("momentum"), "strategy_engine");
        h.tracker
            .track_block(&winner, "VolatilityGuard", "vol above limit")
            .await;
        let signal = h.bus.get_signal(&winner).unwrap().signal;
        h.shadow
            .execute_signal(Some(&winner), &signal, 50_000.0, Some("VolatilityGuard"));
        h.shadow.close_position(&winner, 51_000.0).unwrap();

        // FeeGovernor blocks a signal that would have lost: Good
        let loser = h.bus.emit_signal(make_signal("momentum"), "strategy_engine");
        h.tracker.track_block(&loser, "FeeGovernor", "fees").await;
        let signal = h.bus.get_signal(&loser).unwrap().signal;
        h.shadow
            .execute_signal(Some(&loser), &signal, 50_000.0, Some("FeeGovernor"));
        h.shadow.close_position(&loser, 49_000.0).unwrap();

        let report = h.generator.generate_report(DEFAULT_WINDOW_HOURS);
        assert_eq!(report.blocked, 2);
        assert_eq!(report.blocked_by_component["VolatilityGuard"], 1);

        let by_name: HashMap<_, _> = report
            .guard_effectiveness
            .iter()
            .map(|g| (g.component.as_str(), g))
            .collect();
        assert_eq!(by_name["VolatilityGuard"].verdict, "Review");
        assert!((by_name["VolatilityGuard"].net_counterfactual_pnl_usd - 20.0).abs() < 1e-9);
        assert_eq!(by_name["FeeGovernor"].verdict, "Good");
        assert!((by_name["FeeGovernor"].net_counterfactual_pnl_usd + 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_strategy_leaderboard_ordering() {
        let h = setup();

        for (strategy, exit) in [("momentum", 51_000.0), ("mean_reversion", 49_500.0)] {
            let id = h.bus.emit_signal(make_signal(strategy), "strategy_engine");
            h.tracker.track_approval(&id).await;
            let signal = h.bus.get_signal(&id).unwrap().signal;
            h.shadow.execute_signal(Some(&id), &signal, 50_000.0, None);
            h.shadow.close_position(&id, exit).unwrap();
        }

        let report = h.generator.generate_report(DEFAULT_WINDOW_HOURS);
        assert_eq!(report.approved, 2);
        assert_eq!(report.strategy_leaderboard.len(), 2);
        assert_eq!(report.strategy_leaderboard[0].strategy, "momentum");
        assert!(report.strategy_leaderboard[0].total_pnl_usd > 0.0);
        assert_eq!(report.strategy_leaderboard[1].strategy, "mean_reversion");
        assert_eq!(report.strategy_leaderboard[1].win_rate, 0.0);
    }

    #[tokio::test]
    async fn test_signal_decay_measures_generation_to_execution() {
        let h = setup();

        // Approved and shadow-executed: counted
        let executed = h.bus.emit_signal(make_signal("momentum"), "strategy_engine");
        h.tracker.track_approval(&executed).await;
        let signal = h.bus.get_signal(&executed).unwrap().signal;
        h.shadow.execute_signal(Some(&executed), &signal, 50_000.0, None);

        // Decided but never executed: excluded from decay
        let pending = h.bus.emit_signal(make_signal("momentum"), "strategy_engine");
        h.tracker.track_approval(&pending).await;

        let report = h.generator.generate_report(DEFAULT_WINDOW_HOURS);
        assert_eq!(report.signal_decay.count, 1);
        // Generation and execution happen within the same test run
        assert!(report.signal_decay.min_secs >= 0);
        assert!(report.signal_decay.max_secs < 60);
        assert!(report.signal_decay.mean_secs >= 0.0);
    }
}
