//! End-to-end pipeline scenarios: bus, state machine, decision tracker,
//! shadow engine, and analytics wired together the way the runtime does.

use std::sync::Arc;
use std::time::Duration;

use shadowbus::decisions::DecisionTracker;
use shadowbus::feed::{PriceFeed, StaticFeed};
use shadowbus::monitor::{PipelineMonitor, PipelineStatus};
use shadowbus::shadow::{ShadowConfig, ShadowEngine};
use shadowbus::signal_bus::{SignalBus, SignalFilter};
use shadowbus::state_machine::SignalStateMachine;
use shadowbus::types::{Direction, Signal, SignalState, StrategyMeta};

struct Pipeline {
    _dir: tempfile::TempDir,
    bus: Arc<SignalBus>,
    state_machine: Arc<SignalStateMachine>,
    tracker: DecisionTracker,
    shadow: Arc<ShadowEngine>,
}

fn make_signal(symbol: &str, direction: Direction, strategy: &str) -> Signal {
    Signal::new(
        symbol,
        direction,
        StrategyMeta {
            name: strategy.to_string(),
            confidence: 0.8,
            ..Default::default()
        },
    )
}

fn build_pipeline(stuck_after_secs: i64) -> Pipeline {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(
        SignalBus::open_with_stuck_threshold(dir.path().join("bus.jsonl"), stuck_after_secs)
            .unwrap(),
    );
    let state_machine = Arc::new(SignalStateMachine::new(bus.clone()));
    let feed: Arc<dyn PriceFeed> = Arc::new(StaticFeed::new([
        ("BTCUSDT".to_string(), 50_000.0),
        ("ETHUSDT".to_string(), 3_000.0),
    ]));
    let tracker =
        DecisionTracker::open(bus.clone(), Some(feed), dir.path().join("decisions.jsonl"))
            .unwrap();
    let shadow = Arc::new(ShadowEngine::open(ShadowConfig::in_dir(dir.path())).unwrap());
    Pipeline {
        _dir: dir,
        bus,
        state_machine,
        tracker,
        shadow,
    }
}

#[tokio::test]
async fn approved_signal_walks_the_full_lifecycle() {
    let p = build_pipeline(3600);
    let id = p
        .bus
        .emit_signal(make_signal("BTCUSDT", Direction::Long, "momentum"), "strategy_engine");

    assert!(p.state_machine.transition(&id, SignalState::Evaluating, None, None));
    assert!(p.tracker.track_approval(&id).await);
    assert!(p.state_machine.transition(&id, SignalState::Executing, None, None));
    assert!(p.state_machine.transition(&id, SignalState::Executed, None, Some("filled")));
    assert!(p.state_machine.transition(&id, SignalState::Learned, None, None));

    let record = p.bus.get_signal(&id).unwrap();
    assert_eq!(record.state, SignalState::Learned);

    // The log replays to the same terminal state the index holds
    let events = p.bus.replay_events(None);
    let folded = SignalBus::fold_current_states(&events);
    assert_eq!(folded[&id], SignalState::Learned);
}

#[tokio::test]
async fn blocked_signal_yields_opportunity_cost() {
    let p = build_pipeline(3600);
    let id = p
        .bus
        .emit_signal(make_signal("BTCUSDT", Direction::Long, "momentum"), "strategy_engine");
    p.state_machine.transition(&id, SignalState::Evaluating, None, None);

    // The gate blocks it; the shadow engine trades it anyway
    p.tracker
        .track_block(&id, "VolatilityGuard", "volatility above limit")
        .await;
    assert_eq!(p.bus.get_signal(&id).unwrap().state, SignalState::Blocked);

    let signal = p.bus.get_signal(&id).unwrap().signal;
    p.shadow
        .execute_signal(Some(&id), &signal, 50_000.0, Some("VolatilityGuard"));
    p.shadow.close_position(&id, 51_000.0).unwrap();

    // 2% move on a $1000 virtual position
    let cost = p.shadow.get_blocked_opportunity_cost(1);
    assert_eq!(cost.blocked_trades, 1);
    assert!((cost.missed_pnl_usd - 20.0).abs() < 1e-9);
    assert_eq!(cost.blocked_reasons["VolatilityGuard"].count, 1);
}

#[tokio::test]
async fn long_and_short_counterfactuals_price_correctly() {
    let p = build_pipeline(3600);

    let long = make_signal("BTCUSDT", Direction::Long, "momentum");
    let id_long = p.shadow.execute_signal(None, &long, 100.0, None);
    let closed_long = p.shadow.close_position(&id_long, 110.0).unwrap();
    assert!((closed_long.pnl_pct - 10.0).abs() < 1e-9);
    assert!((closed_long.pnl_usd - 100.0).abs() < 1e-9);

    let short = make_signal("BTCUSDT", Direction::Short, "mean_reversion");
    let id_short = p.shadow.execute_signal(None, &short, 100.0, None);
    let closed_short = p.shadow.close_position(&id_short, 110.0).unwrap();
    assert!((closed_short.pnl_pct + 10.0).abs() < 1e-9);
    assert!((closed_short.pnl_usd + 100.0).abs() < 1e-9);
}

#[tokio::test]
async fn stale_signals_are_swept_to_expired() {
    let p = build_pipeline(1);
    let id = p
        .bus
        .emit_signal(make_signal("ETHUSDT", Direction::Long, "momentum"), "strategy_engine");
    p.state_machine.transition(&id, SignalState::Evaluating, None, None);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let expired = p.state_machine.auto_expire_old_signals(1);
    assert_eq!(expired, 1);
    assert_eq!(p.bus.get_signal(&id).unwrap().state, SignalState::Expired);

    // Terminal now: a second sweep finds nothing
    assert_eq!(p.state_machine.auto_expire_old_signals(1), 0);
}

#[tokio::test]
async fn monitor_classifies_pipeline_health() {
    let p = build_pipeline(1);
    let monitor = PipelineMonitor::new(p.bus.clone(), p.state_machine.clone());

    // Empty pipeline is healthy
    assert_eq!(monitor.get_pipeline_health().status, PipelineStatus::Healthy);

    // Fresh activity, nothing stuck: still healthy
    let id = p
        .bus
        .emit_signal(make_signal("BTCUSDT", Direction::Long, "momentum"), "strategy_engine");
    assert_eq!(monitor.get_pipeline_health().status, PipelineStatus::Healthy);

    // Let it age past the 1s stuck threshold
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let health = monitor.get_pipeline_health();
    assert_eq!(health.status, PipelineStatus::Warning);
    assert_eq!(health.stuck_count, 1);
    assert_eq!(health.stuck[0].signal_id, id);
}

#[tokio::test]
async fn reopened_bus_starts_empty_until_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("bus.jsonl");

    let id = {
        let bus = SignalBus::open(&log_path).unwrap();
        bus.emit_signal(make_signal("BTCUSDT", Direction::Long, "momentum"), "strategy_engine")
    };

    let bus = SignalBus::open(&log_path).unwrap();
    assert!(bus.get_signal(&id).is_none());

    let rebuilt = bus.rebuild_index_from_log();
    assert_eq!(rebuilt, 1);
    assert_eq!(bus.get_signal(&id).unwrap().state, SignalState::Generated);
}

#[tokio::test]
async fn filters_compose_conjunctively() {
    let p = build_pipeline(3600);
    p.bus
        .emit_signal(make_signal("BTCUSDT", Direction::Long, "momentum"), "strategy_engine");
    p.bus
        .emit_signal(make_signal("ETHUSDT", Direction::Short, "momentum"), "scanner");
    let id = p
        .bus
        .emit_signal(make_signal("BTCUSDT", Direction::Short, "mean_reversion"), "scanner");

    let hits = p.bus.get_signals(&SignalFilter {
        symbol: Some("BTCUSDT".to_string()),
        source: Some("scanner".to_string()),
        ..Default::default()
    });
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].signal_id, id);

    let limited = p.bus.get_signals(&SignalFilter {
        limit: Some(2),
        ..Default::default()
    });
    assert_eq!(limited.len(), 2);
}
