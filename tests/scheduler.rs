//! End-to-end scheduler behavior against fake collaborators

mod common;

use chrono::Utc;
use std::time::Duration;

use common::{illiquid, mint, Harness, Mode};
use migration_scout::guard::CircuitState;
use migration_scout::sources::AlertKind;
use migration_scout::types::{Tier, Token, TokenStatus};
use migration_scout::{Config, Error};

async fn register(h: &Harness, seeds: std::ops::RangeInclusive<u8>) -> Vec<String> {
    let mut mints = Vec::new();
    for seed in seeds {
        let token = Token::new(&mint(seed), None, None).unwrap();
        assert!(h.scheduler.register_token(token).await.unwrap());
        mints.push(mint(seed));
    }
    mints
}

#[tokio::test(start_paused = true)]
async fn concurrent_ticks_never_double_dispatch() {
    let h = Harness::new(&Config::default(), Mode::Slow(Duration::from_millis(100)));
    let mints = register(&h, 1..=5).await;

    let (a, b) = tokio::join!(h.scheduler.tick(Tier::Cold), h.scheduler.tick(Tier::Cold));
    assert_eq!(a + b, 5);
    assert_eq!(h.scheduler.health().await.in_flight, 5);

    // Everything finishes inside the grace period
    h.scheduler.drain().await;

    assert_eq!(h.metrics.calls(), 5);
    for m in &mints {
        let history = h.store.history(m).await;
        assert_eq!(history.len(), 1, "exactly one snapshot for {}", m);
        assert_eq!(history[0].cycle, 1);
    }
    let report = h.scheduler.health().await;
    assert_eq!(report.in_flight, 0);
    assert_eq!(report.counters.completed_cycles, 5);
    assert_eq!(report.counters.cancelled, 0);
}

#[tokio::test(start_paused = true)]
async fn tokens_are_not_redispatched_before_their_interval() {
    let h = Harness::new(&Config::default(), Mode::Illiquid);
    register(&h, 1..=3).await;

    assert_eq!(h.scheduler.tick(Tier::Cold).await, 3);
    // Let the workers finish
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.scheduler.health().await.in_flight, 0);

    assert_eq!(h.scheduler.tick(Tier::Cold).await, 0);
    tokio::time::advance(Duration::from_secs(301)).await;
    assert_eq!(h.scheduler.tick(Tier::Cold).await, 3);
}

#[tokio::test(start_paused = true)]
async fn open_breaker_serves_stale_and_defers_transitions() {
    let mut config = Config::default();
    config.breaker.failure_threshold = 1;
    config.breaker.cooldown_secs = 30;
    config.retry.max_attempts = 1;
    config.lifecycle.monitoring_timeout_secs = 3600;
    let mut h = Harness::new(&config, Mode::Failing);

    // Monitoring well past its timeout: archival is due, but only on fresh data
    let m = mint(1);
    let mut token = Token::new(&m, None, None).unwrap();
    token.created_at = Utc::now() - chrono::Duration::hours(2);
    h.scheduler.register_token(token).await.unwrap();

    h.scheduler.pipeline().cache().insert(&m, illiquid(&m));
    tokio::time::advance(Duration::from_secs(16)).await;

    let stale = h.scheduler.force_recompute(&m).await.unwrap();
    assert!(stale.data_stale);
    assert_eq!(h.store.token(&m).await.unwrap().status, TokenStatus::Monitoring);

    // Breaker is open now: no upstream call at all
    let again = h.scheduler.force_recompute(&m).await.unwrap();
    assert!(again.data_stale);
    assert!(again.timestamp > stale.timestamp);
    assert_eq!(h.metrics.calls(), 1);

    let report = h.scheduler.health().await;
    assert_eq!(report.breaker.state, CircuitState::Open);
    assert_eq!(report.counters.deferred_transitions, 2);
    assert_eq!(report.counters.stale_served, 2);
    assert_eq!(report.tokens.monitoring, 1);

    // Upstream recovers; after the cooldown the probe closes the breaker and
    // the deferred archival happens on fresh data
    h.metrics.set(Mode::Illiquid);
    tokio::time::advance(Duration::from_secs(31)).await;
    let fresh = h.scheduler.force_recompute(&m).await.unwrap();
    assert!(!fresh.data_stale);
    assert_eq!(fresh.cycle, 3);
    assert_eq!(h.store.token(&m).await.unwrap().status, TokenStatus::Archived);

    let kinds: Vec<AlertKind> = h.alerts().into_iter().map(|n| n.kind).collect();
    assert_eq!(
        kinds,
        vec![
            AlertKind::CircuitOpened,
            AlertKind::CircuitClosed,
            AlertKind::TokenArchived
        ]
    );

    // Archived is terminal
    assert!(matches!(
        h.scheduler.force_recompute(&m).await,
        Err(Error::TokenArchived(_))
    ));
    tokio::time::advance(Duration::from_secs(600)).await;
    assert_eq!(h.scheduler.tick(Tier::Cold).await, 0);
    assert_eq!(h.scheduler.tick(Tier::Hot).await, 0);
    let token = Token::new(&m, None, None).unwrap();
    assert!(!h.scheduler.register_token(token).await.unwrap());
    assert!(h.scheduler.pipeline().smoothing().get(&m).is_none());
}

#[tokio::test(start_paused = true)]
async fn liquid_token_is_promoted_into_hot_tier() {
    let mut h = Harness::new(&Config::default(), Mode::Liquid);
    let m = mint(4);
    h.scheduler
        .register_token(Token::new(&m, None, None).unwrap())
        .await
        .unwrap();

    let snapshot = h.scheduler.force_recompute(&m).await.unwrap();
    assert!(!snapshot.data_stale);
    let token = h.store.token(&m).await.unwrap();
    assert_eq!(token.status, TokenStatus::Active);
    assert!(token.promoted_at.is_some());

    let kinds: Vec<AlertKind> = h.alerts().into_iter().map(|n| n.kind).collect();
    assert_eq!(kinds, vec![AlertKind::TokenPromoted]);

    // Recently promoted: hot tier, due after the hot interval
    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(h.scheduler.tick(Tier::Cold).await, 0);
    assert_eq!(h.scheduler.tick(Tier::Hot).await, 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_without_partial_snapshots() {
    let mut config = Config::default();
    config.scheduler.shutdown_grace_secs = 1;
    let h = Harness::new(&config, Mode::Slow(Duration::from_secs(3600)));
    let mints = register(&h, 1..=3).await;

    assert_eq!(h.scheduler.tick(Tier::Cold).await, 3);
    h.scheduler.drain().await;

    for m in &mints {
        assert!(h.store.history(m).await.is_empty());
        assert!(h.scheduler.pipeline().smoothing().get(m).is_none());
    }
    let report = h.scheduler.health().await;
    assert!(report.shutting_down);
    assert_eq!(report.in_flight, 0);
    assert_eq!(report.counters.cancelled, 3);

    // No dispatch after shutdown
    tokio::time::advance(Duration::from_secs(600)).await;
    assert_eq!(h.scheduler.tick(Tier::Cold).await, 0);
    assert!(matches!(
        h.scheduler.force_recompute(&mints[0]).await,
        Err(Error::ShuttingDown)
    ));
}

#[tokio::test(start_paused = true)]
async fn backlog_raises_parallelism_one_step_per_tuning_tick() {
    let mut config = Config::default();
    config.scheduler.initial_parallelism = 2;
    config.scheduler.parallelism_floor = 1;
    config.scheduler.parallelism_ceiling = 4;
    config.scheduler.high_water = 5;
    config.scheduler.low_water = 1;
    config.scheduler.batch_size = 10;
    config.scheduler.min_batch_size = 1;
    config.scheduler.shutdown_grace_secs = 1;
    let mut h = Harness::new(&config, Mode::Slow(Duration::from_secs(3600)));
    register(&h, 1..=20).await;

    assert_eq!(h.scheduler.tick(Tier::Cold).await, 2);
    assert_eq!(h.scheduler.health().await.queue_cold, 18);

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(h.scheduler.tuning_tick().await.max_parallelism);
    }
    assert_eq!(seen, vec![3, 4, 4]);

    // One alert for the sustained backlog
    let backlog: Vec<_> = h
        .alerts()
        .into_iter()
        .filter(|n| n.kind == AlertKind::BacklogHigh)
        .collect();
    assert_eq!(backlog.len(), 1);

    // The raised limit admits two more
    assert_eq!(h.scheduler.tick(Tier::Cold).await, 2);
    let report = h.scheduler.health().await;
    assert_eq!(report.in_flight, 4);
    assert_eq!(report.queue_cold, 16);

    h.scheduler.drain().await;
    assert_eq!(h.scheduler.health().await.in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn hard_memory_pressure_pauses_cold_intake() {
    let mut config = Config::default();
    config.memory.soft_limit_mb = 100;
    config.memory.hard_limit_mb = 200;
    let h = Harness::new(&config, Mode::Illiquid);
    register(&h, 1..=3).await;

    h.probe.set(300, 5.0);
    h.scheduler.tuning_tick().await;
    assert_eq!(h.scheduler.tick(Tier::Cold).await, 0);

    h.probe.set(10, 5.0);
    h.scheduler.tuning_tick().await;
    assert_eq!(h.scheduler.tick(Tier::Cold).await, 3);
}
