//! Fakes shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use migration_scout::error::{Error, Result};
use migration_scout::guard::{ResourceProbe, ResourceSample};
use migration_scout::scheduler::{Collaborators, Scheduler};
use migration_scout::sources::{ChannelNotifier, MemoryStore, MetricsSource, Notification};
use migration_scout::types::{MetricsSnapshot, PoolInfo, TxnCounts};
use migration_scout::Config;

/// Deterministic valid mint
pub fn mint(seed: u8) -> String {
    bs58::encode([seed.max(1); 32]).into_string()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mode {
    /// Thin market, nothing promotable
    Illiquid,
    /// Liquid raydium pool
    Liquid,
    /// 502 on every call
    Failing,
    /// Answers after the given delay
    Slow(Duration),
}

pub struct FakeMetrics {
    mode: Mutex<Mode>,
    pub calls: AtomicUsize,
}

impl FakeMetrics {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode: Mutex::new(mode),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn illiquid(mint: &str) -> MetricsSnapshot {
    let mut snapshot = MetricsSnapshot::empty(mint);
    snapshot.liquidity_usd = Some(500.0);
    snapshot.txns_5m = Some(TxnCounts { buys: 2, sells: 1 });
    snapshot.txns_1h = Some(TxnCounts { buys: 20, sells: 10 });
    snapshot
}

#[async_trait]
impl MetricsSource for FakeMetrics {
    async fn fetch(&self, mint: &str) -> Result<MetricsSnapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        match mode {
            Mode::Illiquid => Ok(illiquid(mint)),
            Mode::Liquid => {
                let mut snapshot = illiquid(mint);
                snapshot.liquidity_usd = Some(80_000.0);
                snapshot.pools = vec![PoolInfo {
                    dex_id: "raydium".into(),
                    pair_address: "pair".into(),
                    liquidity_usd: Some(80_000.0),
                }];
                Ok(snapshot)
            }
            Mode::Failing => Err(Error::Upstream("502 Bad Gateway".into())),
            Mode::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(illiquid(mint))
            }
        }
    }

    fn name(&self) -> &str {
        "fake"
    }
}

#[derive(Default)]
pub struct FixedProbe {
    sample: Mutex<ResourceSample>,
}

impl FixedProbe {
    pub fn set(&self, memory_mb: u64, cpu_pct: f32) {
        *self.sample.lock().unwrap() = ResourceSample {
            memory_bytes: memory_mb * 1024 * 1024,
            cpu_pct,
        };
    }
}

impl ResourceProbe for FixedProbe {
    fn sample(&self) -> ResourceSample {
        *self.sample.lock().unwrap()
    }
}

pub struct Harness {
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<MemoryStore>,
    pub metrics: Arc<FakeMetrics>,
    pub probe: Arc<FixedProbe>,
    pub alerts: mpsc::Receiver<Notification>,
}

impl Harness {
    pub fn new(config: &Config, mode: Mode) -> Self {
        let store = Arc::new(MemoryStore::in_memory());
        let metrics = Arc::new(FakeMetrics::new(mode));
        let probe = Arc::new(FixedProbe::default());
        let (notifier, alerts) = ChannelNotifier::new(256);
        let scheduler = Scheduler::new(
            config,
            Collaborators {
                metrics: metrics.clone(),
                transactions: None,
                persistence: store.clone(),
                notifier: Arc::new(notifier),
                probe: probe.clone(),
            },
        )
        .unwrap();
        Self {
            scheduler,
            store,
            metrics,
            probe,
            alerts,
        }
    }

    /// Drain every pending alert
    pub fn alerts(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = self.alerts.try_recv() {
            out.push(n);
        }
        out
    }
}
