//! Component extraction
//!
//! Turns one metrics snapshot into bounded scoring components. Every
//! transform is monotonic in a single input signal. Missing inputs map to
//! 0.0 and never fail the cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scoring::model::clamp01;
use crate::types::{ComponentSet, MetricsSnapshot};

/// Extractor tuning
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractorConfig {
    /// Short-window/baseline ratio that maps to tx_accel = 1.0
    #[serde(default = "default_saturation")]
    pub tx_accel_saturation: f64,
    /// Short-window/baseline volume ratio that maps to vol_momentum = 1.0
    #[serde(default = "default_saturation")]
    pub vol_momentum_saturation: f64,
    /// Age at which freshness reaches 0.0
    #[serde(default = "default_freshness_horizon_secs")]
    pub freshness_horizon_secs: u64,
    /// Liquidity that maps to the legacy liquidity factor 1.0
    #[serde(default = "default_legacy_liquidity_ref_usd")]
    pub legacy_liquidity_ref_usd: f64,
    /// 5m transaction count that maps to the legacy transactions factor 1.0
    #[serde(default = "default_legacy_txn_ref_5m")]
    pub legacy_txn_ref_5m: f64,
}

fn default_saturation() -> f64 {
    3.0
}
fn default_freshness_horizon_secs() -> u64 {
    6 * 3600
}
fn default_legacy_liquidity_ref_usd() -> f64 {
    100_000.0
}
fn default_legacy_txn_ref_5m() -> f64 {
    200.0
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            tx_accel_saturation: default_saturation(),
            vol_momentum_saturation: default_saturation(),
            freshness_horizon_secs: default_freshness_horizon_secs(),
            legacy_liquidity_ref_usd: default_legacy_liquidity_ref_usd(),
            legacy_txn_ref_5m: default_legacy_txn_ref_5m(),
        }
    }
}

/// Inputs of the legacy model, each in [0, 1]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LegacyFactors {
    pub stability: f64,
    pub liquidity: f64,
    pub momentum: f64,
    pub transactions: f64,
}

/// Stateless snapshot-to-components transform
#[derive(Debug, Clone, Default)]
pub struct ComponentExtractor {
    config: ExtractorConfig,
}

impl ComponentExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self { config }
    }

    /// Raw components for this cycle
    pub fn extract(&self, snapshot: &MetricsSnapshot, now: DateTime<Utc>) -> ComponentSet {
        ComponentSet::new(
            self.tx_accel(snapshot),
            self.vol_momentum(snapshot),
            self.freshness(snapshot, now),
            orderflow_imbalance(snapshot),
        )
    }

    /// Short-window transaction count against the 1h average per 5m
    fn tx_accel(&self, snapshot: &MetricsSnapshot) -> f64 {
        match (snapshot.txns_5m, snapshot.txns_1h) {
            (Some(short), Some(hour)) => acceleration(
                short.total() as f64,
                hour.total() as f64 / 12.0,
                self.config.tx_accel_saturation,
            ),
            _ => 0.0,
        }
    }

    fn vol_momentum(&self, snapshot: &MetricsSnapshot) -> f64 {
        match (snapshot.volume_5m, snapshot.volume_1h) {
            (Some(short), Some(hour)) => {
                acceleration(short, hour / 12.0, self.config.vol_momentum_saturation)
            }
            _ => 0.0,
        }
    }

    /// 1.0 at age 0, falling linearly to 0.0 at the horizon
    fn freshness(&self, snapshot: &MetricsSnapshot, now: DateTime<Utc>) -> f64 {
        let Some(created) = snapshot.pair_created_at else {
            return 0.0;
        };
        let horizon = self.config.freshness_horizon_secs as f64;
        if horizon <= 0.0 {
            return 0.0;
        }
        let age = now.signed_duration_since(created).num_milliseconds().max(0) as f64 / 1000.0;
        clamp01(1.0 - age / horizon)
    }

    /// Factors for the legacy model
    pub fn legacy_factors(&self, snapshot: &MetricsSnapshot) -> LegacyFactors {
        // Price changes are percentages
        let stability = snapshot
            .price_change_5m
            .map(|pc| clamp01(1.0 - pc.abs() / 100.0))
            .unwrap_or(0.0);

        let liquidity = snapshot
            .liquidity_usd
            .map(|l| ratio(l, self.config.legacy_liquidity_ref_usd))
            .unwrap_or(0.0);

        let momentum = snapshot
            .price_change_15m
            .or(snapshot.price_change_5m)
            .map(|pc| clamp01((pc / 100.0 + 1.0) / 2.0))
            .unwrap_or(0.0);

        let transactions = snapshot
            .txns_5m
            .map(|t| ratio(t.total() as f64, self.config.legacy_txn_ref_5m))
            .unwrap_or(0.0);

        LegacyFactors {
            stability,
            liquidity,
            momentum,
            transactions,
        }
    }
}

fn orderflow_imbalance(snapshot: &MetricsSnapshot) -> f64 {
    match snapshot.txns_5m {
        Some(t) if t.total() > 0 => {
            (t.buys as f64 - t.sells as f64) / t.total() as f64
        }
        _ => 0.0,
    }
}

/// `short / baseline` scaled so `saturation` maps to 1.0. Activity over an
/// empty baseline saturates.
fn acceleration(short: f64, baseline: f64, saturation: f64) -> f64 {
    if !short.is_finite() || short <= 0.0 {
        return 0.0;
    }
    if !baseline.is_finite() || baseline <= 0.0 {
        return 1.0;
    }
    ratio(short / baseline, saturation)
}

fn ratio(value: f64, reference: f64) -> f64 {
    if reference <= 0.0 {
        return 0.0;
    }
    clamp01(value / reference)
}
