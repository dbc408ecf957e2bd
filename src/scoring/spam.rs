//! Spam pattern detection
//!
//! Classifies a capped sample of recent transactions. A transaction matches
//! when it invokes a configured wash-trading program, or when one account
//! both sends and receives the token inside the same transaction (a
//! self-trade round trip). Transactions paid for by whitelisted addresses
//! are excluded from both sides of the ratio.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::sources::TransactionSource;
use crate::types::{RiskTier, SpamMetrics, TransactionSample};

/// Spam detector configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SpamConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Transactions fetched per analysis
    #[serde(default = "default_sample_limit")]
    pub sample_limit: usize,
    /// Minimum time between analyses of one token
    #[serde(default = "default_cadence_secs")]
    pub cadence_secs: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Ratio (%) at which the tier becomes medium
    #[serde(default = "default_medium_threshold")]
    pub medium_threshold_pct: f64,
    /// Ratio (%) above which the tier becomes high
    #[serde(default = "default_high_threshold")]
    pub high_threshold_pct: f64,
    /// Fee payers ignored by the analysis (routers, known market makers)
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Program IDs whose invocation marks a transaction as spam
    #[serde(default)]
    pub signature_program_ids: Vec<String>,
    #[serde(default = "default_true")]
    pub detect_round_trips: bool,
}

fn default_true() -> bool {
    true
}
fn default_sample_limit() -> usize {
    100
}
fn default_cadence_secs() -> u64 {
    300
}
fn default_timeout_ms() -> u64 {
    5_000
}
fn default_medium_threshold() -> f64 {
    30.0
}
fn default_high_threshold() -> f64 {
    70.0
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_limit: default_sample_limit(),
            cadence_secs: default_cadence_secs(),
            timeout_ms: default_timeout_ms(),
            medium_threshold_pct: default_medium_threshold(),
            high_threshold_pct: default_high_threshold(),
            whitelist: Vec::new(),
            signature_program_ids: Vec::new(),
            detect_round_trips: true,
        }
    }
}

/// Pure classifier over a transaction sample
#[derive(Debug, Clone)]
pub struct SpamDetector {
    medium_threshold_pct: f64,
    high_threshold_pct: f64,
    whitelist: HashSet<String>,
    signature_programs: HashSet<String>,
    detect_round_trips: bool,
}

impl SpamDetector {
    pub fn new(config: &SpamConfig) -> Self {
        Self {
            medium_threshold_pct: config.medium_threshold_pct,
            high_threshold_pct: config.high_threshold_pct,
            whitelist: config.whitelist.iter().cloned().collect(),
            signature_programs: config.signature_program_ids.iter().cloned().collect(),
            detect_round_trips: config.detect_round_trips,
        }
    }

    /// Analyze a sample. An empty (or fully whitelisted) sample is clean.
    pub fn analyze(&self, mint: &str, samples: &[TransactionSample], now: DateTime<Utc>) -> SpamMetrics {
        let considered: Vec<&TransactionSample> = samples
            .iter()
            .filter(|tx| {
                tx.fee_payer
                    .as_ref()
                    .map(|payer| !self.whitelist.contains(payer))
                    .unwrap_or(true)
            })
            .collect();

        if considered.is_empty() {
            return SpamMetrics::clean(now);
        }

        let flagged = considered.iter().filter(|tx| self.is_spam(mint, tx)).count();
        let ratio_pct = flagged as f64 / considered.len() as f64 * 100.0;

        SpamMetrics {
            ratio_pct,
            tier: self.tier_for(ratio_pct),
            sample_size: considered.len(),
            computed_at: now,
            stale: false,
        }
    }

    pub fn tier_for(&self, ratio_pct: f64) -> RiskTier {
        if ratio_pct > self.high_threshold_pct {
            RiskTier::High
        } else if ratio_pct >= self.medium_threshold_pct {
            RiskTier::Medium
        } else {
            RiskTier::Low
        }
    }

    fn is_spam(&self, mint: &str, tx: &TransactionSample) -> bool {
        if tx
            .program_ids
            .iter()
            .any(|p| self.signature_programs.contains(p))
        {
            return true;
        }
        self.detect_round_trips && is_round_trip(mint, tx)
    }
}

/// Some account both sends and receives `mint` within one transaction
fn is_round_trip(mint: &str, tx: &TransactionSample) -> bool {
    let senders: HashSet<&str> = tx
        .token_transfers
        .iter()
        .filter(|t| t.mint == mint)
        .filter_map(|t| t.from.as_deref())
        .collect();
    tx.token_transfers
        .iter()
        .filter(|t| t.mint == mint)
        .filter_map(|t| t.to.as_deref())
        .any(|to| senders.contains(to))
}

/// Outcome of a tracker refresh
#[derive(Debug, Clone, PartialEq)]
pub enum SpamRefresh {
    Fresh(SpamMetrics),
    /// Analysis failed; the previous result is reused and flagged stale
    Stale(SpamMetrics),
    /// Analysis failed and there is nothing to reuse
    Unavailable,
}

impl SpamRefresh {
    pub fn metrics(&self) -> Option<&SpamMetrics> {
        match self {
            SpamRefresh::Fresh(m) | SpamRefresh::Stale(m) => Some(m),
            SpamRefresh::Unavailable => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, SpamRefresh::Fresh(_))
    }
}

/// Per-token spam results, refreshed on their own cadence
pub struct SpamTracker {
    config: SpamConfig,
    detector: SpamDetector,
    latest: DashMap<String, SpamMetrics>,
    last_attempt: DashMap<String, Instant>,
}

impl SpamTracker {
    pub fn new(config: SpamConfig) -> Self {
        Self {
            detector: SpamDetector::new(&config),
            config,
            latest: DashMap::new(),
            last_attempt: DashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Whether an analysis should run this cycle
    pub fn is_due(&self, mint: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        match self.last_attempt.get(mint) {
            Some(at) => at.elapsed() >= Duration::from_secs(self.config.cadence_secs),
            None => true,
        }
    }

    /// Last known result, stale or not
    pub fn current(&self, mint: &str) -> Option<SpamMetrics> {
        self.latest.get(mint).map(|m| m.clone())
    }

    /// Fetch a sample and analyze it. Failures and timeouts never block the
    /// caller beyond `timeout_ms`; they fall back to the previous result.
    pub async fn refresh(&self, mint: &str, source: &dyn TransactionSource) -> SpamRefresh {
        self.last_attempt.insert(mint.to_string(), Instant::now());

        let timeout = Duration::from_millis(self.config.timeout_ms);
        let fetched = tokio::time::timeout(
            timeout,
            source.fetch_recent_transactions(mint, self.config.sample_limit),
        )
        .await;

        match fetched {
            Ok(Ok(samples)) => {
                let metrics = self.detector.analyze(mint, &samples, Utc::now());
                debug!(
                    mint = %mint,
                    ratio = metrics.ratio_pct,
                    tier = %metrics.tier,
                    sample = metrics.sample_size,
                    "Spam analysis complete"
                );
                self.latest.insert(mint.to_string(), metrics.clone());
                SpamRefresh::Fresh(metrics)
            }
            Ok(Err(e)) => {
                warn!(mint = %mint, error = %e, "Spam analysis failed, reusing previous result");
                self.stale_fallback(mint)
            }
            Err(_) => {
                warn!(mint = %mint, timeout_ms = self.config.timeout_ms, "Spam analysis timed out");
                self.stale_fallback(mint)
            }
        }
    }

    fn stale_fallback(&self, mint: &str) -> SpamRefresh {
        match self.latest.get_mut(mint) {
            Some(mut m) => {
                m.stale = true;
                SpamRefresh::Stale(m.clone())
            }
            None => SpamRefresh::Unavailable,
        }
    }

    pub fn evict(&self, mint: &str) {
        self.latest.remove(mint);
        self.last_attempt.remove(mint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::types::TokenMovement;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    const MINT: &str = "MintAAA";
    const WASH_PROGRAM: &str = "WashProgram111";

    fn tx(payer: &str, programs: &[&str], transfers: &[(&str, &str)]) -> TransactionSample {
        TransactionSample {
            signature: format!("sig-{}", payer),
            fee_payer: Some(payer.to_string()),
            program_ids: programs.iter().map(|p| p.to_string()).collect(),
            token_transfers: transfers
                .iter()
                .map(|(from, to)| TokenMovement {
                    from: Some(from.to_string()),
                    to: Some(to.to_string()),
                    mint: MINT.to_string(),
                    amount: 1.0,
                })
                .collect(),
            timestamp: None,
        }
    }

    fn config() -> SpamConfig {
        SpamConfig {
            signature_program_ids: vec![WASH_PROGRAM.to_string()],
            whitelist: vec!["router".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_sample_is_clean() {
        let detector = SpamDetector::new(&config());
        let m = detector.analyze(MINT, &[], Utc::now());
        assert_eq!(m.ratio_pct, 0.0);
        assert_eq!(m.tier, RiskTier::Low);
        assert_eq!(m.sample_size, 0);
    }

    #[test]
    fn test_ratio_and_tier() {
        let detector = SpamDetector::new(&config());
        let samples = vec![
            tx("a", &[WASH_PROGRAM], &[]),
            tx("b", &[], &[("x", "y"), ("y", "x")]),
            tx("c", &["Jupiter"], &[("x", "y")]),
            tx("d", &[], &[]),
        ];
        let m = detector.analyze(MINT, &samples, Utc::now());
        assert!((m.ratio_pct - 50.0).abs() < 1e-9);
        assert_eq!(m.tier, RiskTier::Medium);
        assert_eq!(m.sample_size, 4);
    }

    #[test]
    fn test_whitelist_excluded_from_denominator() {
        let detector = SpamDetector::new(&config());
        let samples = vec![
            tx("a", &[WASH_PROGRAM], &[]),
            tx("router", &[], &[]),
            tx("router", &[], &[]),
            tx("router", &[WASH_PROGRAM], &[]),
        ];
        let m = detector.analyze(MINT, &samples, Utc::now());
        assert_eq!(m.sample_size, 1);
        assert_eq!(m.ratio_pct, 100.0);
        assert_eq!(m.tier, RiskTier::High);
    }

    #[test]
    fn test_tier_boundaries() {
        let detector = SpamDetector::new(&SpamConfig::default());
        assert_eq!(detector.tier_for(29.9), RiskTier::Low);
        assert_eq!(detector.tier_for(30.0), RiskTier::Medium);
        assert_eq!(detector.tier_for(70.0), RiskTier::Medium);
        assert_eq!(detector.tier_for(70.1), RiskTier::High);
    }

    #[test]
    fn test_round_trip_ignores_other_mints() {
        let mut sample = tx("a", &[], &[("x", "y")]);
        sample.token_transfers.push(TokenMovement {
            from: Some("y".into()),
            to: Some("x".into()),
            mint: "OtherMint".into(),
            amount: 1.0,
        });
        assert!(!is_round_trip(MINT, &sample));
    }

    struct FlakySource {
        fail: AtomicBool,
    }

    #[async_trait]
    impl TransactionSource for FlakySource {
        async fn fetch_recent_transactions(
            &self,
            _mint: &str,
            _limit: usize,
        ) -> Result<Vec<TransactionSample>> {
            if self.fail.load(Ordering::SeqCst) {
                Err(Error::Upstream("rpc down".into()))
            } else {
                Ok(vec![tx("a", &[WASH_PROGRAM], &[]), tx("b", &[], &[])])
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_reuses_stale_result() {
        let tracker = SpamTracker::new(SpamConfig {
            cadence_secs: 60,
            ..config()
        });
        let source = FlakySource {
            fail: AtomicBool::new(true),
        };

        assert!(tracker.is_due(MINT));
        assert_eq!(tracker.refresh(MINT, &source).await, SpamRefresh::Unavailable);
        assert!(!tracker.is_due(MINT));

        tokio::time::advance(Duration::from_secs(61)).await;
        source.fail.store(false, Ordering::SeqCst);
        let fresh = tracker.refresh(MINT, &source).await;
        assert!(matches!(fresh, SpamRefresh::Fresh(ref m) if !m.stale && m.ratio_pct == 50.0));

        source.fail.store(true, Ordering::SeqCst);
        let stale = tracker.refresh(MINT, &source).await;
        match stale {
            SpamRefresh::Stale(m) => {
                assert!(m.stale);
                assert_eq!(m.ratio_pct, 50.0);
            }
            other => panic!("expected stale result, got {:?}", other),
        }
        assert!(tracker.current(MINT).unwrap().stale);
    }
}
