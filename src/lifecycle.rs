//! Token lifecycle: monitoring -> active -> archived
//!
//! Decisions are pure functions of the token and this cycle's results. The
//! only state kept here is when each active token's smoothed score first
//! dropped below the floor, and it is updated only after a cycle commits.
//! Single-writer per token is guaranteed by the scheduler, which never runs
//! two pipelines for the same mint at once.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::types::{MetricsSnapshot, Token, TokenStatus};

/// Lifecycle thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// Minimum USD liquidity to promote a monitoring token
    #[serde(default = "default_min_liquidity_usd")]
    pub min_liquidity_usd: f64,
    /// DEX ids that count as a recognized pool (case-insensitive). Empty
    /// accepts any pool.
    #[serde(default = "default_recognized_dexes")]
    pub recognized_dexes: Vec<String>,
    /// Monitoring tokens older than this without promotion are archived
    #[serde(default = "default_monitoring_timeout_secs")]
    pub monitoring_timeout_secs: u64,
    /// Active tokens whose smoothed score stays below this...
    #[serde(default = "default_score_floor")]
    pub score_floor: f64,
    /// ...for longer than this are archived
    #[serde(default = "default_low_score_grace_secs")]
    pub low_score_grace_secs: u64,
}

fn default_min_liquidity_usd() -> f64 {
    10_000.0
}
fn default_recognized_dexes() -> Vec<String> {
    vec![
        "raydium".into(),
        "pumpswap".into(),
        "meteora".into(),
        "orca".into(),
    ]
}
fn default_monitoring_timeout_secs() -> u64 {
    6 * 3600
}
fn default_score_floor() -> f64 {
    0.2
}
fn default_low_score_grace_secs() -> u64 {
    3600
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            min_liquidity_usd: default_min_liquidity_usd(),
            recognized_dexes: default_recognized_dexes(),
            monitoring_timeout_secs: default_monitoring_timeout_secs(),
            score_floor: default_score_floor(),
            low_score_grace_secs: default_low_score_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveReason {
    MonitoringTimeout,
    LowScore,
}

impl fmt::Display for ArchiveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveReason::MonitoringTimeout => write!(f, "monitoring timeout"),
            ArchiveReason::LowScore => write!(f, "score below floor"),
        }
    }
}

/// Outcome of one lifecycle evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Stay,
    Promote,
    Archive(ArchiveReason),
    /// A transition may be due but the data is stale; decide next cycle
    Defer,
}

impl Transition {
    /// Status the token moves to, if any
    pub fn target(&self) -> Option<TokenStatus> {
        match self {
            Transition::Promote => Some(TokenStatus::Active),
            Transition::Archive(_) => Some(TokenStatus::Archived),
            Transition::Stay | Transition::Defer => None,
        }
    }
}

/// Inputs of one evaluation
#[derive(Debug, Clone, Copy)]
pub struct LifecycleInput<'a> {
    pub token: &'a Token,
    pub metrics: &'a MetricsSnapshot,
    /// Smoothed score after this cycle
    pub smoothed_score: f64,
    /// Metrics were fetched this cycle rather than served from cache
    pub data_fresh: bool,
    pub now: DateTime<Utc>,
}

pub struct LifecycleMachine {
    config: LifecycleConfig,
    below_floor_since: DashMap<String, DateTime<Utc>>,
}

impl LifecycleMachine {
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            config,
            below_floor_since: DashMap::new(),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Decide the transition for this cycle. Does not mutate anything.
    pub fn evaluate(&self, input: &LifecycleInput<'_>) -> Transition {
        let token = input.token;
        match token.status {
            TokenStatus::Archived => Transition::Stay,
            TokenStatus::Monitoring => {
                let promotable = self.is_promotable(input.metrics);
                let timed_out =
                    token.age_secs(input.now) >= self.config.monitoring_timeout_secs;
                if !promotable && !timed_out {
                    return Transition::Stay;
                }
                if !input.data_fresh {
                    return Transition::Defer;
                }
                if promotable {
                    Transition::Promote
                } else {
                    Transition::Archive(ArchiveReason::MonitoringTimeout)
                }
            }
            TokenStatus::Active => {
                if input.smoothed_score >= self.config.score_floor {
                    return Transition::Stay;
                }
                let since = self.below_floor_since(&token.mint).unwrap_or(input.now);
                let below_secs = input.now.signed_duration_since(since).num_seconds();
                if below_secs < self.config.low_score_grace_secs as i64 {
                    return Transition::Stay;
                }
                if !input.data_fresh {
                    return Transition::Defer;
                }
                Transition::Archive(ArchiveReason::LowScore)
            }
        }
    }

    /// Liquidity at or above the minimum and at least one recognized pool
    pub fn is_promotable(&self, metrics: &MetricsSnapshot) -> bool {
        let liquid = metrics
            .liquidity_usd
            .map(|l| l >= self.config.min_liquidity_usd)
            .unwrap_or(false);
        liquid && metrics.pools.iter().any(|p| self.is_recognized(&p.dex_id))
    }

    fn is_recognized(&self, dex_id: &str) -> bool {
        self.config.recognized_dexes.is_empty()
            || self
                .config
                .recognized_dexes
                .iter()
                .any(|d| d.eq_ignore_ascii_case(dex_id))
    }

    /// Record a committed smoothed score for the low-score grace period.
    /// `token` is the token after this cycle's transition; the period only
    /// runs while it is active, so a promotion starts it afresh.
    pub fn record_score(&self, token: &Token, smoothed_score: f64, now: DateTime<Utc>) {
        if token.status == TokenStatus::Active && smoothed_score < self.config.score_floor {
            self.below_floor_since.entry(token.mint.clone()).or_insert(now);
        } else {
            self.below_floor_since.remove(&token.mint);
        }
    }

    /// When the active token's score first fell below the floor
    pub fn below_floor_since(&self, mint: &str) -> Option<DateTime<Utc>> {
        self.below_floor_since.get(mint).map(|s| *s)
    }

    /// Forget tracking state for an archived token
    pub fn evict(&self, mint: &str) {
        self.below_floor_since.remove(mint);
    }
}

/// Apply a transition to a token, enforcing the legal transition table
pub fn apply(token: &Token, transition: Transition, now: DateTime<Utc>) -> Result<Option<Token>> {
    let Some(next) = transition.target() else {
        return Ok(None);
    };
    if !token.status.can_transition_to(next) {
        return Err(Error::IllegalTransition {
            mint: token.mint.clone(),
            from: token.status.to_string(),
            to: next.to_string(),
        });
    }
    let mut updated = token.clone();
    updated.status = next;
    updated.updated_at = now;
    if next == TokenStatus::Active {
        updated.promoted_at = Some(now);
    }
    Ok(Some(updated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::mint;
    use crate::types::PoolInfo;
    use chrono::Duration;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn machine() -> LifecycleMachine {
        LifecycleMachine::new(LifecycleConfig::default())
    }

    fn pool(dex: &str) -> PoolInfo {
        PoolInfo {
            dex_id: dex.to_string(),
            pair_address: "pair".to_string(),
            liquidity_usd: None,
        }
    }

    fn metrics(liquidity: Option<f64>, dexes: &[&str]) -> MetricsSnapshot {
        let mut m = MetricsSnapshot::empty(&mint(1));
        m.liquidity_usd = liquidity;
        m.pools = dexes.iter().map(|d| pool(d)).collect();
        m
    }

    fn input<'a>(token: &'a Token, m: &'a MetricsSnapshot, score: f64, fresh: bool) -> LifecycleInput<'a> {
        LifecycleInput {
            token,
            metrics: m,
            smoothed_score: score,
            data_fresh: fresh,
            now: Utc::now(),
        }
    }

    #[test]
    fn test_promotion_requires_liquidity_and_pool() {
        let token = Token::new(&mint(1), None, None).unwrap();
        let m = machine();

        let ok = metrics(Some(50_000.0), &["Raydium"]);
        assert_eq!(m.evaluate(&input(&token, &ok, 0.0, true)), Transition::Promote);

        let no_pool = metrics(Some(50_000.0), &["unknown-dex"]);
        assert_eq!(m.evaluate(&input(&token, &no_pool, 0.0, true)), Transition::Stay);

        let thin = metrics(Some(9_999.0), &["raydium"]);
        assert_eq!(m.evaluate(&input(&token, &thin, 0.9, true)), Transition::Stay);

        let missing = metrics(None, &["raydium"]);
        assert_eq!(m.evaluate(&input(&token, &missing, 0.9, true)), Transition::Stay);
    }

    #[test]
    fn test_stale_data_defers() {
        let token = Token::new(&mint(1), None, None).unwrap();
        let ok = metrics(Some(50_000.0), &["raydium"]);
        assert_eq!(machine().evaluate(&input(&token, &ok, 0.0, false)), Transition::Defer);

        let mut old = Token::new(&mint(2), None, None).unwrap();
        old.created_at = Utc::now() - Duration::days(1);
        let none = metrics(None, &[]);
        assert_eq!(machine().evaluate(&input(&old, &none, 0.0, false)), Transition::Defer);
    }

    #[test]
    fn test_monitoring_timeout() {
        let mut token = Token::new(&mint(1), None, None).unwrap();
        token.created_at = Utc::now() - Duration::hours(7);
        let m = metrics(Some(100.0), &[]);
        assert_eq!(
            machine().evaluate(&input(&token, &m, 0.9, true)),
            Transition::Archive(ArchiveReason::MonitoringTimeout)
        );
    }

    #[test]
    fn test_low_score_grace_period() {
        let m = machine();
        let mut token = Token::new(&mint(1), None, None).unwrap();
        token.status = TokenStatus::Active;
        let snapshot = metrics(Some(50_000.0), &["raydium"]);
        let now = Utc::now();

        // First low score starts the grace period
        let first = LifecycleInput { now, ..input(&token, &snapshot, 0.1, true) };
        assert_eq!(m.evaluate(&first), Transition::Stay);
        m.record_score(&token, 0.1, now);

        let later = now + Duration::seconds(3601);
        let second = LifecycleInput { now: later, ..input(&token, &snapshot, 0.1, true) };
        assert_eq!(m.evaluate(&second), Transition::Archive(ArchiveReason::LowScore));

        // Recovery clears the timer
        m.record_score(&token, 0.5, later);
        let third = LifecycleInput { now: later, ..input(&token, &snapshot, 0.1, true) };
        assert_eq!(m.evaluate(&third), Transition::Stay);
    }

    #[test]
    fn test_grace_period_only_runs_while_active() {
        let m = machine();
        let mut token = Token::new(&mint(1), None, None).unwrap();
        let now = Utc::now();

        // Low scores while monitoring start nothing
        m.record_score(&token, 0.05, now);
        assert!(m.below_floor_since(&token.mint).is_none());

        // Promotion starts the period at the promotion time
        let promoted_at = now + Duration::hours(2);
        token = apply(&token, Transition::Promote, promoted_at).unwrap().unwrap();
        m.record_score(&token, 0.05, promoted_at);
        assert_eq!(m.below_floor_since(&token.mint), Some(promoted_at));

        let snapshot = metrics(Some(50_000.0), &["raydium"]);
        let soon = LifecycleInput {
            now: promoted_at + Duration::minutes(1),
            ..input(&token, &snapshot, 0.05, true)
        };
        assert_eq!(m.evaluate(&soon), Transition::Stay);
    }

    #[test]
    fn test_apply_enforces_legal_transitions() {
        let token = Token::new(&mint(1), None, None).unwrap();
        let now = Utc::now();
        let active = apply(&token, Transition::Promote, now).unwrap().unwrap();
        assert_eq!(active.status, TokenStatus::Active);
        assert_eq!(active.promoted_at, Some(now));

        assert!(matches!(
            apply(&active, Transition::Promote, now),
            Err(Error::IllegalTransition { .. })
        ));

        let archived = apply(&active, Transition::Archive(ArchiveReason::LowScore), now)
            .unwrap()
            .unwrap();
        assert!(apply(&archived, Transition::Promote, now).is_err());
        assert!(apply(&archived, Transition::Stay, now).unwrap().is_none());
    }

    #[test]
    fn test_illiquid_monitoring_never_promotes() {
        let m = machine();
        let token = Token::new(&mint(1), None, None).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let dexes = ["raydium", "orca", "meteora", "pumpswap", "other"];
        for _ in 0..1000 {
            let mut snapshot = MetricsSnapshot::empty(&token.mint);
            snapshot.liquidity_usd = if rng.gen_bool(0.9) {
                Some(rng.gen_range(-1_000.0..m.config().min_liquidity_usd))
            } else {
                None
            };
            let pools = rng.gen_range(0..4);
            snapshot.pools = (0..pools)
                .map(|_| PoolInfo {
                    dex_id: dexes[rng.gen_range(0..dexes.len())].to_string(),
                    pair_address: "p".into(),
                    liquidity_usd: Some(rng.gen_range(0.0..1e9)),
                })
                .collect();
            let score = rng.gen_range(0.0..1.0);
            let fresh = rng.gen_bool(0.8);
            let t = m.evaluate(&input(&token, &snapshot, score, fresh));
            assert_ne!(t, Transition::Promote);
        }
    }

    #[test]
    fn test_archived_is_terminal() {
        let m = machine();
        let mut token = Token::new(&mint(1), None, None).unwrap();
        token.status = TokenStatus::Archived;
        let liquid = metrics(Some(1e9), &["raydium"]);
        for score in [0.0, 0.5, 1.0] {
            for fresh in [true, false] {
                let t = m.evaluate(&input(&token, &liquid, score, fresh));
                assert_eq!(t, Transition::Stay);
                assert!(apply(&token, t, Utc::now()).unwrap().is_none());
            }
        }
    }
}
