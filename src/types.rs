//! Shared data structures for the scoring pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::scoring::ModelKind;

/// Monitoring status of a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    /// Initial state, assigned when the migration is first seen
    Monitoring,
    /// Tradable pool with sufficient liquidity confirmed
    Active,
    /// Terminal
    Archived,
}

impl TokenStatus {
    /// Legal transitions: monitoring->active, monitoring->archived, active->archived
    pub fn can_transition_to(self, next: TokenStatus) -> bool {
        matches!(
            (self, next),
            (TokenStatus::Monitoring, TokenStatus::Active)
                | (TokenStatus::Monitoring, TokenStatus::Archived)
                | (TokenStatus::Active, TokenStatus::Archived)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == TokenStatus::Archived
    }
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenStatus::Monitoring => "monitoring",
            TokenStatus::Active => "active",
            TokenStatus::Archived => "archived",
        };
        write!(f, "{}", s)
    }
}

/// A token tracked after its DEX migration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// Mint address (unique)
    pub mint: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub status: TokenStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the token was promoted to active
    #[serde(default)]
    pub promoted_at: Option<DateTime<Utc>>,
}

impl Token {
    /// Create a token in `monitoring` state
    pub fn new(mint: &str, name: Option<String>, symbol: Option<String>) -> Result<Self> {
        validate_mint(mint)?;
        let now = Utc::now();
        Ok(Self {
            mint: mint.to_string(),
            name,
            symbol,
            status: TokenStatus::Monitoring,
            created_at: now,
            updated_at: now,
            promoted_at: None,
        })
    }

    /// Age of the token at `now`, in seconds (never negative)
    pub fn age_secs(&self, now: DateTime<Utc>) -> u64 {
        now.signed_duration_since(self.created_at).num_seconds().max(0) as u64
    }
}

/// Check that a mint is a base58 encoded 32-byte public key
pub fn validate_mint(mint: &str) -> Result<()> {
    match bs58::decode(mint).into_vec() {
        Ok(bytes) if bytes.len() == 32 => Ok(()),
        Ok(bytes) => Err(Error::InvalidMint(format!(
            "{} decodes to {} bytes, expected 32",
            mint,
            bytes.len()
        ))),
        Err(e) => Err(Error::InvalidMint(format!("{}: {}", mint, e))),
    }
}

/// Buy/sell counts over a window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TxnCounts {
    pub buys: u32,
    pub sells: u32,
}

impl TxnCounts {
    pub fn total(&self) -> u32 {
        self.buys.saturating_add(self.sells)
    }
}

/// A DEX pool the token trades in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub dex_id: String,
    pub pair_address: String,
    pub liquidity_usd: Option<f64>,
}

/// Per-cycle external metrics for one token. Every market field is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub mint: String,
    pub liquidity_usd: Option<f64>,
    pub price_change_5m: Option<f64>,
    pub price_change_15m: Option<f64>,
    pub txns_5m: Option<TxnCounts>,
    pub txns_1h: Option<TxnCounts>,
    pub volume_5m: Option<f64>,
    pub volume_1h: Option<f64>,
    /// When the oldest pool was created (token freshness)
    pub pair_created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pools: Vec<PoolInfo>,
    pub fetched_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    /// Snapshot with every optional field absent
    pub fn empty(mint: &str) -> Self {
        Self {
            mint: mint.to_string(),
            liquidity_usd: None,
            price_change_5m: None,
            price_change_15m: None,
            txns_5m: None,
            txns_1h: None,
            volume_5m: None,
            volume_1h: None,
            pair_created_at: None,
            pools: Vec::new(),
            fetched_at: Utc::now(),
        }
    }
}

/// The four bounded scoring components
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentSet {
    /// [0, 1]
    pub tx_accel: f64,
    /// [0, 1]
    pub vol_momentum: f64,
    /// [0, 1]
    pub token_freshness: f64,
    /// [-1, 1]
    pub orderflow_imbalance: f64,
}

impl ComponentSet {
    pub fn new(tx_accel: f64, vol_momentum: f64, token_freshness: f64, orderflow_imbalance: f64) -> Self {
        Self {
            tx_accel,
            vol_momentum,
            token_freshness,
            orderflow_imbalance,
        }
        .clamped()
    }

    /// Neutral defaults used for missing inputs
    pub fn neutral() -> Self {
        Self {
            tx_accel: 0.0,
            vol_momentum: 0.0,
            token_freshness: 0.0,
            orderflow_imbalance: 0.0,
        }
    }

    /// Force every field into its range; NaN maps to the neutral value
    pub fn clamped(self) -> Self {
        Self {
            tx_accel: clamp_or_zero(self.tx_accel, 0.0, 1.0),
            vol_momentum: clamp_or_zero(self.vol_momentum, 0.0, 1.0),
            token_freshness: clamp_or_zero(self.token_freshness, 0.0, 1.0),
            orderflow_imbalance: clamp_or_zero(self.orderflow_imbalance, -1.0, 1.0),
        }
    }

    pub fn is_bounded(&self) -> bool {
        (0.0..=1.0).contains(&self.tx_accel)
            && (0.0..=1.0).contains(&self.vol_momentum)
            && (0.0..=1.0).contains(&self.token_freshness)
            && (-1.0..=1.0).contains(&self.orderflow_imbalance)
    }
}

fn clamp_or_zero(value: f64, min: f64, max: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(min, max)
    }
}

/// Spam risk tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
        };
        write!(f, "{}", s)
    }
}

/// Result of spam pattern analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpamMetrics {
    /// Percentage of sampled transactions matching a spam signature, [0, 100]
    pub ratio_pct: f64,
    pub tier: RiskTier,
    pub sample_size: usize,
    pub computed_at: DateTime<Utc>,
    /// Reused from an earlier analysis because the latest one failed
    #[serde(default)]
    pub stale: bool,
}

impl SpamMetrics {
    pub fn clean(computed_at: DateTime<Utc>) -> Self {
        Self {
            ratio_pct: 0.0,
            tier: RiskTier::Low,
            sample_size: 0,
            computed_at,
            stale: false,
        }
    }
}

/// Token movement inside a sampled transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenMovement {
    pub from: Option<String>,
    pub to: Option<String>,
    pub mint: String,
    pub amount: f64,
}

/// A recent on-chain transaction touching the token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionSample {
    pub signature: String,
    pub fee_payer: Option<String>,
    #[serde(default)]
    pub program_ids: Vec<String>,
    #[serde(default)]
    pub token_transfers: Vec<TokenMovement>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Immutable history record, one per (token, completed cycle)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreSnapshot {
    pub mint: String,
    pub cycle: u64,
    pub raw_score: f64,
    pub smoothed_score: f64,
    pub raw_components: ComponentSet,
    pub smoothed_components: ComponentSet,
    pub spam: Option<SpamMetrics>,
    pub model: ModelKind,
    /// Scored from a cached snapshot instead of a fresh fetch
    #[serde(default)]
    pub data_stale: bool,
    pub timestamp: DateTime<Utc>,
}

/// Scheduling priority class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Hot,
    Cold,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Hot => write!(f, "hot"),
            Tier::Cold => write!(f, "cold"),
        }
    }
}
