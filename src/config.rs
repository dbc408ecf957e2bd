//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

// Re-export subsystem configs
pub use crate::cache::CacheConfig;
pub use crate::guard::circuit_breaker::BreakerConfig;
pub use crate::guard::memory::MemoryConfig;
pub use crate::lifecycle::LifecycleConfig;
pub use crate::scheduler::SchedulerConfig;
pub use crate::scoring::components::ExtractorConfig;
pub use crate::scoring::spam::SpamConfig;
pub use crate::scoring::{HybridWeights, LegacyWeights, ModelKind};

use crate::sources::SettingsStore;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub extractor: ExtractorConfig,
    #[serde(default)]
    pub spam: SpamConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Scoring model selection and weights
#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    /// Active model, a startup decision
    #[serde(default)]
    pub model: ModelKind,
    /// EWMA smoothing factor in (0, 1]
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_hybrid_weights")]
    pub hybrid_weights: Option<HybridWeights>,
    /// No defaults: selecting the legacy model requires explicit weights
    #[serde(default)]
    pub legacy_weights: Option<LegacyWeights>,
    /// Spam ratio (%) above which the hybrid score is scaled down
    #[serde(default)]
    pub spam_penalty_threshold_pct: f64,
}

fn default_alpha() -> f64 {
    0.3
}

fn default_hybrid_weights() -> Option<HybridWeights> {
    Some(HybridWeights::default())
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            model: ModelKind::Hybrid,
            alpha: default_alpha(),
            hybrid_weights: default_hybrid_weights(),
            legacy_weights: None,
            spam_penalty_threshold_pct: 0.0,
        }
    }
}

/// Retry policy for transient upstream failures
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Upstream endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    #[serde(default = "default_dexscreener_url")]
    pub dexscreener_url: String,
    #[serde(default = "default_helius_url")]
    pub helius_url: String,
    #[serde(default = "default_helius_api_key")]
    pub helius_api_key: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_dexscreener_url() -> String {
    std::env::var("DEXSCREENER_URL").unwrap_or_else(|_| "https://api.dexscreener.com".into())
}

fn default_helius_url() -> String {
    "https://api.helius.xyz".into()
}

fn default_helius_api_key() -> String {
    std::env::var("HELIUS_API_KEY").unwrap_or_default()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            dexscreener_url: default_dexscreener_url(),
            helius_url: default_helius_url(),
            helius_api_key: default_helius_api_key(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Snapshot store
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// JSON file the in-memory store is flushed to; `None` keeps it in memory
    #[serde(default)]
    pub path: Option<String>,
    /// In-memory history retained per token (0 = unlimited)
    #[serde(default = "default_max_history_per_token")]
    pub max_history_per_token: usize,
}

fn default_max_history_per_token() -> usize {
    2_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_history_per_token: default_max_history_per_token(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix SCOUT__)
            .add_source(
                config::Environment::with_prefix("SCOUT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let s = &self.scoring;
        if !(s.alpha > 0.0 && s.alpha <= 1.0) {
            anyhow::bail!("scoring.alpha must be in (0, 1], got {}", s.alpha);
        }

        match s.model {
            ModelKind::Hybrid => {
                let w = s
                    .hybrid_weights
                    .as_ref()
                    .context("scoring.model = hybrid but scoring.hybrid_weights is missing")?;
                if (w.sum() - 1.0).abs() > 1e-6 {
                    warn!(sum = w.sum(), "Hybrid weights do not sum to 1.0");
                }
            }
            ModelKind::Legacy => {
                let w = s
                    .legacy_weights
                    .as_ref()
                    .context("scoring.model = legacy but scoring.legacy_weights is missing")?;
                if (w.sum() - 1.0).abs() > 1e-6 {
                    warn!(sum = w.sum(), "Legacy weights do not sum to 1.0");
                }
            }
        }

        if !(0.0..100.0).contains(&s.spam_penalty_threshold_pct) {
            anyhow::bail!("scoring.spam_penalty_threshold_pct must be in [0, 100)");
        }

        if self.spam.medium_threshold_pct > self.spam.high_threshold_pct {
            anyhow::bail!("spam.medium_threshold_pct cannot exceed spam.high_threshold_pct");
        }

        let sched = &self.scheduler;
        if sched.parallelism_floor == 0 || sched.parallelism_floor > sched.parallelism_ceiling {
            anyhow::bail!(
                "scheduler.parallelism_floor ({}) must be in 1..=parallelism_ceiling ({})",
                sched.parallelism_floor,
                sched.parallelism_ceiling
            );
        }
        if sched.low_water >= sched.high_water {
            anyhow::bail!("scheduler.low_water must be below scheduler.high_water");
        }
        if sched.min_batch_size == 0 || sched.min_batch_size > sched.batch_size {
            anyhow::bail!("scheduler.min_batch_size must be in 1..=batch_size");
        }
        if sched.base_timeout_ms > sched.max_timeout_ms {
            anyhow::bail!("scheduler.base_timeout_ms cannot exceed scheduler.max_timeout_ms");
        }
        if sched.hot_interval_secs > sched.cold_interval_secs {
            warn!("Hot tier interval is longer than cold tier interval");
        }

        if self.memory.soft_limit_mb >= self.memory.hard_limit_mb {
            anyhow::bail!("memory.soft_limit_mb must be below memory.hard_limit_mb");
        }
        if self.cache.base_ttl_secs > self.cache.max_ttl_secs {
            anyhow::bail!("cache.base_ttl_secs cannot exceed cache.max_ttl_secs");
        }
        if self.breaker.failure_threshold == 0 {
            anyhow::bail!("breaker.failure_threshold must be positive");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be positive");
        }

        url::Url::parse(&self.sources.dexscreener_url)
            .with_context(|| format!("Invalid dexscreener_url: {}", self.sources.dexscreener_url))?;
        url::Url::parse(&self.sources.helius_url)
            .with_context(|| format!("Invalid helius_url: {}", self.sources.helius_url))?;

        Ok(())
    }

    /// Overlay values from a runtime settings store. Absent keys keep their
    /// current value; unparseable values are logged and ignored.
    pub fn apply_settings(&mut self, store: &dyn SettingsStore) -> Result<()> {
        overlay(store, "scoring.model", &mut self.scoring.model);
        overlay(store, "scoring.alpha", &mut self.scoring.alpha);
        overlay(
            store,
            "scoring.spam_penalty_threshold_pct",
            &mut self.scoring.spam_penalty_threshold_pct,
        );

        if let Some(w) = self.scoring.hybrid_weights.as_mut() {
            overlay(store, "scoring.hybrid_weights.tx_accel", &mut w.tx_accel);
            overlay(store, "scoring.hybrid_weights.vol_momentum", &mut w.vol_momentum);
            overlay(store, "scoring.hybrid_weights.freshness", &mut w.freshness);
            overlay(store, "scoring.hybrid_weights.orderflow", &mut w.orderflow);
        }

        match self.scoring.legacy_weights.as_mut() {
            Some(w) => {
                overlay(store, "scoring.legacy_weights.stability", &mut w.stability);
                overlay(store, "scoring.legacy_weights.liquidity", &mut w.liquidity);
                overlay(store, "scoring.legacy_weights.momentum", &mut w.momentum);
                overlay(store, "scoring.legacy_weights.transactions", &mut w.transactions);
            }
            None => {
                // Only a complete weight set can introduce the legacy model
                let parsed = (
                    parse_setting::<f64>(store, "scoring.legacy_weights.stability"),
                    parse_setting::<f64>(store, "scoring.legacy_weights.liquidity"),
                    parse_setting::<f64>(store, "scoring.legacy_weights.momentum"),
                    parse_setting::<f64>(store, "scoring.legacy_weights.transactions"),
                );
                if let (Some(stability), Some(liquidity), Some(momentum), Some(transactions)) = parsed {
                    self.scoring.legacy_weights = Some(LegacyWeights {
                        stability,
                        liquidity,
                        momentum,
                        transactions,
                    });
                }
            }
        }

        overlay(store, "lifecycle.min_liquidity_usd", &mut self.lifecycle.min_liquidity_usd);
        overlay(
            store,
            "lifecycle.monitoring_timeout_secs",
            &mut self.lifecycle.monitoring_timeout_secs,
        );
        overlay(store, "lifecycle.score_floor", &mut self.lifecycle.score_floor);
        overlay(
            store,
            "lifecycle.low_score_grace_secs",
            &mut self.lifecycle.low_score_grace_secs,
        );

        overlay(store, "spam.medium_threshold_pct", &mut self.spam.medium_threshold_pct);
        overlay(store, "spam.high_threshold_pct", &mut self.spam.high_threshold_pct);
        overlay(store, "spam.cadence_secs", &mut self.spam.cadence_secs);

        overlay(store, "scheduler.hot_interval_secs", &mut self.scheduler.hot_interval_secs);
        overlay(store, "scheduler.cold_interval_secs", &mut self.scheduler.cold_interval_secs);

        overlay(store, "extractor.freshness_horizon_secs", &mut self.extractor.freshness_horizon_secs);

        self.validate()
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Scoring:
    model: {}
    alpha: {}
    hybrid_weights: {:?}
    legacy_weights: {:?}
    spam_penalty_threshold: {}%
  Lifecycle:
    min_liquidity: ${}
    monitoring_timeout: {}s
    score_floor: {}
    low_score_grace: {}s
  Scheduler:
    hot_interval: {}s
    cold_interval: {}s
    parallelism: {} (floor {}, ceiling {})
    batch_size: {}
    water_marks: {} / {}
  Breaker:
    failure_threshold: {}
    cooldown: {}s
  Memory:
    soft_limit: {} MB
    hard_limit: {} MB
  Sources:
    dexscreener: {}
    helius: {}
    helius_api_key: {}
"#,
            self.scoring.model,
            self.scoring.alpha,
            self.scoring.hybrid_weights,
            self.scoring.legacy_weights,
            self.scoring.spam_penalty_threshold_pct,
            self.lifecycle.min_liquidity_usd,
            self.lifecycle.monitoring_timeout_secs,
            self.lifecycle.score_floor,
            self.lifecycle.low_score_grace_secs,
            self.scheduler.hot_interval_secs,
            self.scheduler.cold_interval_secs,
            self.scheduler.initial_parallelism,
            self.scheduler.parallelism_floor,
            self.scheduler.parallelism_ceiling,
            self.scheduler.batch_size,
            self.scheduler.low_water,
            self.scheduler.high_water,
            self.breaker.failure_threshold,
            self.breaker.cooldown_secs,
            self.memory.soft_limit_mb,
            self.memory.hard_limit_mb,
            mask_url(&self.sources.dexscreener_url),
            mask_url(&self.sources.helius_url),
            if self.sources.helius_api_key.is_empty() {
                "(not set)"
            } else {
                "***"
            },
        )
    }
}

fn parse_setting<T>(store: &dyn SettingsStore, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = store.get(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key = key, value = %raw, error = %e, "Ignoring unparseable setting");
            None
        }
    }
}

fn overlay<T>(store: &dyn SettingsStore, key: &str, target: &mut T)
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(value) = parse_setting(store, key) {
        *target = value;
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}
