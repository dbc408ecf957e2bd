//! Scoring models
//!
//! Two closed model variants share one output contract: a score in [0, 1].
//! The variant is chosen once at startup and every snapshot records which one
//! produced it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::scoring::components::LegacyFactors;
use crate::types::ComponentSet;

/// Which model produced a score
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    #[default]
    Hybrid,
    Legacy,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Hybrid => write!(f, "hybrid"),
            ModelKind::Legacy => write!(f, "legacy"),
        }
    }
}

impl FromStr for ModelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hybrid" => Ok(ModelKind::Hybrid),
            "legacy" => Ok(ModelKind::Legacy),
            other => Err(Error::Config(format!("unknown scoring model '{}'", other))),
        }
    }
}

fn default_weight() -> f64 {
    0.25
}

/// Weights for the four-component hybrid formula
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HybridWeights {
    #[serde(default = "default_weight")]
    pub tx_accel: f64,
    #[serde(default = "default_weight")]
    pub vol_momentum: f64,
    #[serde(default = "default_weight")]
    pub freshness: f64,
    #[serde(default = "default_weight")]
    pub orderflow: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            tx_accel: default_weight(),
            vol_momentum: default_weight(),
            freshness: default_weight(),
            orderflow: default_weight(),
        }
    }
}

impl HybridWeights {
    pub fn sum(&self) -> f64 {
        self.tx_accel + self.vol_momentum + self.freshness + self.orderflow
    }
}

/// Weights for the older stability/liquidity/momentum/transactions formula.
/// Every field is required.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LegacyWeights {
    pub stability: f64,
    pub liquidity: f64,
    pub momentum: f64,
    pub transactions: f64,
}

impl LegacyWeights {
    pub fn sum(&self) -> f64 {
        self.stability + self.liquidity + self.momentum + self.transactions
    }
}

/// Active scoring model with its own weight set
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoringModel {
    Hybrid(HybridWeights),
    Legacy(LegacyWeights),
}

impl ScoringModel {
    /// Build the model selected by `kind`. Missing weights for that model are
    /// an initialization error.
    pub fn select(
        kind: ModelKind,
        hybrid: Option<HybridWeights>,
        legacy: Option<LegacyWeights>,
    ) -> Result<Self> {
        match kind {
            ModelKind::Hybrid => hybrid
                .map(ScoringModel::Hybrid)
                .ok_or_else(|| Error::MissingWeights(kind.to_string())),
            ModelKind::Legacy => legacy
                .map(ScoringModel::Legacy)
                .ok_or_else(|| Error::MissingWeights(kind.to_string())),
        }
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            ScoringModel::Hybrid(_) => ModelKind::Hybrid,
            ScoringModel::Legacy(_) => ModelKind::Legacy,
        }
    }

    /// Score one cycle. `penalty` is only applied by the hybrid model.
    pub fn score(&self, components: &ComponentSet, legacy: &LegacyFactors, penalty: f64) -> f64 {
        match self {
            ScoringModel::Hybrid(w) => {
                let weighted = w.tx_accel * components.tx_accel
                    + w.vol_momentum * components.vol_momentum
                    + w.freshness * components.token_freshness
                    + w.orderflow * components.orderflow_imbalance;
                clamp01(weighted) * (1.0 - clamp01(penalty))
            }
            ScoringModel::Legacy(w) => clamp01(
                w.stability * legacy.stability
                    + w.liquidity * legacy.liquidity
                    + w.momentum * legacy.momentum
                    + w.transactions * legacy.transactions,
            ),
        }
    }
}

/// Penalty in [0, 1] for a spam ratio (percent). Zero at or below
/// `threshold_pct`, rising linearly to 1 at 100%.
pub fn spam_penalty(ratio_pct: f64, threshold_pct: f64) -> f64 {
    if ratio_pct.is_nan() || ratio_pct <= threshold_pct {
        return 0.0;
    }
    let span = (100.0 - threshold_pct).max(f64::EPSILON);
    clamp01((ratio_pct - threshold_pct) / span)
}

pub(crate) fn clamp01(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hybrid() -> ScoringModel {
        ScoringModel::Hybrid(HybridWeights::default())
    }

    #[test]
    fn test_hybrid_reference_score() {
        let c = ComponentSet::new(0.8, 0.6, 0.9, 0.2);
        let score = hybrid().score(&c, &LegacyFactors::default(), 0.0);
        assert!((score - 0.625).abs() < 1e-12);
    }

    #[test]
    fn test_high_spam_scales_score_down() {
        let c = ComponentSet::new(0.8, 0.6, 0.9, 0.2);
        let penalty = spam_penalty(85.0, 0.0);
        assert!((penalty - 0.85).abs() < 1e-12);
        let score = hybrid().score(&c, &LegacyFactors::default(), penalty);
        assert!((score - 0.09375).abs() < 1e-9);
    }

    #[test]
    fn test_penalty_threshold() {
        assert_eq!(spam_penalty(20.0, 30.0), 0.0);
        assert!((spam_penalty(65.0, 30.0) - 0.5).abs() < 1e-12);
        assert_eq!(spam_penalty(100.0, 30.0), 1.0);
        assert_eq!(spam_penalty(f64::NAN, 0.0), 0.0);
    }

    #[test]
    fn test_penalty_is_monotonic() {
        let mut last = 0.0;
        for ratio in 0..=100 {
            let p = spam_penalty(ratio as f64, 10.0);
            assert!(p >= last);
            last = p;
        }
    }

    #[test]
    fn test_negative_orderflow_clamps_to_zero() {
        let c = ComponentSet::new(0.0, 0.0, 0.0, -1.0);
        assert_eq!(hybrid().score(&c, &LegacyFactors::default(), 0.0), 0.0);
    }

    #[test]
    fn test_legacy_ignores_components_and_penalty() {
        let model = ScoringModel::Legacy(LegacyWeights {
            stability: 0.5,
            liquidity: 0.5,
            momentum: 0.0,
            transactions: 0.0,
        });
        let factors = LegacyFactors {
            stability: 0.4,
            liquidity: 1.0,
            momentum: 0.9,
            transactions: 0.9,
        };
        let c = ComponentSet::new(1.0, 1.0, 1.0, 1.0);
        let score = model.score(&c, &factors, 0.9);
        assert!((score - 0.7).abs() < 1e-12);
        assert_eq!(model.kind(), ModelKind::Legacy);
    }

    #[test]
    fn test_missing_weights_for_active_model() {
        let err = ScoringModel::select(ModelKind::Legacy, Some(HybridWeights::default()), None);
        assert!(matches!(err, Err(Error::MissingWeights(_))));
        assert!(ScoringModel::select(ModelKind::Hybrid, None, None).is_err());
    }

    #[test]
    fn test_model_kind_parse() {
        assert_eq!("Legacy".parse::<ModelKind>().unwrap(), ModelKind::Legacy);
        assert!("neural".parse::<ModelKind>().is_err());
    }
}
