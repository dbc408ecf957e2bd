//! Scoring: component extraction, smoothing, spam analysis and the models
//! that combine them into one score per cycle.

pub mod components;
pub mod model;
pub mod smoothing;
pub mod spam;

pub use components::{ComponentExtractor, ExtractorConfig, LegacyFactors};
pub use model::{spam_penalty, HybridWeights, LegacyWeights, ModelKind, ScoringModel};
pub use smoothing::{SmoothingEngine, SmoothingRecord, SmoothingUpdate};
pub use spam::{SpamConfig, SpamDetector, SpamRefresh, SpamTracker};

use crate::config::ScoringConfig;
use crate::error::Result;
use crate::types::{ComponentSet, SpamMetrics};

/// Stateless scorer wrapping the active model
#[derive(Debug, Clone)]
pub struct Scorer {
    model: ScoringModel,
    spam_penalty_threshold_pct: f64,
}

impl Scorer {
    pub fn new(model: ScoringModel, spam_penalty_threshold_pct: f64) -> Self {
        Self {
            model,
            spam_penalty_threshold_pct,
        }
    }

    /// Build from configuration; fails if the active model has no weights
    pub fn from_config(config: &ScoringConfig) -> Result<Self> {
        let model = ScoringModel::select(
            config.model,
            config.hybrid_weights,
            config.legacy_weights,
        )?;
        tracing::info!(model = %model.kind(), "Scoring model selected");
        Ok(Self::new(model, config.spam_penalty_threshold_pct))
    }

    pub fn kind(&self) -> ModelKind {
        self.model.kind()
    }

    pub fn model(&self) -> &ScoringModel {
        &self.model
    }

    /// Score one cycle from smoothed components, legacy factors and the
    /// latest spam result (if any)
    pub fn score(
        &self,
        components: &ComponentSet,
        legacy: &LegacyFactors,
        spam: Option<&SpamMetrics>,
    ) -> f64 {
        let penalty = spam
            .map(|s| spam_penalty(s.ratio_pct, self.spam_penalty_threshold_pct))
            .unwrap_or(0.0);
        self.model.score(components, legacy, penalty)
    }
}
