//! Per-token exponential smoothing
//!
//! One fixed-size record per mint holds the smoothed components and the
//! smoothed aggregate score. Updates are computed with [`SmoothingEngine::preview`]
//! and only applied by [`SmoothingEngine::commit`], so a cycle that fails to
//! persist leaves the state untouched.
//!
//! The update uses the same alpha regardless of how long ago the last update
//! happened. Skipped cycles do not decay the average. This is a known
//! approximation, not time-correct decay.

use dashmap::DashMap;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::types::ComponentSet;

/// Smoothing state of one token
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SmoothingRecord {
    pub components: ComponentSet,
    pub score: f64,
    pub observations: u64,
}

/// A computed but not yet applied update
#[derive(Debug, Clone, PartialEq)]
pub struct SmoothingUpdate {
    pub mint: String,
    pub smoothed_components: ComponentSet,
    pub raw_score: f64,
    pub smoothed_score: f64,
    /// Observation count this update was computed against
    pub base_observations: u64,
}

pub struct SmoothingEngine {
    alpha: f64,
    records: DashMap<String, SmoothingRecord>,
}

impl SmoothingEngine {
    pub fn new(alpha: f64) -> Result<Self> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(Error::Config(format!("alpha must be in (0, 1], got {}", alpha)));
        }
        Ok(Self {
            alpha,
            records: DashMap::new(),
        })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Smooth `raw` against the stored state, score the smoothed components
    /// with `score_fn`, and smooth that score. Nothing is stored.
    pub fn preview<F>(&self, mint: &str, raw: &ComponentSet, score_fn: F) -> SmoothingUpdate
    where
        F: FnOnce(&ComponentSet) -> f64,
    {
        let previous = self.get(mint);

        let smoothed_components = match previous {
            Some(prev) => ComponentSet::new(
                ewma(self.alpha, raw.tx_accel, prev.components.tx_accel),
                ewma(self.alpha, raw.vol_momentum, prev.components.vol_momentum),
                ewma(self.alpha, raw.token_freshness, prev.components.token_freshness),
                ewma(
                    self.alpha,
                    raw.orderflow_imbalance,
                    prev.components.orderflow_imbalance,
                ),
            ),
            // First observation: no bootstrap bias
            None => *raw,
        };

        let raw_score = score_fn(&smoothed_components);
        let smoothed_score = match previous {
            Some(prev) => ewma(self.alpha, raw_score, prev.score),
            None => raw_score,
        };

        SmoothingUpdate {
            mint: mint.to_string(),
            smoothed_components,
            raw_score,
            smoothed_score,
            base_observations: previous.map(|p| p.observations).unwrap_or(0),
        }
    }

    /// Apply a previewed update
    pub fn commit(&self, update: &SmoothingUpdate) {
        let mut entry = self
            .records
            .entry(update.mint.clone())
            .or_insert(SmoothingRecord {
                components: update.smoothed_components,
                score: update.smoothed_score,
                observations: 0,
            });
        if entry.observations != update.base_observations {
            tracing::warn!(
                mint = %update.mint,
                expected = update.base_observations,
                actual = entry.observations,
                "Smoothing state moved since preview"
            );
        }
        entry.components = update.smoothed_components;
        entry.score = update.smoothed_score;
        entry.observations += 1;
    }

    /// Restore state from a persisted snapshot. Existing state wins.
    pub fn seed(&self, mint: &str, components: ComponentSet, score: f64) -> bool {
        let mut inserted = false;
        self.records.entry(mint.to_string()).or_insert_with(|| {
            inserted = true;
            SmoothingRecord {
                components: components.clamped(),
                score,
                observations: 1,
            }
        });
        inserted
    }

    pub fn get(&self, mint: &str) -> Option<SmoothingRecord> {
        self.records.get(mint).map(|r| *r)
    }

    /// Smoothed aggregate score, if the token has been scored
    pub fn score(&self, mint: &str) -> Option<f64> {
        self.records.get(mint).map(|r| r.score)
    }

    /// Drop a token's state (archived tokens are never scored again)
    pub fn evict(&self, mint: &str) -> bool {
        self.records.remove(mint).is_some()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[inline]
fn ewma(alpha: f64, raw: f64, old: f64) -> f64 {
    alpha * raw + (1.0 - alpha) * old
}
