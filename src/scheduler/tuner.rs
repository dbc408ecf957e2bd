//! Adaptive tuning rules
//!
//! Every rule moves one parameter by a bounded step per tick and has a
//! matching rule that moves it back, so no parameter grows without bound.

use serde::Serialize;
use std::time::Duration;

use crate::scheduler::SchedulerConfig;

/// Parameters the scheduler tunes at runtime
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TuningParams {
    pub max_parallelism: usize,
    pub batch_size: usize,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    #[serde(with = "duration_ms")]
    pub cache_ttl: Duration,
}

/// Load observed during one tuning tick
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadSignals {
    /// Due-but-not-dispatched tokens across tiers
    pub queue_depth: usize,
    /// Rolling p95 of upstream latency, if any samples
    pub p95_ms: Option<f64>,
    pub cpu_pct: f32,
}

/// Consecutive-tick counters carried between ticks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TuningStreaks {
    pub cpu_high_ticks: u32,
}

/// Bounds for every tuned parameter
#[derive(Debug, Clone)]
pub struct TuningLimits {
    pub parallelism_floor: usize,
    pub parallelism_ceiling: usize,
    pub parallelism_step: usize,
    pub high_water: usize,
    pub low_water: usize,
    pub base_batch_size: usize,
    pub min_batch_size: usize,
    pub base_timeout: Duration,
    pub max_timeout: Duration,
    pub timeout_growth: f64,
    pub base_cache_ttl: Duration,
    pub max_cache_ttl: Duration,
    pub latency_threshold_ms: f64,
    pub cpu_threshold_pct: f32,
    pub cpu_sustained_ticks: u32,
}

impl TuningLimits {
    pub fn new(config: &SchedulerConfig, base_cache_ttl: Duration, max_cache_ttl: Duration) -> Self {
        Self {
            parallelism_floor: config.parallelism_floor,
            parallelism_ceiling: config.parallelism_ceiling,
            parallelism_step: config.parallelism_step.max(1),
            high_water: config.high_water,
            low_water: config.low_water,
            base_batch_size: config.batch_size,
            min_batch_size: config.min_batch_size,
            base_timeout: Duration::from_millis(config.base_timeout_ms),
            max_timeout: Duration::from_millis(config.max_timeout_ms),
            timeout_growth: config.timeout_growth.max(1.0),
            base_cache_ttl,
            max_cache_ttl: max_cache_ttl.max(base_cache_ttl),
            latency_threshold_ms: config.latency_p95_threshold_ms,
            cpu_threshold_pct: config.cpu_threshold_pct,
            cpu_sustained_ticks: config.cpu_sustained_ticks.max(1),
        }
    }

    /// Starting point for a fresh scheduler
    pub fn initial(&self, initial_parallelism: usize) -> TuningParams {
        TuningParams {
            max_parallelism: initial_parallelism
                .clamp(self.parallelism_floor, self.parallelism_ceiling),
            batch_size: self.base_batch_size,
            timeout: self.base_timeout,
            cache_ttl: self.base_cache_ttl,
        }
    }
}

/// One tuning step
pub fn tune(
    current: &TuningParams,
    signals: &LoadSignals,
    limits: &TuningLimits,
    streaks: &mut TuningStreaks,
) -> TuningParams {
    let mut next = *current;

    // Backlog -> parallelism
    if signals.queue_depth > limits.high_water {
        next.max_parallelism = current
            .max_parallelism
            .saturating_add(limits.parallelism_step)
            .min(limits.parallelism_ceiling);
    } else if signals.queue_depth < limits.low_water {
        next.max_parallelism = current
            .max_parallelism
            .saturating_sub(limits.parallelism_step)
            .max(limits.parallelism_floor);
    }

    // Upstream latency -> timeout and cache TTL
    match signals.p95_ms {
        Some(p95) if p95 > limits.latency_threshold_ms => {
            next.timeout = current
                .timeout
                .mul_f64(limits.timeout_growth)
                .min(limits.max_timeout);
            next.cache_ttl = (current.cache_ttl * 2).min(limits.max_cache_ttl);
        }
        Some(p95) if p95 >= limits.latency_threshold_ms / 2.0 => {}
        _ => {
            next.timeout = current
                .timeout
                .div_f64(limits.timeout_growth)
                .max(limits.base_timeout);
            next.cache_ttl = (current.cache_ttl / 2).max(limits.base_cache_ttl);
        }
    }

    // Sustained CPU -> batch size
    if signals.cpu_pct > limits.cpu_threshold_pct {
        streaks.cpu_high_ticks = streaks.cpu_high_ticks.saturating_add(1);
        if streaks.cpu_high_ticks >= limits.cpu_sustained_ticks {
            next.batch_size = (current.batch_size / 2).max(limits.min_batch_size);
        }
    } else {
        streaks.cpu_high_ticks = 0;
        next.batch_size = current
            .batch_size
            .saturating_mul(2)
            .min(limits.base_batch_size)
            .max(limits.min_batch_size);
    }

    next
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
