//! Process resource guard
//!
//! Samples resident memory and CPU through a [`ResourceProbe`] and classifies
//! memory pressure against soft and hard limits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, System};

/// Memory thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    /// Above this, cache entries are evicted proactively
    #[serde(default = "default_soft_limit_mb")]
    pub soft_limit_mb: u64,
    /// Above this, cold-tier intake pauses
    #[serde(default = "default_hard_limit_mb")]
    pub hard_limit_mb: u64,
    /// Fraction of the metrics cache evicted per soft-pressure tick
    #[serde(default = "default_evict_fraction")]
    pub evict_fraction: f64,
}

fn default_soft_limit_mb() -> u64 {
    512
}
fn default_hard_limit_mb() -> u64 {
    1024
}
fn default_evict_fraction() -> f64 {
    0.25
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            soft_limit_mb: default_soft_limit_mb(),
            hard_limit_mb: default_hard_limit_mb(),
            evict_fraction: default_evict_fraction(),
        }
    }
}

/// One resource reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSample {
    pub memory_bytes: u64,
    pub cpu_pct: f32,
}

impl ResourceSample {
    pub fn memory_mb(&self) -> u64 {
        self.memory_bytes / (1024 * 1024)
    }
}

/// Source of resource readings
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Reads the current process through `sysinfo`
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            tracing::warn!("Could not resolve current pid, resource sampling disabled");
        }
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&self) -> ResourceSample {
        let Some(pid) = self.pid else {
            return ResourceSample::default();
        };
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_process(pid);
        system
            .process(pid)
            .map(|p| ResourceSample {
                memory_bytes: p.memory(),
                cpu_pct: p.cpu_usage(),
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    Normal,
    Soft,
    Hard,
}

impl fmt::Display for MemoryPressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryPressure::Normal => write!(f, "normal"),
            MemoryPressure::Soft => write!(f, "soft"),
            MemoryPressure::Hard => write!(f, "hard"),
        }
    }
}

/// Result of one guard check
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryCheck {
    pub sample: ResourceSample,
    pub pressure: MemoryPressure,
    /// Pressure at the previous check
    pub previous: MemoryPressure,
}

impl MemoryCheck {
    pub fn changed(&self) -> bool {
        self.pressure != self.previous
    }
}

/// Memory stats surfaced in health reports
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub memory_mb: u64,
    pub cpu_pct: f32,
    pub pressure: MemoryPressure,
    pub soft_limit_mb: u64,
    pub hard_limit_mb: u64,
}

pub struct MemoryGuard {
    config: MemoryConfig,
    probe: Arc<dyn ResourceProbe>,
    last: Mutex<(ResourceSample, MemoryPressure)>,
}

impl MemoryGuard {
    pub fn new(config: MemoryConfig, probe: Arc<dyn ResourceProbe>) -> Self {
        Self {
            config,
            probe,
            last: Mutex::new((ResourceSample::default(), MemoryPressure::Normal)),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn classify(&self, sample: &ResourceSample) -> MemoryPressure {
        let mb = sample.memory_mb();
        if mb >= self.config.hard_limit_mb {
            MemoryPressure::Hard
        } else if mb >= self.config.soft_limit_mb {
            MemoryPressure::Soft
        } else {
            MemoryPressure::Normal
        }
    }

    /// Take a sample and classify it
    pub fn check(&self) -> MemoryCheck {
        let sample = self.probe.sample();
        let pressure = self.classify(&sample);
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let previous = last.1;
        *last = (sample, pressure);
        MemoryCheck {
            sample,
            pressure,
            previous,
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let (sample, pressure) = self
            .last
            .lock()
            .map(|l| *l)
            .unwrap_or((ResourceSample::default(), MemoryPressure::Normal));
        MemoryStats {
            memory_mb: sample.memory_mb(),
            cpu_pct: sample.cpu_pct,
            pressure,
            soft_limit_mb: self.config.soft_limit_mb,
            hard_limit_mb: self.config.hard_limit_mb,
        }
    }
}
