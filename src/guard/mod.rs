//! Overload protection: upstream circuit breaker, process resource guard and
//! upstream latency tracking

pub mod circuit_breaker;
pub mod latency;
pub mod memory;

pub use circuit_breaker::{BreakerConfig, BreakerStatus, CircuitBreaker, CircuitState};
pub use latency::LatencyWindow;
pub use memory::{
    MemoryCheck, MemoryConfig, MemoryGuard, MemoryPressure, MemoryStats, ResourceProbe,
    ResourceSample, SysinfoProbe,
};
