//! Circuit breaker for the external metrics source
//!
//! Closed -> Open after `failure_threshold` consecutive failures.
//! Open -> HalfOpen once `cooldown_secs` have elapsed and a caller asks.
//! HalfOpen -> Closed after `success_threshold` probe successes, or back to
//! Open on any probe failure.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Probe successes needed to close from half-open
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Concurrent probes admitted while half-open
    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_secs() -> u64 {
    30
}
fn default_success_threshold() -> u32 {
    1
}
fn default_half_open_max_probes() -> u32 {
    1
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            success_threshold: default_success_threshold(),
            half_open_max_probes: default_half_open_max_probes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time breaker report
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_opens: u64,
    pub last_error: Option<String>,
    /// Remaining cooldown while open
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    probes_in_flight: u32,
    opened_at: Option<Instant>,
    total_opens: u64,
    last_error: Option<String>,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: RwLock<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                probes_in_flight: 0,
                opened_at: None,
                total_opens: 0,
                last_error: None,
            }),
        }
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(self.config.cooldown_secs)
    }

    /// Check if the breaker admits a call.
    ///
    /// Returns `Err(remaining)` while blocked.
    pub async fn can_execute(&self) -> Result<(), Duration> {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_max_probes {
                    inner.probes_in_flight += 1;
                    Ok(())
                } else {
                    Err(Duration::from_millis(100))
                }
            }
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or_else(|| self.cooldown());
                if elapsed >= self.cooldown() {
                    inner.state = CircuitState::HalfOpen;
                    inner.successes = 0;
                    inner.probes_in_flight = 1;
                    info!(breaker = %self.name, "Circuit half-open, probing upstream");
                    Ok(())
                } else {
                    Err(self.cooldown() - elapsed)
                }
            }
        }
    }

    /// Record a successful call. Returns true if this closed the circuit.
    pub async fn record_success(&self) -> bool {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
                false
            }
            CircuitState::HalfOpen => {
                inner.successes += 1;
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                if inner.successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.probes_in_flight = 0;
                    inner.opened_at = None;
                    inner.last_error = None;
                    info!(breaker = %self.name, "Circuit closed, upstream recovered");
                    true
                } else {
                    false
                }
            }
            // Late result of a call admitted before the circuit opened
            CircuitState::Open => false,
        }
    }

    /// Record a failed call. Returns true if this opened the circuit.
    pub async fn record_failure(&self, error: &str) -> bool {
        let mut inner = self.inner.write().await;
        inner.last_error = Some(error.to_string());
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.total_opens += 1;
                    warn!(
                        breaker = %self.name,
                        failures = inner.failures,
                        error = %error,
                        "Circuit opened"
                    );
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.successes = 0;
                inner.probes_in_flight = 0;
                inner.total_opens += 1;
                warn!(breaker = %self.name, error = %error, "Probe failed, circuit re-opened");
                false
            }
            CircuitState::Open => false,
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub async fn status(&self) -> BreakerStatus {
        let inner = self.inner.read().await;
        let retry_in_ms = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) => {
                Some(self.cooldown().saturating_sub(at.elapsed()).as_millis() as u64)
            }
            _ => None,
        };
        BreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.failures,
            total_opens: inner.total_opens,
            last_error: inner.last_error.clone(),
            retry_in_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: threshold,
                cooldown_secs,
                ..Default::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_exactly_n_failures() {
        let cb = breaker(3, 30);
        assert!(!cb.record_failure("e1").await);
        assert!(!cb.record_failure("e2").await);
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.can_execute().await.is_ok());
        assert!(cb.record_failure("e3").await);
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(cb.can_execute().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let cb = breaker(3, 30);
        cb.record_failure("e").await;
        cb.record_failure("e").await;
        cb.record_success().await;
        cb.record_failure("e").await;
        cb.record_failure("e").await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_only_after_cooldown() {
        let cb = breaker(2, 30);
        cb.record_failure("e").await;
        cb.record_failure("e").await;

        tokio::time::advance(Duration::from_secs(29)).await;
        let remaining = cb.can_execute().await.unwrap_err();
        assert_eq!(remaining, Duration::from_secs(1));
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.can_execute().await.is_ok());
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        // Only one probe admitted
        assert!(cb.can_execute().await.is_err());

        assert!(cb.record_success().await);
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let cb = breaker(1, 10);
        cb.record_failure("e").await;
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.can_execute().await.is_ok());
        cb.record_failure("still down").await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(cb.can_execute().await.is_err());

        let status = cb.status().await;
        assert_eq!(status.total_opens, 2);
        assert_eq!(status.last_error.as_deref(), Some("still down"));
        assert_eq!(status.retry_in_ms, Some(10_000));
    }
}
