//! Per-token scoring pipeline
//!
//! One cycle is split in two phases. [`Pipeline::prepare`] does the awaiting
//! (metrics fetch, spam refresh) and every in-memory computation without
//! touching shared scoring state. [`Pipeline::commit`] persists the snapshot
//! and status change together and only then applies the smoothing update, so
//! a cycle cancelled before commit leaves no trace.

use backoff::{future::retry, ExponentialBackoff};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::MetricsCache;
use crate::config::{Config, RetryConfig};
use crate::error::{Error, Result};
use crate::guard::{CircuitBreaker, LatencyWindow};
use crate::lifecycle::{self, LifecycleInput, LifecycleMachine, Transition};
use crate::scheduler::state::{CycleTicket, ErrorCounters};
use crate::scoring::{ComponentExtractor, Scorer, SmoothingEngine, SmoothingUpdate, SpamTracker};
use crate::sources::{AlertKind, MetricsSource, NotificationSink, Persistence, TransactionSource};
use crate::types::{MetricsSnapshot, ScoreSnapshot, SpamMetrics, Token};

/// Metrics obtained for one cycle
#[derive(Debug, Clone)]
pub struct ObtainedMetrics {
    pub snapshot: MetricsSnapshot,
    /// False when served from the stale cache
    pub fresh: bool,
}

/// A computed cycle waiting to be committed
#[derive(Debug, Clone)]
pub struct PreparedCycle {
    pub snapshot: ScoreSnapshot,
    pub update: SmoothingUpdate,
    pub transition: Transition,
    /// The token as it stands after this cycle
    pub token: Token,
    /// Set when the status changed
    pub changed: Option<Token>,
}

/// Result of a committed cycle
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub snapshot: ScoreSnapshot,
    pub token: Token,
    pub transition: Transition,
}

pub struct Pipeline {
    metrics: Arc<dyn MetricsSource>,
    transactions: Option<Arc<dyn TransactionSource>>,
    persistence: Arc<dyn Persistence>,
    notifier: Arc<dyn NotificationSink>,
    breaker: CircuitBreaker,
    cache: MetricsCache,
    latency: Mutex<LatencyWindow>,
    extractor: ComponentExtractor,
    smoothing: SmoothingEngine,
    scorer: Scorer,
    spam: SpamTracker,
    lifecycle: LifecycleMachine,
    retry: RetryConfig,
    counters: Arc<ErrorCounters>,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        metrics: Arc<dyn MetricsSource>,
        transactions: Option<Arc<dyn TransactionSource>>,
        persistence: Arc<dyn Persistence>,
        notifier: Arc<dyn NotificationSink>,
        counters: Arc<ErrorCounters>,
    ) -> Result<Self> {
        let breaker_name = metrics.name().to_string();
        Ok(Self {
            breaker: CircuitBreaker::new(&breaker_name, config.breaker.clone()),
            cache: MetricsCache::new(config.cache.clone()),
            latency: Mutex::new(LatencyWindow::new(Duration::from_secs(
                config.scheduler.latency_window_secs,
            ))),
            extractor: ComponentExtractor::new(config.extractor.clone()),
            smoothing: SmoothingEngine::new(config.scoring.alpha)?,
            scorer: Scorer::from_config(&config.scoring)?,
            spam: SpamTracker::new(config.spam.clone()),
            lifecycle: LifecycleMachine::new(config.lifecycle.clone()),
            retry: config.retry.clone(),
            metrics,
            transactions,
            persistence,
            notifier,
            counters,
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn cache(&self) -> &MetricsCache {
        &self.cache
    }

    pub fn smoothing(&self) -> &SmoothingEngine {
        &self.smoothing
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    pub fn lifecycle(&self) -> &LifecycleMachine {
        &self.lifecycle
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn notifier(&self) -> &Arc<dyn NotificationSink> {
        &self.notifier
    }

    pub fn counters(&self) -> &Arc<ErrorCounters> {
        &self.counters
    }

    fn latency_window(&self) -> MutexGuard<'_, LatencyWindow> {
        match self.latency.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Rolling p95 of upstream latency in milliseconds
    pub fn latency_p95_ms(&self) -> Option<f64> {
        self.latency_window().p95()
    }

    /// Run both phases back to back
    pub async fn run_cycle(&self, ticket: &CycleTicket, timeout: Duration) -> Result<CycleOutcome> {
        let prepared = self.prepare(ticket, timeout).await?;
        self.commit(prepared).await
    }

    /// Fetch, extract, smooth, score and evaluate. Nothing shared is mutated
    /// except caches and breaker bookkeeping.
    pub async fn prepare(&self, ticket: &CycleTicket, timeout: Duration) -> Result<PreparedCycle> {
        let mint = ticket.token.mint.as_str();

        let (obtained, spam) = tokio::join!(self.obtain_metrics(mint, timeout), self.spam_metrics(mint));
        let obtained = obtained?;

        let now = Utc::now();
        let raw = self.extractor.extract(&obtained.snapshot, now);
        let legacy = self.extractor.legacy_factors(&obtained.snapshot);
        let update = self.smoothing.preview(mint, &raw, |smoothed| {
            self.scorer.score(smoothed, &legacy, spam.as_ref())
        });

        let timestamp = next_timestamp(now, ticket.not_before);
        let transition = self.lifecycle.evaluate(&LifecycleInput {
            token: &ticket.token,
            metrics: &obtained.snapshot,
            smoothed_score: update.smoothed_score,
            data_fresh: obtained.fresh,
            now: timestamp,
        });
        if transition == Transition::Defer {
            ErrorCounters::incr(&self.counters.deferred_transitions);
            debug!(mint = %mint, "Transition deferred until fresh data");
        }
        let changed = lifecycle::apply(&ticket.token, transition, timestamp)?;

        let snapshot = ScoreSnapshot {
            mint: mint.to_string(),
            cycle: ticket.cycle,
            raw_score: update.raw_score,
            smoothed_score: update.smoothed_score,
            raw_components: raw,
            smoothed_components: update.smoothed_components,
            spam,
            model: self.scorer.kind(),
            data_stale: !obtained.fresh,
            timestamp,
        };

        Ok(PreparedCycle {
            token: changed.clone().unwrap_or_else(|| ticket.token.clone()),
            snapshot,
            update,
            transition,
            changed,
        })
    }

    /// Persist the cycle, then apply in-memory state. On persistence failure
    /// nothing is applied.
    pub async fn commit(&self, prepared: PreparedCycle) -> Result<CycleOutcome> {
        let PreparedCycle {
            snapshot,
            update,
            transition,
            token,
            changed,
        } = prepared;

        if let Err(e) = self
            .persistence
            .commit_cycle(&snapshot, changed.as_ref())
            .await
        {
            ErrorCounters::incr(&self.counters.persist_failures);
            return Err(e);
        }

        self.smoothing.commit(&update);
        self.lifecycle
            .record_score(&token, snapshot.smoothed_score, snapshot.timestamp);
        ErrorCounters::incr(&self.counters.completed_cycles);

        match transition {
            Transition::Promote => {
                info!(mint = %snapshot.mint, score = snapshot.smoothed_score, "Token promoted");
                self.notifier.notify(
                    AlertKind::TokenPromoted,
                    json!({ "mint": snapshot.mint, "score": snapshot.smoothed_score }),
                );
            }
            Transition::Archive(reason) => {
                info!(mint = %snapshot.mint, reason = %reason, "Token archived");
                self.evict(&snapshot.mint);
                self.notifier.notify(
                    AlertKind::TokenArchived,
                    json!({ "mint": snapshot.mint, "reason": reason.to_string() }),
                );
            }
            Transition::Stay | Transition::Defer => {}
        }

        debug!(
            mint = %snapshot.mint,
            cycle = snapshot.cycle,
            raw = snapshot.raw_score,
            smoothed = snapshot.smoothed_score,
            stale = snapshot.data_stale,
            "Cycle committed"
        );

        Ok(CycleOutcome {
            snapshot,
            token,
            transition,
        })
    }

    /// Drop every piece of per-token state
    pub fn evict(&self, mint: &str) {
        self.smoothing.evict(mint);
        self.spam.evict(mint);
        self.lifecycle.evict(mint);
        self.cache.remove(mint);
    }

    async fn spam_metrics(&self, mint: &str) -> Option<SpamMetrics> {
        let Some(source) = self.transactions.as_deref() else {
            return None;
        };
        if !self.spam.is_due(mint) {
            return self.spam.current(mint);
        }
        let refresh = self.spam.refresh(mint, source).await;
        if refresh.is_failure() {
            ErrorCounters::incr(&self.counters.spam_failures);
        }
        refresh.metrics().cloned()
    }

    /// Cached within TTL, else fetched with retries, else stale cache
    pub async fn obtain_metrics(&self, mint: &str, timeout: Duration) -> Result<ObtainedMetrics> {
        if let Some(snapshot) = self.cache.get_fresh(mint) {
            return Ok(ObtainedMetrics {
                snapshot,
                fresh: true,
            });
        }

        match self.fetch_with_retry(mint, timeout).await {
            Ok(snapshot) => {
                self.cache.insert(mint, snapshot.clone());
                Ok(ObtainedMetrics {
                    snapshot,
                    fresh: true,
                })
            }
            // Upstream answered but has nothing: neutral components
            Err(Error::NoData(_)) => Ok(ObtainedMetrics {
                snapshot: MetricsSnapshot::empty(mint),
                fresh: true,
            }),
            Err(e) => match self.cache.get_stale(mint) {
                Some((snapshot, age)) => {
                    ErrorCounters::incr(&self.counters.stale_served);
                    debug!(
                        mint = %mint,
                        age_secs = age.as_secs(),
                        error = %e,
                        "Serving stale metrics"
                    );
                    Ok(ObtainedMetrics {
                        snapshot,
                        fresh: false,
                    })
                }
                None => {
                    ErrorCounters::incr(&self.counters.skipped_cycles);
                    Err(Error::CycleSkipped {
                        mint: mint.to_string(),
                        reason: e.to_string(),
                    })
                }
            },
        }
    }

    async fn fetch_with_retry(&self, mint: &str, timeout: Duration) -> Result<MetricsSnapshot> {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(self.retry.initial_backoff_ms),
            max_interval: Duration::from_millis(self.retry.max_backoff_ms),
            max_elapsed_time: None,
            ..Default::default()
        };
        let max_attempts = self.retry.max_attempts.max(1);
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;

        retry(backoff, move || async move {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            match self.fetch_once(mint, timeout, attempt).await {
                Ok(snapshot) => Ok(snapshot),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    debug!(mint = %mint, attempt, error = %e, "Retryable fetch error");
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }

    /// A single attempt gated by the breaker
    async fn fetch_once(&self, mint: &str, timeout: Duration, attempt: u32) -> Result<MetricsSnapshot> {
        if let Err(remaining) = self.breaker.can_execute().await {
            return Err(Error::CircuitOpen {
                retry_in_ms: remaining.as_millis() as u64,
            });
        }
        if attempt > 1 {
            ErrorCounters::incr(&self.counters.retries);
        }

        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, self.metrics.fetch(mint)).await {
            Ok(result) => result,
            Err(_) => Err(Error::UpstreamTimeout(timeout.as_millis() as u64)),
        };
        self.latency_window().record(started.elapsed());

        match &result {
            Err(e) if e.is_upstream_failure() => {
                ErrorCounters::incr(&self.counters.fetch_failures);
                if self.breaker.record_failure(&e.to_string()).await {
                    let status = self.breaker.status().await;
                    self.notifier.notify(
                        AlertKind::CircuitOpened,
                        json!({
                            "breaker": status.name,
                            "failures": status.consecutive_failures,
                            "error": status.last_error,
                        }),
                    );
                }
            }
            _ => {
                if self.breaker.record_success().await {
                    self.notifier
                        .notify(AlertKind::CircuitClosed, json!({ "breaker": self.metrics.name() }));
                }
            }
        }
        if let Err(e) = &result {
            if !e.is_upstream_failure() && !matches!(e, Error::NoData(_)) {
                warn!(mint = %mint, error = %e, "Metrics fetch failed");
            }
        }
        result
    }
}

/// Snapshot timestamps strictly increase per token
fn next_timestamp(now: DateTime<Utc>, not_before: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match not_before {
        Some(previous) if now <= previous => previous + chrono::Duration::milliseconds(1),
        _ => now,
    }
}
