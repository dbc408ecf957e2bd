//! Adaptive scheduler
//!
//! Tokens are split into a hot and a cold tier. Each tier has its own loop
//! that queues due tokens and dispatches them onto a bounded worker set; a
//! third loop samples load and retunes parallelism, batch size, timeouts and
//! the cache TTL. Per-token exclusivity comes from the claim bookkeeping in
//! [`state::SchedulerState`]: a token is claimed before dispatch and released
//! only when its cycle is done, so it can never be dispatched twice.
//!
//! Shutdown stops dispatch immediately. In-flight pipelines get
//! `shutdown_grace_secs` to finish, then are aborted. A cycle that already
//! started committing always completes its commit.

pub mod pipeline;
pub mod state;
pub mod tuner;

pub use pipeline::{CycleOutcome, Pipeline, PreparedCycle};
pub use state::{CounterSnapshot, CycleTicket, ErrorCounters, SchedulerState, StatusCounts, TierPolicy};
pub use tuner::{tune, LoadSignals, TuningLimits, TuningParams};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::cache::CacheReport;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::guard::{
    BreakerStatus, MemoryCheck, MemoryGuard, MemoryPressure, MemoryStats, ResourceProbe,
};
use crate::scoring::ModelKind;
use crate::sources::{AlertKind, MetricsSource, NotificationSink, Persistence, TransactionSource};
use crate::types::{validate_mint, ScoreSnapshot, Tier, Token};

/// Scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_hot_interval_secs")]
    pub hot_interval_secs: u64,
    #[serde(default = "default_cold_interval_secs")]
    pub cold_interval_secs: u64,
    /// How often each tier loop looks for due tokens
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_tuning_interval_ms")]
    pub tuning_interval_ms: u64,
    /// Promoted tokens stay hot this long
    #[serde(default = "default_hot_window_secs")]
    pub hot_window_secs: u64,
    /// Active tokens at or above this smoothed score are hot
    #[serde(default = "default_hot_score_threshold")]
    pub hot_score_threshold: f64,

    #[serde(default = "default_initial_parallelism")]
    pub initial_parallelism: usize,
    #[serde(default = "default_parallelism_floor")]
    pub parallelism_floor: usize,
    #[serde(default = "default_parallelism_ceiling")]
    pub parallelism_ceiling: usize,
    #[serde(default = "default_parallelism_step")]
    pub parallelism_step: usize,
    /// Queue depth above which parallelism grows
    #[serde(default = "default_high_water")]
    pub high_water: usize,
    /// Queue depth below which parallelism shrinks
    #[serde(default = "default_low_water")]
    pub low_water: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,

    #[serde(default = "default_base_timeout_ms")]
    pub base_timeout_ms: u64,
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    #[serde(default = "default_timeout_growth")]
    pub timeout_growth: f64,
    #[serde(default = "default_latency_p95_threshold_ms")]
    pub latency_p95_threshold_ms: f64,
    #[serde(default = "default_latency_window_secs")]
    pub latency_window_secs: u64,

    #[serde(default = "default_cpu_threshold_pct")]
    pub cpu_threshold_pct: f32,
    /// Consecutive tuning ticks over the CPU threshold before batches shrink
    #[serde(default = "default_cpu_sustained_ticks")]
    pub cpu_sustained_ticks: u32,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_hot_interval_secs() -> u64 {
    30
}
fn default_cold_interval_secs() -> u64 {
    300
}
fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_tuning_interval_ms() -> u64 {
    1000
}
fn default_hot_window_secs() -> u64 {
    1800
}
fn default_hot_score_threshold() -> f64 {
    0.6
}
fn default_initial_parallelism() -> usize {
    8
}
fn default_parallelism_floor() -> usize {
    2
}
fn default_parallelism_ceiling() -> usize {
    32
}
fn default_parallelism_step() -> usize {
    1
}
fn default_high_water() -> usize {
    100
}
fn default_low_water() -> usize {
    10
}
fn default_batch_size() -> usize {
    50
}
fn default_min_batch_size() -> usize {
    5
}
fn default_base_timeout_ms() -> u64 {
    2000
}
fn default_max_timeout_ms() -> u64 {
    10_000
}
fn default_timeout_growth() -> f64 {
    1.5
}
fn default_latency_p95_threshold_ms() -> f64 {
    1500.0
}
fn default_latency_window_secs() -> u64 {
    300
}
fn default_cpu_threshold_pct() -> f32 {
    85.0
}
fn default_cpu_sustained_ticks() -> u32 {
    3
}
fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            hot_interval_secs: default_hot_interval_secs(),
            cold_interval_secs: default_cold_interval_secs(),
            tick_interval_ms: default_tick_interval_ms(),
            tuning_interval_ms: default_tuning_interval_ms(),
            hot_window_secs: default_hot_window_secs(),
            hot_score_threshold: default_hot_score_threshold(),
            initial_parallelism: default_initial_parallelism(),
            parallelism_floor: default_parallelism_floor(),
            parallelism_ceiling: default_parallelism_ceiling(),
            parallelism_step: default_parallelism_step(),
            high_water: default_high_water(),
            low_water: default_low_water(),
            batch_size: default_batch_size(),
            min_batch_size: default_min_batch_size(),
            base_timeout_ms: default_base_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            timeout_growth: default_timeout_growth(),
            latency_p95_threshold_ms: default_latency_p95_threshold_ms(),
            latency_window_secs: default_latency_window_secs(),
            cpu_threshold_pct: default_cpu_threshold_pct(),
            cpu_sustained_ticks: default_cpu_sustained_ticks(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn tier_policy(&self) -> TierPolicy {
        TierPolicy {
            hot_interval: Duration::from_secs(self.hot_interval_secs),
            cold_interval: Duration::from_secs(self.cold_interval_secs),
            hot_window: Duration::from_secs(self.hot_window_secs),
            hot_score_threshold: self.hot_score_threshold,
        }
    }
}

/// External collaborators the scheduler drives
pub struct Collaborators {
    pub metrics: Arc<dyn MetricsSource>,
    /// Spam analysis is skipped without a transaction source
    pub transactions: Option<Arc<dyn TransactionSource>>,
    pub persistence: Arc<dyn Persistence>,
    pub notifier: Arc<dyn NotificationSink>,
    pub probe: Arc<dyn ResourceProbe>,
}

/// Pull-based health report
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub model: ModelKind,
    pub queue_hot: usize,
    pub queue_cold: usize,
    pub in_flight: usize,
    pub tokens: StatusCounts,
    pub breaker: BreakerStatus,
    pub memory: MemoryStats,
    pub tuning: TuningParams,
    pub cache: CacheReport,
    pub counters: CounterSnapshot,
    pub latency_p95_ms: Option<f64>,
    pub cold_intake_paused: bool,
    pub shutting_down: bool,
}

fn lock(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Holds a token's claim. Dropping it without [`ClaimGuard::finish`] means
/// the cycle was cancelled; the claim is still released.
struct ClaimGuard {
    mint: String,
    state: Arc<Mutex<SchedulerState>>,
    counters: Arc<ErrorCounters>,
    finished: bool,
}

impl ClaimGuard {
    fn new(mint: &str, state: &Arc<Mutex<SchedulerState>>, counters: &Arc<ErrorCounters>) -> Self {
        Self {
            mint: mint.to_string(),
            state: Arc::clone(state),
            counters: Arc::clone(counters),
            finished: false,
        }
    }

    fn finish(mut self, outcome: Option<&CycleOutcome>) {
        lock(&self.state).finish(&self.mint, outcome);
        self.finished = true;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.finished {
            lock(&self.state).finish(&self.mint, None);
            ErrorCounters::incr(&self.counters.cancelled);
            debug!(mint = %self.mint, "Cycle cancelled before commit");
        }
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    policy: TierPolicy,
    limits: TuningLimits,
    state: Arc<Mutex<SchedulerState>>,
    pipeline: Arc<Pipeline>,
    memory: MemoryGuard,
    notifier: Arc<dyn NotificationSink>,
    counters: Arc<ErrorCounters>,
    workers: AsyncMutex<JoinSet<()>>,
    commits: TaskTracker,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// Build the scheduler. Fails fast on configuration errors (missing
    /// weights, invalid alpha) before any work is accepted.
    pub fn new(config: &Config, collaborators: Collaborators) -> Result<Arc<Self>> {
        let counters = Arc::new(ErrorCounters::default());
        let pipeline = Pipeline::new(
            config,
            collaborators.metrics,
            collaborators.transactions,
            collaborators.persistence,
            Arc::clone(&collaborators.notifier),
            Arc::clone(&counters),
        )?;

        let limits = TuningLimits::new(
            &config.scheduler,
            Duration::from_secs(config.cache.base_ttl_secs),
            Duration::from_secs(config.cache.max_ttl_secs),
        );
        let params = limits.initial(config.scheduler.initial_parallelism);

        info!(
            model = %pipeline.scorer().kind(),
            parallelism = params.max_parallelism,
            batch_size = params.batch_size,
            "Scheduler initialized"
        );

        Ok(Arc::new(Self {
            policy: config.scheduler.tier_policy(),
            config: config.scheduler.clone(),
            limits,
            state: Arc::new(Mutex::new(SchedulerState::new(params))),
            pipeline: Arc::new(pipeline),
            memory: MemoryGuard::new(config.memory.clone(), collaborators.probe),
            notifier: collaborators.notifier,
            counters,
            workers: AsyncMutex::new(JoinSet::new()),
            commits: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }))
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        lock(&self.state)
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn params(&self) -> TuningParams {
        self.state().params()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Start tracking a token. Registering a known mint is a no-op and
    /// returns false.
    pub async fn register_token(&self, token: Token) -> Result<bool> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        validate_mint(&token.mint)?;
        let known = self.state().is_known(&token.mint);
        if known {
            return Ok(false);
        }
        self.pipeline.persistence().upsert_token(&token).await?;
        let mint = token.mint.clone();
        let registered = self.state().register(token);
        if registered {
            info!(mint = %mint, "Token registered");
        }
        Ok(registered)
    }

    /// Resume every stored token, including smoothing state from its
    /// latest snapshot. Returns the number of tokens restored.
    pub async fn load_from_store(&self) -> Result<usize> {
        let persistence = Arc::clone(self.pipeline.persistence());
        let tokens = persistence.load_tokens().await?;
        let mut restored = 0;
        for token in tokens {
            let latest = persistence.latest_snapshot(&token.mint).await?;
            if let Some(snapshot) = &latest {
                if !token.status.is_terminal() {
                    self.pipeline.smoothing().seed(
                        &token.mint,
                        snapshot.smoothed_components,
                        snapshot.smoothed_score,
                    );
                }
            }
            let fresh = self.state().restore(token, latest.as_ref());
            if fresh {
                restored += 1;
            }
        }
        info!(tokens = restored, "Restored tokens from store");
        Ok(restored)
    }

    /// Queue due tokens of `tier` and dispatch a batch. Returns the number
    /// dispatched.
    pub async fn tick(self: &Arc<Self>, tier: Tier) -> usize {
        if self.is_shutting_down() {
            return 0;
        }
        let mut workers = self.workers.lock().await;
        self.reap(&mut workers);

        let tickets = {
            let mut state = self.state();
            let now = Instant::now();
            state.enqueue_due(tier, &self.policy, now, Utc::now());
            state.claim_batch(tier, now)
        };

        let dispatched = tickets.len();
        for ticket in tickets {
            let guard = ClaimGuard::new(&ticket.token.mint, &self.state, &self.counters);
            let this = Arc::clone(self);
            workers.spawn(async move {
                let mint = ticket.token.mint.clone();
                if let Err(e) = this.run_claimed(ticket, guard).await {
                    this.log_failure(&mint, &e);
                }
            });
        }
        if dispatched > 0 {
            debug!(tier = %tier, dispatched, in_flight = workers.len(), "Dispatched batch");
        }
        dispatched
    }

    /// Collect finished workers without waiting
    fn reap(&self, workers: &mut JoinSet<()>) {
        while let Some(result) = workers.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    ErrorCounters::incr(&self.counters.pipeline_failures);
                    error!(error = %e, "Pipeline worker panicked");
                }
            }
        }
    }

    /// Prepare under the worker, commit on the tracker so an abort can only
    /// land before the commit starts
    async fn run_claimed(&self, ticket: CycleTicket, guard: ClaimGuard) -> Result<CycleOutcome> {
        let timeout = self.params().timeout;
        let prepared = match self.pipeline.prepare(&ticket, timeout).await {
            Ok(prepared) => prepared,
            Err(e) => {
                guard.finish(None);
                return Err(e);
            }
        };

        let pipeline = Arc::clone(&self.pipeline);
        let commit = self.commits.spawn(async move {
            let result = pipeline.commit(prepared).await;
            guard.finish(result.as_ref().ok());
            result
        });
        commit
            .await
            .map_err(|e| Error::Internal(format!("commit task failed: {}", e)))?
    }

    fn log_failure(&self, mint: &str, error: &Error) {
        match error {
            Error::CycleSkipped { reason, .. } => {
                debug!(mint = %mint, reason = %reason, "Cycle skipped")
            }
            Error::Persistence(_) | Error::OutOfOrderSnapshot { .. } => {
                warn!(mint = %mint, error = %error, "Cycle not persisted")
            }
            _ => {
                ErrorCounters::incr(&self.counters.pipeline_failures);
                warn!(mint = %mint, error = %error, "Pipeline failed")
            }
        }
    }

    /// Sample load, apply memory pressure and retune parameters
    pub async fn tuning_tick(&self) -> TuningParams {
        let check = self.memory.check();
        self.apply_memory_pressure(&check);

        let p95_ms = self.pipeline.latency_p95_ms();
        let (before, after, depth, backlog_alert) = {
            let mut state = self.state();
            let depth = state.total_depth();
            let signals = LoadSignals {
                queue_depth: depth,
                p95_ms,
                cpu_pct: check.sample.cpu_pct,
            };
            let before = state.params();
            let mut streaks = state.streaks;
            let after = tune(&before, &signals, &self.limits, &mut streaks);
            state.streaks = streaks;
            state.set_params(after);

            let backlog_alert = if depth > self.config.high_water && !state.backlog_alerted {
                state.backlog_alerted = true;
                true
            } else {
                if depth < self.config.low_water {
                    state.backlog_alerted = false;
                }
                false
            };
            (before, after, depth, backlog_alert)
        };

        if after.cache_ttl != before.cache_ttl {
            self.pipeline.cache().set_ttl(after.cache_ttl);
        }
        if after != before {
            info!(
                parallelism = after.max_parallelism,
                batch_size = after.batch_size,
                timeout_ms = after.timeout.as_millis() as u64,
                cache_ttl_ms = after.cache_ttl.as_millis() as u64,
                queue_depth = depth,
                p95_ms = ?p95_ms,
                "Tuning parameters changed"
            );
        }
        if backlog_alert {
            warn!(queue_depth = depth, "Backlog above high water");
            self.notifier.notify(
                AlertKind::BacklogHigh,
                json!({ "queue_depth": depth, "max_parallelism": after.max_parallelism }),
            );
        }
        after
    }

    fn apply_memory_pressure(&self, check: &MemoryCheck) {
        let memory_mb = check.sample.memory_mb();
        if check.pressure >= MemoryPressure::Soft {
            let removed = self
                .pipeline
                .cache()
                .evict_fraction(self.memory.config().evict_fraction);
            self.counters
                .cache_evictions
                .fetch_add(removed as u64, std::sync::atomic::Ordering::Relaxed);
            if removed > 0 {
                debug!(removed, memory_mb, "Evicted cache entries under memory pressure");
            }
        }
        self.state()
            .set_cold_intake_paused(check.pressure == MemoryPressure::Hard);

        if !check.changed() {
            return;
        }
        let payload = json!({
            "memory_mb": memory_mb,
            "soft_limit_mb": self.memory.config().soft_limit_mb,
            "hard_limit_mb": self.memory.config().hard_limit_mb,
        });
        match check.pressure {
            MemoryPressure::Hard => {
                warn!(memory_mb, "Hard memory limit reached, pausing cold intake");
                self.notifier.notify(AlertKind::MemoryHard, payload);
            }
            MemoryPressure::Soft => {
                warn!(memory_mb, "Soft memory limit reached");
                self.notifier.notify(AlertKind::MemorySoft, payload);
            }
            MemoryPressure::Normal => {
                info!(memory_mb, "Memory back under limits");
                self.notifier.notify(AlertKind::MemoryRecovered, payload);
            }
        }
    }

    /// Recompute one token now, outside the tier queues
    pub async fn force_recompute(&self, mint: &str) -> Result<ScoreSnapshot> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        validate_mint(mint)?;
        let ticket = self.state().claim_one(mint, Instant::now())?;
        let guard = ClaimGuard::new(mint, &self.state, &self.counters);
        let outcome = self.run_claimed(ticket, guard).await?;
        Ok(outcome.snapshot)
    }

    pub async fn health(&self) -> HealthReport {
        let (queue_hot, queue_cold, in_flight, tokens, tuning, cold_intake_paused) = {
            let state = self.state();
            (
                state.queue_depth(Tier::Hot),
                state.queue_depth(Tier::Cold),
                state.in_flight_count(),
                state.status_counts(),
                state.params(),
                state.cold_intake_paused(),
            )
        };
        HealthReport {
            model: self.pipeline.scorer().kind(),
            queue_hot,
            queue_cold,
            in_flight,
            tokens,
            breaker: self.pipeline.breaker().status().await,
            memory: self.memory.stats(),
            tuning,
            cache: self.pipeline.cache().report(),
            counters: self.counters.snapshot(),
            latency_p95_ms: self.pipeline.latency_p95_ms(),
            cold_intake_paused,
            shutting_down: self.is_shutting_down(),
        }
    }

    /// Drive the tier and tuning loops until shutdown, then drain
    pub async fn run(self: Arc<Self>) {
        info!(
            hot_interval_secs = self.config.hot_interval_secs,
            cold_interval_secs = self.config.cold_interval_secs,
            "Scheduler running"
        );
        tokio::join!(
            self.tier_loop(Tier::Hot),
            self.tier_loop(Tier::Cold),
            self.tuning_loop(),
        );
        self.drain().await;
        info!("Scheduler stopped");
    }

    async fn tier_loop(self: &Arc<Self>, tier: Tier) {
        let mut ticker = interval(Duration::from_millis(self.config.tick_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(tier).await;
                }
            }
        }
        debug!(tier = %tier, "Tier loop stopped");
    }

    async fn tuning_loop(&self) {
        let mut ticker = interval(Duration::from_millis(self.config.tuning_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tuning_tick().await;
                }
            }
        }
    }

    /// Stop dispatching. In-flight work is drained by [`Scheduler::drain`].
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Shutdown requested, no further dispatch");
            self.shutdown.cancel();
        }
    }

    /// Wait for in-flight pipelines up to the grace period, abort the rest,
    /// then wait for every started commit
    pub async fn drain(&self) {
        self.shutdown();
        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let mut workers = self.workers.lock().await;
        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                next = workers.join_next() => match next {
                    Some(Err(e)) if e.is_panic() => {
                        ErrorCounters::incr(&self.counters.pipeline_failures);
                        error!(error = %e, "Pipeline worker panicked");
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(remaining = workers.len(), "Grace period elapsed, aborting in-flight pipelines");
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                    break;
                }
            }
        }

        self.commits.close();
        self.commits.wait().await;
        debug!("Drain complete");
    }
}
