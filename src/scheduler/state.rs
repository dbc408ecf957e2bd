//! Scheduler state
//!
//! One owned object holding the tier queues, in-flight claims, tuning
//! parameters and per-token bookkeeping. The scheduler wraps it in a mutex;
//! every mutation goes through the methods below. A mint is claimed at most
//! once at a time: claims are taken and released under the same lock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::scheduler::pipeline::CycleOutcome;
use crate::scheduler::tuner::{TuningParams, TuningStreaks};
use crate::types::{ScoreSnapshot, Tier, Token, TokenStatus};

/// Scheduling bookkeeping for one token
#[derive(Debug, Clone)]
pub struct TrackedToken {
    pub token: Token,
    pub last_dispatched: Option<Instant>,
    pub completed_cycles: u64,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub last_score: Option<f64>,
}

impl TrackedToken {
    fn new(token: Token) -> Self {
        Self {
            token,
            last_dispatched: None,
            completed_cycles: 0,
            last_timestamp: None,
            last_score: None,
        }
    }
}

/// A claimed unit of work
#[derive(Debug, Clone)]
pub struct CycleTicket {
    pub token: Token,
    /// Cycle number the snapshot will carry
    pub cycle: u64,
    /// Timestamp of the previous snapshot; the next one must be later
    pub not_before: Option<DateTime<Utc>>,
}

/// Tier assignment and intervals
#[derive(Debug, Clone)]
pub struct TierPolicy {
    pub hot_interval: Duration,
    pub cold_interval: Duration,
    pub hot_window: Duration,
    pub hot_score_threshold: f64,
}

impl TierPolicy {
    pub fn interval(&self, tier: Tier) -> Duration {
        match tier {
            Tier::Hot => self.hot_interval,
            Tier::Cold => self.cold_interval,
        }
    }

    /// Hot: active and recently promoted, or scoring above the threshold.
    /// Archived tokens have no tier.
    pub fn tier_of(&self, tracked: &TrackedToken, now: DateTime<Utc>) -> Option<Tier> {
        match tracked.token.status {
            TokenStatus::Archived => None,
            TokenStatus::Monitoring => Some(Tier::Cold),
            TokenStatus::Active => {
                let recently_promoted = tracked
                    .token
                    .promoted_at
                    .map(|at| {
                        now.signed_duration_since(at)
                            .to_std()
                            .map(|age| age <= self.hot_window)
                            .unwrap_or(true)
                    })
                    .unwrap_or(false);
                let scoring_high = tracked
                    .last_score
                    .map(|s| s >= self.hot_score_threshold)
                    .unwrap_or(false);
                if recently_promoted || scoring_high {
                    Some(Tier::Hot)
                } else {
                    Some(Tier::Cold)
                }
            }
        }
    }
}

/// Recovered-error counters surfaced in health reports
#[derive(Debug, Default)]
pub struct ErrorCounters {
    pub fetch_failures: AtomicU64,
    pub retries: AtomicU64,
    pub stale_served: AtomicU64,
    pub skipped_cycles: AtomicU64,
    pub pipeline_failures: AtomicU64,
    pub spam_failures: AtomicU64,
    pub deferred_transitions: AtomicU64,
    pub persist_failures: AtomicU64,
    pub cancelled: AtomicU64,
    pub cache_evictions: AtomicU64,
    pub completed_cycles: AtomicU64,
}

impl ErrorCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            fetch_failures: load(&self.fetch_failures),
            retries: load(&self.retries),
            stale_served: load(&self.stale_served),
            skipped_cycles: load(&self.skipped_cycles),
            pipeline_failures: load(&self.pipeline_failures),
            spam_failures: load(&self.spam_failures),
            deferred_transitions: load(&self.deferred_transitions),
            persist_failures: load(&self.persist_failures),
            cancelled: load(&self.cancelled),
            cache_evictions: load(&self.cache_evictions),
            completed_cycles: load(&self.completed_cycles),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub fetch_failures: u64,
    pub retries: u64,
    pub stale_served: u64,
    pub skipped_cycles: u64,
    pub pipeline_failures: u64,
    pub spam_failures: u64,
    pub deferred_transitions: u64,
    pub persist_failures: u64,
    pub cancelled: u64,
    pub cache_evictions: u64,
    pub completed_cycles: u64,
}

pub struct SchedulerState {
    tokens: HashMap<String, TrackedToken>,
    /// Archived mints; only the id is kept so they are never rescheduled
    archived: HashSet<String>,
    hot: VecDeque<String>,
    cold: VecDeque<String>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
    params: TuningParams,
    pub(crate) streaks: TuningStreaks,
    cold_intake_paused: bool,
    pub(crate) backlog_alerted: bool,
}

impl SchedulerState {
    pub fn new(params: TuningParams) -> Self {
        Self {
            tokens: HashMap::new(),
            archived: HashSet::new(),
            hot: VecDeque::new(),
            cold: VecDeque::new(),
            queued: HashSet::new(),
            in_flight: HashSet::new(),
            params,
            streaks: TuningStreaks::default(),
            cold_intake_paused: false,
            backlog_alerted: false,
        }
    }

    /// Track a token. Returns false if the mint is already known.
    pub fn register(&mut self, token: Token) -> bool {
        if self.is_known(&token.mint) {
            return false;
        }
        self.tokens
            .insert(token.mint.clone(), TrackedToken::new(token));
        true
    }

    /// Track a token loaded from storage, resuming from its latest snapshot
    pub fn restore(&mut self, token: Token, latest: Option<&ScoreSnapshot>) -> bool {
        if self.is_known(&token.mint) {
            return false;
        }
        if token.status.is_terminal() {
            self.archived.insert(token.mint);
            return true;
        }
        let mut tracked = TrackedToken::new(token);
        if let Some(snapshot) = latest {
            tracked.completed_cycles = snapshot.cycle;
            tracked.last_timestamp = Some(snapshot.timestamp);
            tracked.last_score = Some(snapshot.smoothed_score);
        }
        self.tokens.insert(tracked.token.mint.clone(), tracked);
        true
    }

    /// Tracked or archived
    pub fn is_known(&self, mint: &str) -> bool {
        self.tokens.contains_key(mint) || self.archived.contains(mint)
    }

    pub fn get(&self, mint: &str) -> Option<&TrackedToken> {
        self.tokens.get(mint)
    }

    pub fn tokens(&self) -> impl Iterator<Item = &TrackedToken> {
        self.tokens.values()
    }

    fn queue_mut(&mut self, tier: Tier) -> &mut VecDeque<String> {
        match tier {
            Tier::Hot => &mut self.hot,
            Tier::Cold => &mut self.cold,
        }
    }

    /// Queue every due token of `tier`, least recently dispatched first
    pub fn enqueue_due(
        &mut self,
        tier: Tier,
        policy: &TierPolicy,
        now: Instant,
        now_utc: DateTime<Utc>,
    ) -> usize {
        if tier == Tier::Cold && self.cold_intake_paused {
            return 0;
        }
        let interval = policy.interval(tier);
        let mut due: Vec<(Option<Instant>, String)> = self
            .tokens
            .values()
            .filter(|t| !self.in_flight.contains(&t.token.mint))
            .filter(|t| !self.queued.contains(&t.token.mint))
            .filter(|t| policy.tier_of(t, now_utc) == Some(tier))
            .filter(|t| match t.last_dispatched {
                Some(at) => now.saturating_duration_since(at) >= interval,
                None => true,
            })
            .map(|t| (t.last_dispatched, t.token.mint.clone()))
            .collect();
        // None sorts first
        due.sort();

        let count = due.len();
        for (_, mint) in due {
            self.queued.insert(mint.clone());
            self.queue_mut(tier).push_back(mint);
        }
        count
    }

    /// Claim up to `batch_size` queued tokens without exceeding
    /// `max_parallelism` in flight
    pub fn claim_batch(&mut self, tier: Tier, now: Instant) -> Vec<CycleTicket> {
        if tier == Tier::Cold && self.cold_intake_paused {
            return Vec::new();
        }
        let capacity = self
            .params
            .max_parallelism
            .saturating_sub(self.in_flight.len())
            .min(self.params.batch_size);

        let mut tickets = Vec::with_capacity(capacity);
        while tickets.len() < capacity {
            let Some(mint) = self.queue_mut(tier).pop_front() else {
                break;
            };
            self.queued.remove(&mint);
            if let Ok(ticket) = self.claim(&mint, now) {
                tickets.push(ticket);
            }
        }
        tickets
    }

    /// Claim one specific token, outside the tier queues
    pub fn claim_one(&mut self, mint: &str, now: Instant) -> Result<CycleTicket> {
        let ticket = self.claim(mint, now)?;
        if self.queued.remove(mint) {
            self.hot.retain(|m| m != mint);
            self.cold.retain(|m| m != mint);
        }
        Ok(ticket)
    }

    fn claim(&mut self, mint: &str, now: Instant) -> Result<CycleTicket> {
        if self.archived.contains(mint) {
            return Err(Error::TokenArchived(mint.to_string()));
        }
        if self.in_flight.contains(mint) {
            return Err(Error::AlreadyInFlight(mint.to_string()));
        }
        let tracked = self
            .tokens
            .get_mut(mint)
            .ok_or_else(|| Error::TokenNotFound(mint.to_string()))?;
        if tracked.token.status.is_terminal() {
            return Err(Error::TokenArchived(mint.to_string()));
        }
        tracked.last_dispatched = Some(now);
        self.in_flight.insert(mint.to_string());
        Ok(CycleTicket {
            token: tracked.token.clone(),
            cycle: tracked.completed_cycles + 1,
            not_before: tracked.last_timestamp,
        })
    }

    /// Release a claim. On success the token's bookkeeping advances; an
    /// archived token is dropped down to its mint.
    pub fn finish(&mut self, mint: &str, outcome: Option<&CycleOutcome>) -> bool {
        let was_in_flight = self.in_flight.remove(mint);
        let Some(outcome) = outcome else {
            return was_in_flight;
        };
        if outcome.token.status.is_terminal() {
            self.tokens.remove(mint);
            self.archived.insert(mint.to_string());
            if self.queued.remove(mint) {
                self.hot.retain(|m| m != mint);
                self.cold.retain(|m| m != mint);
            }
        } else if let Some(tracked) = self.tokens.get_mut(mint) {
            tracked.token = outcome.token.clone();
            tracked.completed_cycles = outcome.snapshot.cycle;
            tracked.last_timestamp = Some(outcome.snapshot.timestamp);
            tracked.last_score = Some(outcome.snapshot.smoothed_score);
        }
        was_in_flight
    }

    pub fn is_in_flight(&self, mint: &str) -> bool {
        self.in_flight.contains(mint)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn queue_depth(&self, tier: Tier) -> usize {
        match tier {
            Tier::Hot => self.hot.len(),
            Tier::Cold => self.cold.len(),
        }
    }

    pub fn total_depth(&self) -> usize {
        self.hot.len() + self.cold.len()
    }

    pub fn params(&self) -> TuningParams {
        self.params
    }

    pub fn set_params(&mut self, params: TuningParams) {
        self.params = params;
    }

    pub fn cold_intake_paused(&self) -> bool {
        self.cold_intake_paused
    }

    pub fn set_cold_intake_paused(&mut self, paused: bool) {
        self.cold_intake_paused = paused;
    }

    /// Token counts by status
    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts {
            archived: self.archived.len(),
            ..Default::default()
        };
        for t in self.tokens.values() {
            match t.token.status {
                TokenStatus::Monitoring => counts.monitoring += 1,
                TokenStatus::Active => counts.active += 1,
                TokenStatus::Archived => counts.archived += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub monitoring: usize,
    pub active: usize,
    pub archived: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{ArchiveReason, Transition};
    use crate::scoring::ModelKind;
    use crate::types::test_support::mint;
    use crate::types::ComponentSet;

    fn params(parallelism: usize, batch: usize) -> TuningParams {
        TuningParams {
            max_parallelism: parallelism,
            batch_size: batch,
            timeout: Duration::from_secs(2),
            cache_ttl: Duration::from_secs(15),
        }
    }

    fn policy() -> TierPolicy {
        TierPolicy {
            hot_interval: Duration::from_secs(30),
            cold_interval: Duration::from_secs(300),
            hot_window: Duration::from_secs(1800),
            hot_score_threshold: 0.6,
        }
    }

    fn state_with(n: u8, parallelism: usize, batch: usize) -> SchedulerState {
        let mut state = SchedulerState::new(params(parallelism, batch));
        for i in 1..=n {
            assert!(state.register(Token::new(&mint(i), None, None).unwrap()));
        }
        state
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut state = state_with(1, 4, 4);
        assert!(!state.register(Token::new(&mint(1), None, None).unwrap()));
        assert_eq!(state.tokens().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claims_respect_parallelism_and_batch() {
        let mut state = state_with(10, 3, 5);
        let now = Instant::now();
        assert_eq!(state.enqueue_due(Tier::Cold, &policy(), now, Utc::now()), 10);
        assert_eq!(state.claim_batch(Tier::Cold, now).len(), 3);
        assert_eq!(state.in_flight_count(), 3);
        assert!(state.claim_batch(Tier::Cold, now).is_empty());
        assert_eq!(state.total_depth(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_token_is_never_requeued() {
        let mut state = state_with(1, 4, 4);
        let now = Instant::now();
        state.enqueue_due(Tier::Cold, &policy(), now, Utc::now());
        let tickets = state.claim_batch(Tier::Cold, now);
        assert_eq!(tickets.len(), 1);

        // Even after the interval passes, an in-flight token is skipped
        let later = now + Duration::from_secs(301);
        assert_eq!(state.enqueue_due(Tier::Cold, &policy(), later, Utc::now()), 0);
        assert!(matches!(
            state.claim_one(&mint(1), later),
            Err(Error::AlreadyInFlight(_))
        ));

        assert!(state.finish(&mint(1), None));
        assert!(!state.finish(&mint(1), None));
        assert_eq!(state.enqueue_due(Tier::Cold, &policy(), later, Utc::now()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_due_until_interval() {
        let mut state = state_with(1, 4, 4);
        let now = Instant::now();
        state.enqueue_due(Tier::Cold, &policy(), now, Utc::now());
        state.claim_batch(Tier::Cold, now);
        state.finish(&mint(1), None);

        let soon = now + Duration::from_secs(299);
        assert_eq!(state.enqueue_due(Tier::Cold, &policy(), soon, Utc::now()), 0);
        let due = now + Duration::from_secs(300);
        assert_eq!(state.enqueue_due(Tier::Cold, &policy(), due, Utc::now()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_intake_pause() {
        let mut state = state_with(2, 4, 4);
        state.set_cold_intake_paused(true);
        let now = Instant::now();
        assert_eq!(state.enqueue_due(Tier::Cold, &policy(), now, Utc::now()), 0);
        state.set_cold_intake_paused(false);
        assert_eq!(state.enqueue_due(Tier::Cold, &policy(), now, Utc::now()), 2);
        state.set_cold_intake_paused(true);
        assert!(state.claim_batch(Tier::Cold, now).is_empty());
    }

    #[test]
    fn test_tier_assignment() {
        let policy = policy();
        let now = Utc::now();
        let mut tracked = TrackedToken::new(Token::new(&mint(1), None, None).unwrap());
        assert_eq!(policy.tier_of(&tracked, now), Some(Tier::Cold));

        tracked.token.status = TokenStatus::Active;
        tracked.token.promoted_at = Some(now - chrono::Duration::minutes(5));
        assert_eq!(policy.tier_of(&tracked, now), Some(Tier::Hot));

        tracked.token.promoted_at = Some(now - chrono::Duration::hours(2));
        tracked.last_score = Some(0.2);
        assert_eq!(policy.tier_of(&tracked, now), Some(Tier::Cold));
        tracked.last_score = Some(0.7);
        assert_eq!(policy.tier_of(&tracked, now), Some(Tier::Hot));

        tracked.token.status = TokenStatus::Archived;
        assert_eq!(policy.tier_of(&tracked, now), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_archived_cannot_be_claimed() {
        let mut state = state_with(1, 4, 4);
        if let Some(t) = state.tokens.get_mut(&mint(1)) {
            t.token.status = TokenStatus::Archived;
        }
        assert!(matches!(
            state.claim_one(&mint(1), Instant::now()),
            Err(Error::TokenArchived(_))
        ));
        assert!(matches!(
            state.claim_one(&mint(9), Instant::now()),
            Err(Error::TokenNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_archived_tokens_are_dropped_from_tracking() {
        let mut state = state_with(2, 4, 4);
        let now = Instant::now();
        let ticket = state.claim_one(&mint(1), now).unwrap();

        let mut archived = ticket.token.clone();
        archived.status = TokenStatus::Archived;
        let outcome = CycleOutcome {
            snapshot: ScoreSnapshot {
                mint: mint(1),
                cycle: ticket.cycle,
                raw_score: 0.0,
                smoothed_score: 0.0,
                raw_components: ComponentSet::neutral(),
                smoothed_components: ComponentSet::neutral(),
                spam: None,
                model: ModelKind::Hybrid,
                data_stale: false,
                timestamp: Utc::now(),
            },
            token: archived.clone(),
            transition: Transition::Archive(ArchiveReason::MonitoringTimeout),
        };
        assert!(state.finish(&mint(1), Some(&outcome)));

        assert!(state.get(&mint(1)).is_none());
        assert_eq!(state.tokens().count(), 1);
        assert_eq!(state.status_counts().archived, 1);
        assert_eq!(state.status_counts().monitoring, 1);

        // Still known: never re-registered, never claimed, never queued
        assert!(!state.register(Token::new(&mint(1), None, None).unwrap()));
        assert!(matches!(
            state.claim_one(&mint(1), now),
            Err(Error::TokenArchived(_))
        ));
        let later = now + Duration::from_secs(600);
        assert_eq!(state.enqueue_due(Tier::Cold, &policy(), later, Utc::now()), 1);

        // Restoring an archived token keeps only its mint
        let mut fresh = SchedulerState::new(params(4, 4));
        assert!(fresh.restore(archived, None));
        assert_eq!(fresh.tokens().count(), 0);
        assert_eq!(fresh.status_counts().archived, 1);
    }
}
