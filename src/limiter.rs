//! Per-provider adaptive concurrency control (AIMD).
//!
//! Each provider gets one [`AdaptiveRateLimiter`]: a counting semaphore
//! whose capacity grows by one after a streak of successes and halves on a
//! rate-limit signal. The bookkeeping operations are synchronous and
//! thread-safe; [`AdaptiveRateLimiter::acquire`] is the blocking primitive
//! the generation service gates calls through.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Consecutive successes required before capacity grows by one.
const ADDITIVE_INCREASE_THRESHOLD: u32 = 10;
/// Multiplicative decrease factor applied on a rate limit.
const DECREASE_FACTOR: f64 = 0.5;
/// Minimum spacing between two honored decreases.
const DECREASE_COOLDOWN: Duration = Duration::from_secs(5);
/// Idle period after which capacity resets to the initial value.
const IDLE_RESET: Duration = Duration::from_secs(300);

/// Static configuration for one provider's limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterProfile {
    pub initial: u32,
    pub min: u32,
    pub max: u32,
    pub adaptive_enabled: bool,
}

impl Default for LimiterProfile {
    fn default() -> Self {
        Self {
            initial: 10,
            min: 1,
            max: 50,
            adaptive_enabled: true,
        }
    }
}

impl LimiterProfile {
    /// Validate `min > 0`, `max >= min`, `min <= initial <= max`.
    pub fn validate(&self) -> Result<()> {
        if self.min == 0 {
            return Err(Error::Config("limiter min must be > 0".to_string()));
        }
        if self.max < self.min {
            return Err(Error::Config(format!(
                "limiter max ({}) must be >= min ({})",
                self.max, self.min
            )));
        }
        if self.initial < self.min || self.initial > self.max {
            return Err(Error::Config(format!(
                "limiter initial ({}) must be within [{}, {}]",
                self.initial, self.min, self.max
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct LimiterState {
    concurrency: u32,
    in_flight: u32,
    consecutive_successes: u32,
    last_decrease: Option<Instant>,
    last_activity: Option<Instant>,
}

/// Snapshot of limiter state for observability and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterSnapshot {
    pub concurrency: u32,
    pub in_flight: u32,
    pub consecutive_successes: u32,
    pub in_cooldown: bool,
}

/// AIMD concurrency governor for one provider.
pub struct AdaptiveRateLimiter {
    provider: String,
    profile: LimiterProfile,
    state: Mutex<LimiterState>,
    notify: Notify,
}

impl AdaptiveRateLimiter {
    pub fn new(provider: impl Into<String>, profile: LimiterProfile) -> Result<Self> {
        profile.validate()?;
        Ok(Self {
            provider: provider.into(),
            profile,
            state: Mutex::new(LimiterState {
                concurrency: profile.initial,
                in_flight: 0,
                consecutive_successes: 0,
                last_decrease: None,
                last_activity: None,
            }),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a successful call. After ten consecutive successes capacity
    /// grows by one (capped at max) and the streak resets.
    pub fn on_success(&self) {
        let mut state = self.lock();
        state.last_activity = Some(Instant::now());
        state.consecutive_successes += 1;
        if state.consecutive_successes >= ADDITIVE_INCREASE_THRESHOLD {
            state.consecutive_successes = 0;
            if state.concurrency < self.profile.max {
                state.concurrency += 1;
                debug!(
                    provider = %self.provider,
                    concurrency = state.concurrency,
                    "additive increase"
                );
                drop(state);
                self.notify.notify_waiters();
            }
        }
    }

    /// Record a rate-limit signal. Honored at most once per cooldown window;
    /// the new capacity is `max(min, min(floor(current * 0.5), current - 1))`.
    pub fn on_rate_limit(&self, retry_after: Option<Duration>) {
        if !self.profile.adaptive_enabled {
            info!(provider = %self.provider, "rate limited (adaptation disabled)");
            return;
        }
        let mut state = self.lock();
        state.last_activity = Some(Instant::now());
        state.consecutive_successes = 0;
        if let Some(last) = state.last_decrease {
            if last.elapsed() < DECREASE_COOLDOWN {
                return;
            }
        }
        let halved = (state.concurrency as f64 * DECREASE_FACTOR).floor() as u32;
        let reduced = state.concurrency.saturating_sub(1);
        let new = halved.min(reduced).max(self.profile.min);
        warn!(
            provider = %self.provider,
            from = state.concurrency,
            to = new,
            retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
            "multiplicative decrease"
        );
        state.concurrency = new;
        state.last_decrease = Some(Instant::now());
    }

    /// Record a non-rate-limit failure: the streak resets, capacity holds.
    pub fn on_error(&self) {
        let mut state = self.lock();
        state.last_activity = Some(Instant::now());
        state.consecutive_successes = 0;
    }

    /// Current capacity, reclaiming to the initial value after a long idle
    /// period.
    pub fn current_concurrency(&self) -> u32 {
        let mut state = self.lock();
        self.reclaim_if_idle(&mut state);
        state.concurrency
    }

    fn reclaim_if_idle(&self, state: &mut LimiterState) {
        if let Some(last) = state.last_activity {
            if last.elapsed() >= IDLE_RESET && state.concurrency != self.profile.initial {
                debug!(provider = %self.provider, "idle reclamation to initial concurrency");
                state.concurrency = self.profile.initial;
                state.consecutive_successes = 0;
                state.last_decrease = None;
            }
        }
    }

    /// Observability snapshot.
    pub fn snapshot(&self) -> LimiterSnapshot {
        let state = self.lock();
        LimiterSnapshot {
            concurrency: state.concurrency,
            in_flight: state.in_flight,
            consecutive_successes: state.consecutive_successes,
            in_cooldown: state
                .last_decrease
                .is_some_and(|t| t.elapsed() < DECREASE_COOLDOWN),
        }
    }

    /// Reset to the initial profile state. Does not release held permits.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.concurrency = self.profile.initial;
        state.consecutive_successes = 0;
        state.last_decrease = None;
        state.last_activity = None;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Acquire a slot of the current capacity, waiting while the provider is
    /// saturated. The permit releases its slot on drop.
    pub async fn acquire(&self) -> LimiterPermit<'_> {
        loop {
            // Register for wakeups before checking, so a release between
            // the check and the await is never missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                self.reclaim_if_idle(&mut state);
                if state.in_flight < state.concurrency {
                    state.in_flight += 1;
                    return LimiterPermit { limiter: self };
                }
            }
            notified.await;
        }
    }

    #[cfg(test)]
    fn backdate_last_decrease(&self, by: Duration) {
        let mut state = self.lock();
        state.last_decrease = state.last_decrease.map(|t| t - by);
    }

    #[cfg(test)]
    fn backdate_activity(&self, by: Duration) {
        let mut state = self.lock();
        state.last_activity = state.last_activity.map(|t| t - by);
    }
}

/// Held slot on a provider's limiter.
pub struct LimiterPermit<'a> {
    limiter: &'a AdaptiveRateLimiter,
}

impl Drop for LimiterPermit<'_> {
    fn drop(&mut self) {
        let mut state = self.limiter.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        drop(state);
        self.limiter.notify.notify_waiters();
    }
}

/// Registry of limiters keyed by provider, created on first use.
pub struct LimiterRegistry {
    default_profile: LimiterProfile,
    profiles: HashMap<String, LimiterProfile>,
    limiters: Mutex<HashMap<String, std::sync::Arc<AdaptiveRateLimiter>>>,
}

impl LimiterRegistry {
    pub fn new(default_profile: LimiterProfile) -> Self {
        Self {
            default_profile,
            profiles: HashMap::new(),
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Override the profile for one provider key.
    pub fn with_profile(mut self, provider: impl Into<String>, profile: LimiterProfile) -> Self {
        self.profiles.insert(provider.into(), profile);
        self
    }

    /// Limiter for a provider key, created on first use.
    pub fn for_provider(&self, provider: &str) -> std::sync::Arc<AdaptiveRateLimiter> {
        let mut limiters = self
            .limiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(limiter) = limiters.get(provider) {
            return std::sync::Arc::clone(limiter);
        }
        let profile = self
            .profiles
            .get(provider)
            .copied()
            .unwrap_or(self.default_profile);
        let limiter = std::sync::Arc::new(
            AdaptiveRateLimiter::new(provider, profile)
                .expect("default limiter profiles are valid"),
        );
        limiters.insert(provider.to_string(), std::sync::Arc::clone(&limiter));
        limiter
    }
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::new(LimiterProfile::default())
    }
}
