//! Adaptive per-provider rate and concurrency control.
//!
//! Every provider gets a slot holding its [`SourceStats`], a rolling call
//! history, an in-flight counter and the earliest instant the next request
//! may be dispatched. [`RateController::execute`] wraps one logical fetch:
//! it waits for a permit, spaces the dispatch by the current delay, retries
//! retryable failures with exponential backoff, and feeds every outcome
//! back into the delay and concurrency state.

use super::provider::DataError;
use crate::clock::{Clock, SystemClock};
use crate::config::{
    ConcurrencySettings, EngineConfig, ProviderSettings, RateSettings, RetrySettings,
};
use chrono::NaiveDateTime;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Observed behaviour of one provider over the process lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    pub source: String,
    pub success_count: u64,
    /// All failed attempts, rate limits included.
    pub failure_count: u64,
    pub rate_limited_count: u64,
    pub consecutive_successes: u32,
    pub current_delay: Duration,
    pub current_concurrency: usize,
    pub last_rate_limited_at: Option<NaiveDateTime>,
    /// Success rate over the rolling history window, if any calls were made.
    pub rolling_success_rate: Option<f64>,
}

impl SourceStats {
    pub fn total_calls(&self) -> u64 {
        self.success_count + self.failure_count
    }

    /// Lifetime success rate.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.total_calls();
        (total > 0).then(|| self.success_count as f64 / total as f64)
    }
}

#[derive(Debug)]
struct ProviderState {
    settings: ProviderSettings,
    stats: SourceStats,
    history: VecDeque<bool>,
    in_flight: usize,
    next_dispatch: Option<Instant>,
}

impl ProviderState {
    fn rolling_rate(&self) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }
        let ok = self.history.iter().filter(|s| **s).count();
        Some(ok as f64 / self.history.len() as f64)
    }
}

#[derive(Debug)]
struct ProviderSlot {
    state: Mutex<ProviderState>,
    permits: Condvar,
}

impl ProviderSlot {
    fn lock(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Releases an in-flight permit when dropped.
struct Permit<'a> {
    slot: &'a ProviderSlot,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut state = self.slot.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        drop(state);
        self.slot.permits.notify_all();
    }
}

/// Shared stats table and throttle for all providers of one engine.
pub struct RateController {
    rate: RateSettings,
    concurrency: ConcurrencySettings,
    retry: RetrySettings,
    overrides: BTreeMap<String, ProviderSettings>,
    slots: Mutex<HashMap<String, Arc<ProviderSlot>>>,
    clock: Arc<dyn Clock>,
}

impl RateController {
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let controller = Self {
            rate: config.rate,
            concurrency: config.concurrency,
            retry: config.retry,
            overrides: config.providers.clone(),
            slots: Mutex::new(HashMap::new()),
            clock,
        };
        for source in &config.sources {
            controller.slot(source);
        }
        controller
    }

    fn settings_for(&self, provider: &str) -> ProviderSettings {
        self.overrides
            .get(provider)
            .copied()
            .unwrap_or_else(|| ProviderSettings::builtin(provider))
    }

    fn base_concurrency(&self, settings: &ProviderSettings) -> usize {
        settings
            .max_concurrent
            .clamp(self.concurrency.min, self.concurrency.max)
    }

    fn slot(&self, provider: &str) -> Arc<ProviderSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get(provider) {
            return Arc::clone(slot);
        }
        let settings = self.settings_for(provider);
        let slot = Arc::new(ProviderSlot {
            state: Mutex::new(ProviderState {
                settings,
                stats: SourceStats {
                    source: provider.to_string(),
                    success_count: 0,
                    failure_count: 0,
                    rate_limited_count: 0,
                    consecutive_successes: 0,
                    current_delay: settings.base_delay(),
                    current_concurrency: self.base_concurrency(&settings),
                    last_rate_limited_at: None,
                    rolling_success_rate: None,
                },
                history: VecDeque::with_capacity(self.rate.history_window),
                in_flight: 0,
                next_dispatch: None,
            }),
            permits: Condvar::new(),
        });
        slots.insert(provider.to_string(), Arc::clone(&slot));
        slot
    }

    /// Run `op` against `provider` under the throttle, retrying retryable
    /// failures up to the configured attempt cap.
    pub fn execute<T>(
        &self,
        provider: &str,
        mut op: impl FnMut() -> Result<T, DataError>,
    ) -> Result<T, DataError> {
        let slot = self.slot(provider);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let backoff = self.backoff(attempt);
            if !backoff.is_zero() {
                debug!(provider, attempt, backoff_ms = backoff.as_millis() as u64, "retrying after backoff");
                std::thread::sleep(backoff);
            }

            let result = {
                let _permit = self.acquire(&slot);
                op()
            };

            match result {
                Ok(value) => {
                    self.on_success(&slot);
                    return Ok(value);
                }
                Err(e) => {
                    if e.is_rate_limit() {
                        self.on_rate_limited(&slot, e.retry_after());
                    } else {
                        self.on_failure(&slot);
                    }
                    if !e.is_retryable() || attempt >= self.retry.max_attempts {
                        return Err(e);
                    }
                    warn!(provider, attempt, error = %e, "fetch attempt failed");
                }
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry.backoff(attempt);
        if self.retry.jitter && !base.is_zero() {
            base.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            base
        }
    }

    /// Block until an in-flight slot is free, then wait out the dispatch spacing.
    fn acquire<'a>(&self, slot: &'a ProviderSlot) -> Permit<'a> {
        let mut state = slot.lock();
        while state.in_flight >= state.stats.current_concurrency {
            state = slot.permits.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        state.in_flight += 1;

        let now = Instant::now();
        let dispatch_at = state.next_dispatch.map_or(now, |t| t.max(now));
        state.next_dispatch = Some(dispatch_at + state.stats.current_delay);
        drop(state);

        let wait = dispatch_at.saturating_duration_since(now);
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        Permit { slot }
    }

    fn on_success(&self, slot: &ProviderSlot) {
        let mut state = slot.lock();
        state.stats.success_count += 1;
        state.stats.consecutive_successes += 1;
        self.push_history(&mut state, true);

        let base = state.settings.base_delay();
        if state.stats.consecutive_successes % self.rate.recovery_every == 0 {
            let eased = state.stats.current_delay.mul_f64(self.rate.recovery_factor);
            state.stats.current_delay = eased.max(base);
        }
        if state.history.len() >= self.rate.reset_min_samples
            && state
                .stats
                .rolling_success_rate
                .is_some_and(|r| r > self.rate.reset_success_rate)
            && state.stats.current_delay != base
        {
            debug!(provider = %state.stats.source, "success rate recovered, delay reset to base");
            state.stats.current_delay = base;
        }
        self.rescale(&mut state);
        drop(state);
        slot.permits.notify_all();
    }

    /// Raise the delay and hold back the next dispatch for at least the
    /// provider's `Retry-After`, capped at `max_retry_after_secs`.
    fn on_rate_limited(&self, slot: &ProviderSlot, retry_after: Option<Duration>) {
        let mut state = slot.lock();
        state.stats.failure_count += 1;
        state.stats.rate_limited_count += 1;
        state.stats.consecutive_successes = 0;
        state.stats.last_rate_limited_at = Some(self.clock.now());
        self.push_history(&mut state, false);

        let raised = state.stats.current_delay.mul_f64(self.rate.backoff_factor);
        let floor = state.settings.base_delay().max(Duration::from_millis(1));
        state.stats.current_delay = raised.max(floor).min(self.rate.max_delay());

        let hold = retry_after
            .unwrap_or(Duration::ZERO)
            .min(self.rate.max_retry_after());
        if !hold.is_zero() {
            let resume_at = Instant::now() + hold;
            state.next_dispatch = Some(state.next_dispatch.map_or(resume_at, |t| t.max(resume_at)));
        }
        warn!(
            provider = %state.stats.source,
            delay_ms = state.stats.current_delay.as_millis() as u64,
            retry_after_ms = hold.as_millis() as u64,
            "rate limited, delay raised"
        );
        self.rescale(&mut state);
    }

    fn on_failure(&self, slot: &ProviderSlot) {
        let mut state = slot.lock();
        state.stats.failure_count += 1;
        state.stats.consecutive_successes = 0;
        self.push_history(&mut state, false);
        self.rescale(&mut state);
    }

    fn push_history(&self, state: &mut ProviderState, ok: bool) {
        if state.history.len() == self.rate.history_window {
            state.history.pop_front();
        }
        state.history.push_back(ok);
        state.stats.rolling_success_rate = state.rolling_rate();
    }

    /// Scale concurrency relative to the configured base, never compounding.
    fn rescale(&self, state: &mut ProviderState) {
        if state.history.len() < self.concurrency.min_samples {
            return;
        }
        let Some(rate) = state.rolling_rate() else {
            return;
        };
        let c = &self.concurrency;
        let base = self.base_concurrency(&state.settings);
        let target = if rate > c.high_water {
            ((base as f64 * c.factor - 1e-9).ceil() as usize).min(c.max)
        } else if rate < c.low_water {
            ((base as f64 / c.factor + 1e-9).floor() as usize).max(c.min)
        } else {
            base
        };
        if target != state.stats.current_concurrency {
            info!(
                provider = %state.stats.source,
                from = state.stats.current_concurrency,
                to = target,
                success_rate = rate,
                "concurrency adjusted"
            );
            state.stats.current_concurrency = target;
        }
    }

    /// Stats for one provider, if it has been seen.
    pub fn stats(&self, provider: &str) -> Option<SourceStats> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(provider).map(|slot| slot.lock().stats.clone())
    }

    /// Stats for every known provider, sorted by name.
    pub fn snapshot(&self) -> Vec<SourceStats> {
        let slots: Vec<Arc<ProviderSlot>> = {
            let guard = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            guard.values().cloned().collect()
        };
        let mut stats: Vec<SourceStats> = slots.iter().map(|s| s.lock().stats.clone()).collect();
        stats.sort_by(|a, b| a.source.cmp(&b.source));
        stats
    }

    pub fn current_concurrency(&self, provider: &str) -> usize {
        self.slot(provider).lock().stats.current_concurrency
    }

    pub fn current_delay(&self, provider: &str) -> Duration {
        self.slot(provider).lock().stats.current_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(base_delay_ms: u64, max_concurrent: usize) -> EngineConfig {
        let mut config = EngineConfig {
            sources: vec!["test".into()],
            ..EngineConfig::default()
        };
        config.providers.insert(
            "test".into(),
            ProviderSettings {
                max_concurrent,
                base_delay_ms,
                batch_size: 10,
                priority: 1,
            },
        );
        config.retry = RetrySettings {
            max_attempts: 3,
            base_delay_ms: 0,
            jitter: false,
        };
        config
    }

    fn assert_ms(d: Duration, expected: u64) {
        let ms = d.as_millis() as i128;
        assert!(
            (ms - expected as i128).abs() <= 1,
            "expected ~{expected}ms, got {ms}ms"
        );
    }

    #[test]
    fn rate_limit_raises_delay_up_to_cap() {
        let rc = RateController::new(&config(100, 5));
        let slot = rc.slot("test");
        rc.on_rate_limited(&slot, None);
        assert_ms(rc.current_delay("test"), 150);
        rc.on_rate_limited(&slot, None);
        assert_ms(rc.current_delay("test"), 225);
        for _ in 0..20 {
            rc.on_rate_limited(&slot, None);
        }
        assert_eq!(rc.current_delay("test"), Duration::from_millis(2_000));
        assert!(rc.stats("test").unwrap().last_rate_limited_at.is_some());
    }

    #[test]
    fn tenth_consecutive_success_eases_delay() {
        let rc = RateController::new(&config(100, 5));
        let slot = rc.slot("test");
        rc.on_rate_limited(&slot, None);
        for _ in 0..9 {
            rc.on_success(&slot);
        }
        assert_ms(rc.current_delay("test"), 150);
        rc.on_success(&slot);
        assert_ms(rc.current_delay("test"), 135);
    }

    #[test]
    fn eased_delay_never_drops_below_base() {
        let rc = RateController::new(&config(100, 5));
        let slot = rc.slot("test");
        for _ in 0..30 {
            rc.on_success(&slot);
        }
        assert_eq!(rc.current_delay("test"), Duration::from_millis(100));
    }

    #[test]
    fn high_rolling_success_rate_resets_delay() {
        let rc = RateController::new(&config(100, 5));
        let slot = rc.slot("test");
        rc.on_rate_limited(&slot, None);
        rc.on_rate_limited(&slot, None);
        // 2 failures + 38 successes = 95% exactly: not above threshold yet
        for _ in 0..38 {
            rc.on_success(&slot);
        }
        assert!(rc.current_delay("test") > Duration::from_millis(100));
        rc.on_success(&slot);
        assert_eq!(rc.current_delay("test"), Duration::from_millis(100));
    }

    #[test]
    fn concurrency_scales_with_success_rate() {
        let rc = RateController::new(&config(0, 10));
        let slot = rc.slot("test");
        for _ in 0..5 {
            rc.on_success(&slot);
        }
        assert_eq!(rc.current_concurrency("test"), 12);

        for _ in 0..20 {
            rc.on_failure(&slot);
        }
        assert_eq!(rc.current_concurrency("test"), 8);
    }

    #[test]
    fn concurrency_respects_global_bounds() {
        let rc = RateController::new(&config(0, 1));
        let slot = rc.slot("test");
        for _ in 0..10 {
            rc.on_failure(&slot);
        }
        assert_eq!(rc.current_concurrency("test"), 1);

        let rc = RateController::new(&config(0, 19));
        let slot = rc.slot("test");
        for _ in 0..10 {
            rc.on_success(&slot);
        }
        assert_eq!(rc.current_concurrency("test"), 20);
    }

    #[test]
    fn execute_retries_unavailable_then_gives_up() {
        let rc = RateController::new(&config(0, 2));
        let calls = AtomicUsize::new(0);
        let result: Result<(), DataError> = rc.execute("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DataError::SourceUnavailable {
                provider: "test".into(),
                reason: "timeout".into(),
            })
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(rc.stats("test").unwrap().failure_count, 3);
    }

    #[test]
    fn execute_recovers_on_second_attempt() {
        let rc = RateController::new(&config(0, 2));
        let calls = AtomicUsize::new(0);
        let result = rc.execute("test", || {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(DataError::SourceUnavailable {
                    provider: "test".into(),
                    reason: "reset".into(),
                })
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        let stats = rc.stats("test").unwrap();
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failure_count, 1);
    }

    #[test]
    fn execute_does_not_retry_rate_limit_or_bad_symbol() {
        let rc = RateController::new(&config(0, 2));
        let calls = AtomicUsize::new(0);
        let _ = rc.execute::<()>("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DataError::RateLimited {
                provider: "test".into(),
                retry_after_secs: None,
            })
        });
        let _ = rc.execute::<()>("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DataError::InvalidSymbol {
                provider: "test".into(),
                symbol: "NOPE".into(),
            })
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(rc.stats("test").unwrap().rate_limited_count, 1);
    }

    #[test]
    fn in_flight_calls_bounded_by_concurrency() {
        let rc = RateController::new(&config(0, 2));
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    rc.execute("test", || {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(5));
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap();
                });
            }
        });

        // Base limit is 2; it may rise to 3 once five calls have succeeded.
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(rc.stats("test").unwrap().success_count, 8);
    }

    #[test]
    fn dispatches_are_spaced_by_delay() {
        let rc = RateController::new(&config(20, 1));
        let start = Instant::now();
        for _ in 0..3 {
            rc.execute("test", || Ok(())).unwrap();
        }
        // First dispatch is immediate, the next two wait 20ms each.
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    fn limited(retry_after_secs: Option<u64>) -> DataError {
        DataError::RateLimited {
            provider: "test".into(),
            retry_after_secs,
        }
    }

    #[test]
    fn retry_after_holds_back_next_dispatch() {
        let rc = RateController::new(&config(0, 2));
        let _ = rc.execute::<()>("test", || Err(limited(Some(1))));

        let start = Instant::now();
        rc.execute("test", || Ok(())).unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[test]
    fn retry_after_is_capped() {
        let mut cfg = config(0, 2);
        cfg.rate.max_retry_after_secs = 0;
        let rc = RateController::new(&cfg);
        let _ = rc.execute::<()>("test", || Err(limited(Some(60))));

        let start = Instant::now();
        rc.execute("test", || Ok(())).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn unknown_provider_gets_builtin_defaults() {
        let rc = RateController::new(&EngineConfig::default());
        assert_eq!(rc.current_concurrency("yfinance"), 15);
        assert_eq!(rc.current_concurrency("alpha_vantage"), 1);
        assert_eq!(rc.current_concurrency("somewhere_else"), 5);
        assert_eq!(rc.snapshot().len(), 4);
    }
}
