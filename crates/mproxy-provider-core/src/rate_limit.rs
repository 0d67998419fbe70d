//! Per-credential request pacing: jittered intervals, exponential backoff,
//! daily caps, and suspension detection from upstream error text.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use time::{OffsetDateTime, Time};
use tokio::time::Instant;

use mproxy_common::RateLimitConfig;

const SUSPEND_KEYWORDS: &[&str] = &[
    "suspended",
    "banned",
    "disabled",
    "account has been",
    "access denied",
    "rate limit exceeded",
    "too many requests",
    "quota exceeded",
];

#[derive(Debug, Clone)]
struct TokenState {
    last_request: Option<Instant>,
    request_count: u64,
    fail_count: u32,
    daily_requests: u32,
    daily_reset_at: OffsetDateTime,
    cooldown_end: Option<Instant>,
    suspended: bool,
    suspend_reason: Option<String>,
}

impl TokenState {
    fn new() -> Self {
        Self {
            last_request: None,
            request_count: 0,
            fail_count: 0,
            daily_requests: 0,
            daily_reset_at: next_utc_midnight(OffsetDateTime::now_utc()),
            cooldown_end: None,
            suspended: false,
            suspend_reason: None,
        }
    }
}

/// Read-only view of one key's state, for the management surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TokenStateSnapshot {
    pub request_count: u64,
    pub fail_count: u32,
    pub daily_requests: u32,
    pub cooldown_remaining_ms: u64,
    pub suspended: bool,
    pub suspend_reason: Option<String>,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    states: Mutex<HashMap<String, TokenState>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Block until the key may issue a request, then record the admission.
    ///
    /// Admission requires: no active cooldown, the jittered inter-request
    /// interval elapsed, and the daily cap not reached. Cancel-safe: dropping
    /// the future releases the waiter without recording an admission.
    pub async fn wait(&self, token_key: &str) {
        // One jittered interval per admission, not per poll.
        let interval = self.jittered_interval();
        loop {
            let pending = {
                let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
                let state = states
                    .entry(token_key.to_string())
                    .or_insert_with(TokenState::new);
                let now_utc = OffsetDateTime::now_utc();
                reset_daily_if_needed(state, now_utc);

                let now = Instant::now();
                if let Some(end) = state.cooldown_end
                    && end > now
                {
                    end - now
                } else if state.daily_requests >= self.config.daily_max_requests {
                    let until_reset = state.daily_reset_at - now_utc;
                    Duration::try_from(until_reset).unwrap_or(Duration::from_secs(60))
                } else {
                    let ready_at = state.last_request.map(|last| last + interval);
                    match ready_at {
                        Some(at) if at > now => at - now,
                        _ => {
                            state.last_request = Some(now);
                            state.request_count += 1;
                            state.daily_requests += 1;
                            return;
                        }
                    }
                }
            };
            tokio::time::sleep(pending).await;
        }
    }

    pub fn mark_failed(&self, token_key: &str) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let state = states
            .entry(token_key.to_string())
            .or_insert_with(TokenState::new);
        state.fail_count += 1;
        let backoff = self.backoff(state.fail_count);
        state.cooldown_end = Some(Instant::now() + backoff);
    }

    pub fn mark_success(&self, token_key: &str) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let state = states
            .entry(token_key.to_string())
            .or_insert_with(TokenState::new);
        state.fail_count = 0;
        state.cooldown_end = None;
    }

    /// Check an upstream error message against the suspension keyword set;
    /// on a match, mark the key suspended and apply the suspend cooldown.
    pub fn detect_suspended(&self, token_key: &str, error_msg: &str) -> bool {
        let lower = error_msg.to_lowercase();
        if !SUSPEND_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            return false;
        }
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let state = states
            .entry(token_key.to_string())
            .or_insert_with(TokenState::new);
        state.suspended = true;
        state.suspend_reason = Some(error_msg.to_string());
        state.cooldown_end =
            Some(Instant::now() + Duration::from_millis(self.config.suspend_cooldown_ms));
        true
    }

    pub fn is_available(&self, token_key: &str) -> bool {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let Some(state) = states.get_mut(token_key) else {
            return true;
        };
        reset_daily_if_needed(state, OffsetDateTime::now_utc());
        let now = Instant::now();
        if state.suspended {
            // Suspension cooldown is carried in cooldown_end.
            return state.cooldown_end.is_none_or(|end| end <= now);
        }
        if state.cooldown_end.is_some_and(|end| end > now) {
            return false;
        }
        state.daily_requests < self.config.daily_max_requests
    }

    pub fn reset_suspension(&self, token_key: &str) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = states.get_mut(token_key) {
            state.suspended = false;
            state.suspend_reason = None;
            state.cooldown_end = None;
            state.fail_count = 0;
        }
    }

    pub fn clear(&self, token_key: &str) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.remove(token_key);
    }

    pub fn snapshot(&self, token_key: &str) -> Option<TokenStateSnapshot> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.get(token_key).map(snapshot_of)
    }

    pub fn snapshot_all(&self) -> Vec<(String, TokenStateSnapshot)> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<_> = states
            .iter()
            .map(|(key, state)| (key.clone(), snapshot_of(state)))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Random interval in [min, max] with +/-30% jitter, floored at min so
    /// consecutive admissions keep at least the configured spacing.
    fn jittered_interval(&self) -> Duration {
        let min = self.config.min_interval_ms as f64;
        let max = self.config.max_interval_ms.max(self.config.min_interval_ms) as f64;
        let mut rng = rand::rng();
        let base = if max > min {
            min + rng.random_range(0.0..(max - min))
        } else {
            min
        };
        let jitter = base * self.config.jitter_percent * (rng.random_range(0.0..2.0) - 1.0);
        Duration::from_millis((base + jitter).max(min) as u64)
    }

    fn backoff(&self, fail_count: u32) -> Duration {
        if fail_count == 0 {
            return Duration::ZERO;
        }
        let base = self.config.backoff_base_ms as f64
            * self
                .config
                .backoff_multiplier
                .powi(fail_count.saturating_sub(1) as i32);
        let mut rng = rand::rng();
        let jitter = base * self.config.jitter_percent * (rng.random_range(0.0..2.0) - 1.0);
        let capped = (base + jitter).min(self.config.backoff_max_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

fn snapshot_of(state: &TokenState) -> TokenStateSnapshot {
    let now = Instant::now();
    TokenStateSnapshot {
        request_count: state.request_count,
        fail_count: state.fail_count,
        daily_requests: state.daily_requests,
        cooldown_remaining_ms: state
            .cooldown_end
            .filter(|end| *end > now)
            .map(|end| (end - now).as_millis() as u64)
            .unwrap_or(0),
        suspended: state.suspended,
        suspend_reason: state.suspend_reason.clone(),
    }
}

fn reset_daily_if_needed(state: &mut TokenState, now: OffsetDateTime) {
    if now >= state.daily_reset_at {
        state.daily_requests = 0;
        state.daily_reset_at = next_utc_midnight(now);
    }
}

fn next_utc_midnight(now: OffsetDateTime) -> OffsetDateTime {
    (now + time::Duration::days(1)).replace_time(Time::MIDNIGHT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> RateLimitConfig {
        RateLimitConfig {
            min_interval_ms: 50,
            max_interval_ms: 60,
            daily_max_requests: 500,
            jitter_percent: 0.3,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            backoff_multiplier: 1.5,
            suspend_cooldown_ms: 10_000,
        }
    }

    #[tokio::test]
    async fn wait_spaces_consecutive_admissions() {
        let limiter = RateLimiter::new(quick_config());
        let start = Instant::now();
        limiter.wait("k").await;
        limiter.wait("k").await;
        limiter.wait("k").await;
        // Two inter-request gaps of at least min_interval each.
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block_each_other() {
        let limiter = RateLimiter::new(quick_config());
        limiter.wait("a").await;
        let start = Instant::now();
        limiter.wait("b").await;
        assert!(start.elapsed() < Duration::from_millis(40));
    }

    #[tokio::test]
    async fn mark_failed_applies_backoff_and_success_clears_it() {
        let limiter = RateLimiter::new(quick_config());
        limiter.mark_failed("k");
        assert!(!limiter.is_available("k"));
        let snapshot = limiter.snapshot("k").unwrap();
        assert_eq!(snapshot.fail_count, 1);
        assert!(snapshot.cooldown_remaining_ms > 0);

        limiter.mark_success("k");
        assert!(limiter.is_available("k"));
        assert_eq!(limiter.snapshot("k").unwrap().fail_count, 0);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let limiter = RateLimiter::new(quick_config());
        let first = limiter.backoff(1);
        let deep = limiter.backoff(20);
        assert!(first < Duration::from_millis(200));
        assert!(deep <= Duration::from_millis(1_000));
    }

    #[test]
    fn detect_suspended_matches_keyword_set_case_insensitive() {
        let limiter = RateLimiter::new(quick_config());
        assert!(limiter.detect_suspended("k", "Your account has been SUSPENDED"));
        assert!(!limiter.is_available("k"));
        let snapshot = limiter.snapshot("k").unwrap();
        assert!(snapshot.suspended);

        limiter.reset_suspension("k");
        assert!(limiter.is_available("k"));
    }

    #[test]
    fn unrelated_errors_do_not_suspend() {
        let limiter = RateLimiter::new(quick_config());
        assert!(!limiter.detect_suspended("k", "internal server error"));
        assert!(limiter.is_available("k"));
    }

    #[test]
    fn daily_counter_resets_at_utc_midnight() {
        let mut state = TokenState::new();
        state.daily_requests = 499;
        state.daily_reset_at = OffsetDateTime::now_utc() - time::Duration::seconds(1);
        reset_daily_if_needed(&mut state, OffsetDateTime::now_utc());
        assert_eq!(state.daily_requests, 0);
        assert_eq!(state.daily_reset_at.time(), Time::MIDNIGHT);
        assert!(state.daily_reset_at > OffsetDateTime::now_utc());
    }
}
