//! Keyed rate limiter with rolling windows.
//!
//! Each rule `(calls, period)` keeps the instants of its last `calls`
//! acquisitions. A slot frees up exactly `period` after it was taken, so no
//! rolling window of length `period` ever sees more than `calls`
//! acquisitions. Rules registered for a key and global rules all apply;
//! the most restrictive one decides how long a caller waits.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};
use trading_core::error::ExchangeError;

/// A limit of `calls` per `period_ms`, for one key or (without a key) for
/// every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    #[serde(default)]
    pub key: Option<String>,
    pub calls: u32,
    pub period_ms: u64,
}

impl RateLimitRule {
    pub fn new(calls: u32, period: Duration) -> Self {
        Self {
            key: None,
            calls,
            period_ms: period.as_millis() as u64,
        }
    }

    pub fn for_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn validate(&self) -> Result<(), ExchangeError> {
        if self.calls == 0 || self.period_ms == 0 {
            return Err(ExchangeError::Configuration(format!(
                "rate limit needs calls > 0 and period > 0, got {} per {}ms",
                self.calls, self.period_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Window {
    calls: usize,
    period: Duration,
    taken: VecDeque<Instant>,
}

impl Window {
    fn new(rule: &RateLimitRule) -> Self {
        Self {
            calls: rule.calls as usize,
            period: rule.period(),
            taken: VecDeque::with_capacity(rule.calls as usize),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&first) = self.taken.front() {
            if first + self.period <= now {
                self.taken.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until a slot frees up, zero when one is free now.
    fn wait(&self, now: Instant) -> Duration {
        if self.taken.len() < self.calls {
            return Duration::ZERO;
        }
        self.taken
            .front()
            .map(|first| (*first + self.period).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }
}

type Windows = Arc<Mutex<Vec<Window>>>;

fn lock(windows: &Mutex<Vec<Window>>) -> std::sync::MutexGuard<'_, Vec<Window>> {
    windows.lock().unwrap_or_else(|e| e.into_inner())
}

/// Async rate limiter shared by a connector's calls.
///
/// Cloning shares state.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    global: Windows,
    keyed: Arc<DashMap<String, Windows>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a limiter from configured rules; rules without a key are global.
    pub fn from_rules(rules: &[RateLimitRule]) -> Result<Self, ExchangeError> {
        let limiter = Self::new();
        for rule in rules {
            match &rule.key {
                Some(key) => limiter.add_rule(key.clone(), rule.clone())?,
                None => limiter.add_global_rule(rule.clone())?,
            }
        }
        Ok(limiter)
    }

    /// Add a rule for `key`. Rules accumulate.
    pub fn add_rule(&self, key: impl Into<String>, rule: RateLimitRule) -> Result<(), ExchangeError> {
        rule.validate()?;
        let windows = self.keyed.entry(key.into()).or_default().clone();
        lock(&windows).push(Window::new(&rule));
        Ok(())
    }

    /// Add a rule applying to every key.
    pub fn add_global_rule(&self, rule: RateLimitRule) -> Result<(), ExchangeError> {
        rule.validate()?;
        lock(&self.global).push(Window::new(&rule));
        Ok(())
    }

    pub fn has_rules(&self, key: &str) -> bool {
        !lock(&self.global).is_empty() || self.keyed.contains_key(key)
    }

    /// Wait until every applicable rule has a free slot, then take one from
    /// each.
    pub async fn acquire(&self, key: &str) {
        loop {
            match self.take(key) {
                Ok(()) => return,
                Err(wait) => {
                    debug!(key, wait_ms = wait.as_millis() as u64, "Rate limited, waiting");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Take a slot from every applicable rule without waiting.
    /// Returns false, taking nothing, when any rule is exhausted.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.take(key).is_ok()
    }

    fn take(&self, key: &str) -> Result<(), Duration> {
        let keyed = self.keyed.get(key).map(|entry| entry.value().clone());
        let now = Instant::now();

        // Global before keyed, always in this order
        let mut global = lock(&self.global);
        let mut keyed_guard = keyed.as_ref().map(|w| lock(w));

        let mut wait = Duration::ZERO;
        for window in global
            .iter_mut()
            .chain(keyed_guard.iter_mut().flat_map(|g| g.iter_mut()))
        {
            window.prune(now);
            wait = wait.max(window.wait(now));
        }
        if !wait.is_zero() {
            return Err(wait);
        }

        for window in global
            .iter_mut()
            .chain(keyed_guard.iter_mut().flat_map(|g| g.iter_mut()))
        {
            window.taken.push_back(now);
        }
        trace!(key, "Rate limit slot taken");
        Ok(())
    }
}
