//! Circuit Breaker
//!
//! Per-remote failure counting with the classic closed/open/half-open state
//! machine. One breaker per adapter or remote service, owned by a
//! process-wide registry and shared across concurrent pipelines.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Breaker state as observed by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker for a single remote.
///
/// Transitions:
/// - closed -> open after `failure_threshold` consecutive failures
/// - open -> half_open once `cooldown` has elapsed
/// - half_open -> closed on one success, back to open on failure
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying the open -> half_open cooldown transition.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == BreakerState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.cooldown
        {
            inner.state = BreakerState::HalfOpen;
            tracing::info!("Circuit breaker '{}' cooled down, now half-open", self.name);
        }
        inner.state
    }

    /// Whether a call may proceed right now.
    pub fn allow(&self) -> bool {
        self.state() != BreakerState::Open
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state != BreakerState::Closed {
            tracing::info!("Circuit breaker '{}' closed after success", self.name);
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                tracing::warn!("Circuit breaker '{}' re-opened from half-open", self.name);
            },
            _ => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        "Circuit breaker '{}' opened after {} consecutive failures",
                        self.name,
                        inner.consecutive_failures
                    );
                }
            },
        }
    }
}

/// Process-wide breaker registry, keyed by adapter or remote name.
///
/// Adapters own their breakers through a lookup here rather than holding
/// them directly, so concurrent pipelines share failure counts.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl BreakerRegistry {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self { breakers: DashMap::new(), failure_threshold, cooldown }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(name, self.failure_threshold, self.cooldown))
            })
            .clone()
    }

    pub fn states(&self) -> Vec<(String, BreakerState)> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_exactly_threshold_failures() {
        let breaker = CircuitBreaker::new("test", 5, Duration::from_secs(30));

        for _ in 0..4 {
            breaker.record_failure();
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("test", 5, Duration::from_secs(30));

        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown_then_closes_on_success() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_millis(10));

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.allow());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_millis(10));

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_registry_shares_breakers_by_name() {
        let registry = BreakerRegistry::new(5, Duration::from_secs(30));
        let a = registry.get("clearbit");
        let b = registry.get("clearbit");

        a.record_failure();
        a.record_failure();
        a.record_failure();
        a.record_failure();
        a.record_failure();

        assert_eq!(b.state(), BreakerState::Open);
    }
}
