//! Circuit Breaker
//!
//! Per-connector stateful guard over outbound custodian calls. The rolling
//! window update and the state transition happen under one short lock, so
//! concurrent callers always observe a consistent state.
//!
//! State machine:
//! - `Closed`: calls pass through; every outcome lands in a rolling window
//!   of the last W samples. The breaker trips to `Open` when the window
//!   failure rate reaches R and the absolute failure count reaches F.
//! - `Open`: calls are short-circuited with no network attempt until the
//!   cooldown T elapses, then the next caller is admitted as a probe.
//! - `HalfOpen`: exactly one probe in flight. Success closes the breaker
//!   and resets the window; failure re-opens it and restarts the cooldown.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use super::error::ResilienceError;
use crate::config::ResilienceConfig;

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Breaker thresholds, usually derived from [`ResilienceConfig`]
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Rolling window size W (samples)
    pub window_size: usize,
    /// Failure rate threshold R within the window
    pub failure_rate_threshold: f64,
    /// Absolute failure count threshold F within the window
    pub failure_count_threshold: usize,
    /// Open -> HalfOpen cooldown T
    pub cooldown: Duration,
}

impl From<&ResilienceConfig> for BreakerConfig {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            window_size: config.window_size,
            failure_rate_threshold: config.failure_rate_threshold,
            failure_count_threshold: config.failure_count_threshold,
            cooldown: Duration::from_millis(config.cooldown_ms),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::from(&ResilienceConfig::default())
    }
}

/// Point-in-time breaker view for the monitoring surface
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub connector: String,
    pub state: CircuitState,
    pub failures: usize,
    pub samples: usize,
    pub failure_rate: f64,
    pub last_transition_ms: i64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    /// true = failure, bounded to `window_size` samples
    window: VecDeque<bool>,
    failures: usize,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    last_transition_ms: i64,
}

impl Inner {
    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.failures as f64 / self.window.len() as f64
        }
    }
}

/// Per-connector circuit breaker
pub struct CircuitBreaker {
    connector: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(connector: &str, config: BreakerConfig) -> Self {
        let (state_tx, _) = watch::channel(CircuitState::Closed);
        Self {
            connector: connector.to_string(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                failures: 0,
                opened_at: None,
                probe_in_flight: false,
                last_transition_ms: chrono::Utc::now().timestamp_millis(),
            }),
            state_tx,
        }
    }

    pub fn connector(&self) -> &str {
        &self.connector
    }

    /// Admission check before a call. `Open` past its cooldown admits the
    /// caller as the half-open probe; otherwise `Open`/probe-in-flight
    /// short-circuits immediately with no network attempt.
    pub fn try_acquire(&self) -> Result<(), ResilienceError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.cooldown {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(ResilienceError::CircuitOpen {
                        connector: self.connector.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(ResilienceError::CircuitOpen {
                        connector: self.connector.clone(),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a healthy outcome
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                self.push_outcome(&mut inner, false);
            }
            CircuitState::HalfOpen => {
                // Probe succeeded: window reset, back in business
                inner.window.clear();
                inner.failures = 0;
                inner.probe_in_flight = false;
                inner.opened_at = None;
                self.transition(&mut inner, CircuitState::Closed);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed outcome (timeouts included)
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                self.push_outcome(&mut inner, true);
                let tripped = inner.failures >= self.config.failure_count_threshold
                    && inner.failure_rate() >= self.config.failure_rate_threshold;
                if tripped {
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, CircuitState::Open);
                    warn!(
                        connector = %self.connector,
                        failures = inner.failures,
                        rate = inner.failure_rate(),
                        "Circuit tripped OPEN"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Probe failed: back to Open, cooldown restarts
                inner.probe_in_flight = false;
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn failure_rate(&self) -> f64 {
        self.inner.lock().unwrap().failure_rate()
    }

    /// Monitoring view
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap();
        BreakerSnapshot {
            connector: self.connector.clone(),
            state: inner.state,
            failures: inner.failures,
            samples: inner.window.len(),
            failure_rate: inner.failure_rate(),
            last_transition_ms: inner.last_transition_ms,
        }
    }

    /// State-change feed for the external monitoring collaborator
    pub fn subscribe(&self) -> watch::Receiver<CircuitState> {
        self.state_tx.subscribe()
    }

    fn push_outcome(&self, inner: &mut Inner, failure: bool) {
        inner.window.push_back(failure);
        if failure {
            inner.failures += 1;
        }
        while inner.window.len() > self.config.window_size {
            if inner.window.pop_front() == Some(true) {
                inner.failures -= 1;
            }
        }
    }

    fn transition(&self, inner: &mut Inner, next: CircuitState) {
        if inner.state == next {
            return;
        }
        info!(
            connector = %self.connector,
            from = %inner.state,
            to = %next,
            "Circuit state change"
        );
        inner.state = next;
        inner.last_transition_ms = chrono::Utc::now().timestamp_millis();
        self.state_tx.send_replace(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        // F=5, R=0.5, W=10, T=1s
        CircuitBreaker::new(
            "test-bank",
            BreakerConfig {
                window_size: 10,
                failure_rate_threshold: 0.5,
                failure_count_threshold: 5,
                cooldown: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test]
    async fn test_trips_at_thresholds() {
        let b = breaker();

        // 3 successes, then failures: 5 failures out of 8 calls
        for _ in 0..3 {
            b.try_acquire().unwrap();
            b.record_success();
        }
        for i in 0..5 {
            assert_eq!(b.state(), CircuitState::Closed, "still closed before #{}", i);
            b.try_acquire().unwrap();
            b.record_failure();
        }

        // rate = 5/8 = 0.625 >= 0.5, count = 5 >= 5
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.try_acquire().is_err());
    }

    #[tokio::test]
    async fn test_count_threshold_guards_small_samples() {
        let b = breaker();

        // 2 failures out of 2 is a 100% rate but below the count threshold
        for _ in 0..2 {
            b.try_acquire().unwrap();
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_probe_success_closes() {
        let b = breaker();
        for _ in 0..5 {
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(2)).await;

        // First caller after cooldown becomes the probe
        b.try_acquire().unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        // A second caller is rejected while the probe is in flight
        assert!(b.try_acquire().is_err());

        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_rate(), 0.0); // window reset
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens() {
        let b = breaker();
        for _ in 0..5 {
            b.record_failure();
        }
        tokio::time::advance(Duration::from_secs(2)).await;

        b.try_acquire().unwrap();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);

        // Cooldown restarted: still rejected before it elapses again
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(b.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(b.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_window_is_rolling() {
        let b = breaker();

        // 4 failures then enough successes to push them out of the window
        for _ in 0..4 {
            b.record_failure();
        }
        for _ in 0..10 {
            b.record_success();
        }
        assert_eq!(b.failure_rate(), 0.0);

        let snap = b.snapshot();
        assert_eq!(snap.samples, 10);
        assert_eq!(snap.failures, 0);
        assert_eq!(snap.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_state_change_feed() {
        let b = breaker();
        let rx = b.subscribe();
        assert_eq!(*rx.borrow(), CircuitState::Closed);

        for _ in 0..5 {
            b.record_failure();
        }
        assert_eq!(*rx.borrow(), CircuitState::Open);
    }
}
