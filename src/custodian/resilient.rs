//! Resilient Custodian Wrapper
//!
//! Every outbound custodian call goes through here: a per-call timeout,
//! a retry policy for transient errors, the circuit breaker, and the
//! fallback chain when the custodian is unreachable:
//!
//! 1. reads are served from the last-known-good cache within TTL,
//! 2. at-least-once writes are queued for deferred execution and replayed
//!    in original submission order once the breaker closes,
//! 3. everything else surfaces a typed resilience error.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cached::{Cached, TimedCache};
use tracing::{debug, error, info, warn};

use super::breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState};
use super::connector::{ConnectorError, CustodianConnector, CustodianOperation, Receipt};
use super::error::ResilienceError;
use super::retry::RetryPolicy;
use crate::config::ResilienceConfig;

/// How a call actually completed
#[derive(Debug, Clone)]
pub enum CallOutcome {
    /// The custodian executed the operation
    Executed(Receipt),
    /// Read served from the last-known-good cache (custodian unreachable)
    Cached(Receipt),
    /// Write queued for deferred execution (at-least-once)
    Deferred,
}

impl CallOutcome {
    pub fn receipt(&self) -> Option<&Receipt> {
        match self {
            CallOutcome::Executed(r) | CallOutcome::Cached(r) => Some(r),
            CallOutcome::Deferred => None,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, CallOutcome::Deferred)
    }
}

/// One custodian connector wrapped with the full resilience stack
pub struct ResilientCustodian {
    connector: Arc<dyn CustodianConnector>,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    call_timeout: Duration,
    read_cache: Mutex<TimedCache<String, Receipt>>,
    deferred: Mutex<VecDeque<CustodianOperation>>,
    deferred_capacity: usize,
}

impl ResilientCustodian {
    pub fn new(connector: Arc<dyn CustodianConnector>, config: &ResilienceConfig) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            connector.code(),
            BreakerConfig::from(config),
        ));
        Self {
            connector,
            breaker,
            policy: RetryPolicy::from(config),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            read_cache: Mutex::new(TimedCache::with_lifespan(config.read_cache_ttl_secs)),
            deferred: Mutex::new(VecDeque::new()),
            deferred_capacity: config.deferred_queue_capacity,
        }
    }

    pub fn code(&self) -> &str {
        self.connector.code()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Monitoring view of the breaker
    pub fn snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().unwrap().len()
    }

    /// Execute one operation through the resilience stack
    pub async fn execute(
        &self,
        op: CustodianOperation,
    ) -> Result<CallOutcome, ResilienceError> {
        if let Err(short_circuit) = self.breaker.try_acquire() {
            debug!(
                connector = self.code(),
                op = op.kind(),
                "Short-circuited, taking fallback path"
            );
            return self.fallback(op, short_circuit);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;

            let call = tokio::time::timeout(self.call_timeout, self.connector.execute(op.clone()));
            let last_error = match call.await {
                Ok(Ok(receipt)) => {
                    self.breaker.record_success();
                    if let Some(key) = op.cache_key() {
                        self.read_cache
                            .lock()
                            .unwrap()
                            .cache_set(key, receipt.clone());
                    }
                    return Ok(CallOutcome::Executed(receipt));
                }
                Ok(Err(e)) if !e.is_transient() => {
                    // The custodian answered and refused: healthy dependency,
                    // caller's problem. Counts as a success for the breaker.
                    self.breaker.record_success();
                    return Err(ResilienceError::Connector(e));
                }
                Ok(Err(e)) => {
                    self.breaker.record_failure();
                    e
                }
                Err(_elapsed) => {
                    self.breaker.record_failure();
                    ConnectorError::Timeout
                }
            };

            // The failure may have tripped the breaker (or failed the
            // half-open probe): stop retrying and fall back.
            if self.breaker.state() != CircuitState::Closed {
                return self.fallback(
                    op,
                    ResilienceError::CircuitOpen {
                        connector: self.code().to_string(),
                    },
                );
            }

            if attempt >= self.policy.max_attempts {
                warn!(
                    connector = self.code(),
                    op = op.kind(),
                    attempts = attempt,
                    error = %last_error,
                    "Retries exhausted"
                );
                return self.fallback(
                    op,
                    ResilienceError::RetriesExhausted {
                        attempts: attempt,
                        last: last_error,
                    },
                );
            }

            tokio::time::sleep(self.policy.jittered(attempt - 1)).await;
        }
    }

    /// Replay queued writes, in original submission order. Stops at the
    /// first transient failure (the op stays at the head of the queue).
    pub async fn replay_deferred(&self) -> Result<usize, ResilienceError> {
        if self.breaker.state() != CircuitState::Closed {
            return Ok(0);
        }

        let mut replayed = 0;
        loop {
            let op = match self.deferred.lock().unwrap().pop_front() {
                Some(op) => op,
                None => break,
            };

            let call = tokio::time::timeout(self.call_timeout, self.connector.execute(op.clone()));
            match call.await {
                Ok(Ok(_)) => {
                    self.breaker.record_success();
                    replayed += 1;
                }
                Ok(Err(e)) if !e.is_transient() => {
                    self.breaker.record_success();
                    // A queued write the custodian refuses will never
                    // succeed; escalate instead of blocking the queue.
                    error!(
                        connector = self.code(),
                        op = op.kind(),
                        error = %e,
                        "Deferred operation rejected by custodian, escalating"
                    );
                }
                Ok(Err(e)) => {
                    self.breaker.record_failure();
                    self.deferred.lock().unwrap().push_front(op);
                    debug!(
                        connector = self.code(),
                        error = %e,
                        "Deferred replay interrupted"
                    );
                    break;
                }
                Err(_elapsed) => {
                    self.breaker.record_failure();
                    self.deferred.lock().unwrap().push_front(op);
                    break;
                }
            }
        }

        if replayed > 0 {
            info!(connector = self.code(), replayed, "Replayed deferred operations");
        }
        Ok(replayed)
    }

    fn fallback(
        &self,
        op: CustodianOperation,
        cause: ResilienceError,
    ) -> Result<CallOutcome, ResilienceError> {
        if op.is_read() {
            if let Some(key) = op.cache_key() {
                // TimedCache enforces the TTL: expired entries miss
                if let Some(receipt) = self.read_cache.lock().unwrap().cache_get(&key) {
                    debug!(
                        connector = self.code(),
                        key = %key,
                        "Serving last-known-good cached read"
                    );
                    return Ok(CallOutcome::Cached(receipt.clone()));
                }
            }
            return Err(cause);
        }

        // At-least-once write: queue rather than drop
        let mut deferred = self.deferred.lock().unwrap();
        if deferred.len() >= self.deferred_capacity {
            return Err(ResilienceError::QueueFull {
                connector: self.code().to_string(),
            });
        }
        deferred.push_back(op);
        warn!(
            connector = self.code(),
            queued = deferred.len(),
            cause = %cause,
            "Write deferred until custodian recovers"
        );
        Ok(CallOutcome::Deferred)
    }
}
