use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Settings shared by every dependency breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Time spent open before a probe is allowed.
    pub cooldown: Duration,
    /// Upper bound on one guarded call; exceeding it counts as a failure.
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
        }
    }
}

impl BreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Error, Debug)]
pub enum BreakerError<E> {
    /// Short-circuited; the wrapped call was not attempted.
    #[error("circuit breaker for {0} is open")]
    Open(String),

    #[error("{0}")]
    Inner(E),
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    pub probe_in_flight: bool,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Circuit breaker for one dependency.
///
/// All transitions happen under one mutex that is never held across an
/// `.await`. Open moves to half-open lazily, on the first call after the
/// cooldown; that call becomes the single probe.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Settles the admission when dropped, so a cancelled probe frees the slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Permit<'_> {
    fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.admission);
    }

    fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.admission);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Probe {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // State stays consistent even if a holder panicked; every update is a plain assignment.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
            probe_in_flight: inner.probe_in_flight,
        }
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Some(Admission::Normal),
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|opened| opened.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if !cooled {
                    return None;
                }
                inner.state = BreakerState::HalfOpen;
                inner.probe_in_flight = true;
                info!(dependency = %self.name, "circuit breaker half-open, probing");
                Some(Admission::Probe)
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    None
                } else {
                    inner.probe_in_flight = true;
                    Some(Admission::Probe)
                }
            }
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.lock();
        match admission {
            Admission::Probe => {
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
                info!(dependency = %self.name, "circuit breaker closed");
            }
            Admission::Normal => {
                if inner.state == BreakerState::Closed {
                    inner.consecutive_failures = 0;
                }
            }
        }
    }

    fn on_failure(&self, admission: Admission) {
        let mut inner = self.lock();
        match admission {
            Admission::Probe => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                warn!(dependency = %self.name, "circuit breaker probe failed, reopened");
            }
            Admission::Normal => {
                if inner.state != BreakerState::Closed {
                    return;
                }
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        dependency = %self.name,
                        failures = inner.consecutive_failures,
                        cooldown_ms = self.config.cooldown.as_millis() as u64,
                        "circuit breaker opened"
                    );
                }
            }
        }
    }

    /// Run `call` through the breaker. `Err` from `call` counts as a failure.
    pub async fn call<T, E, F, Fut>(&self, call: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self
            .admit()
            .ok_or_else(|| BreakerError::Open(self.name.clone()))?;
        let permit = Permit {
            breaker: self,
            admission,
            settled: false,
        };

        match call().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(err) => {
                permit.fail();
                Err(BreakerError::Inner(err))
            }
        }
    }
}
