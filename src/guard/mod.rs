//! Guarded calls to the Case and Auth services.
//!
//! Every authorization-relevant check fails closed: a negative answer is
//! `Forbidden`, and an open breaker, timeout or transport failure is
//! `DependencyUnavailable`. Neither lets the caller proceed.

pub mod breaker;
pub mod clients;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{EvidenceError, EvidenceResult};

pub use breaker::{BreakerConfig, BreakerError, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use clients::{AuthService, CaseService, HttpAuthClient, HttpCaseClient, ServiceError};

pub const CASE_DEPENDENCY: &str = "case";
pub const AUTH_DEPENDENCY: &str = "auth";

/// One breaker per dependency, created at startup and shared by all requests.
#[derive(Debug, Clone)]
pub struct GuardBreakers {
    pub case: Arc<CircuitBreaker>,
    pub auth: Arc<CircuitBreaker>,
}

impl GuardBreakers {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            case: Arc::new(CircuitBreaker::new(CASE_DEPENDENCY, config.clone())),
            auth: Arc::new(CircuitBreaker::new(AUTH_DEPENDENCY, config.clone())),
        }
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        vec![self.case.snapshot(), self.auth.snapshot()]
    }
}

async fn bounded<F>(timeout: Duration, call: F) -> Result<bool, ServiceError>
where
    F: std::future::Future<Output = Result<bool, ServiceError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::Timeout(timeout)),
    }
}

fn unavailable(dependency: &str, err: BreakerError<ServiceError>) -> EvidenceError {
    match err {
        BreakerError::Open(_) => {
            warn!(dependency, "dependency short-circuited by open breaker");
            EvidenceError::dependency(dependency, "circuit breaker open")
        }
        BreakerError::Inner(err) => {
            warn!(dependency, error = %err, "dependency call failed");
            EvidenceError::dependency(dependency, err.to_string())
        }
    }
}

pub struct DependencyGuard {
    cases: Arc<dyn CaseService>,
    auth: Arc<dyn AuthService>,
    breakers: GuardBreakers,
    call_timeout: Duration,
}

impl DependencyGuard {
    pub fn new(
        cases: Arc<dyn CaseService>,
        auth: Arc<dyn AuthService>,
        breakers: GuardBreakers,
        call_timeout: Duration,
    ) -> Self {
        Self {
            cases,
            auth,
            breakers,
            call_timeout,
        }
    }

    pub fn breakers(&self) -> &GuardBreakers {
        &self.breakers
    }

    /// Succeeds only if the Case service confirms `user_id` owns `case_id`.
    pub async fn ensure_case_owner(&self, user_id: &str, case_id: &str) -> EvidenceResult<()> {
        let timeout = self.call_timeout;
        let cases = Arc::clone(&self.cases);
        let owns = self
            .breakers
            .case
            .call(|| async move { bounded(timeout, cases.user_owns_case(user_id, case_id)).await })
            .await
            .map_err(|err| unavailable(CASE_DEPENDENCY, err))?;

        if owns {
            Ok(())
        } else {
            info!(user_id, case_id, "case ownership denied");
            Err(EvidenceError::Forbidden(format!(
                "user {} does not own case {}",
                user_id, case_id
            )))
        }
    }

    /// Succeeds only if the Auth service knows `user_id`.
    pub async fn ensure_user_exists(&self, user_id: &str) -> EvidenceResult<()> {
        let timeout = self.call_timeout;
        let auth = Arc::clone(&self.auth);
        let exists = self
            .breakers
            .auth
            .call(|| async move { bounded(timeout, auth.user_exists(user_id)).await })
            .await
            .map_err(|err| unavailable(AUTH_DEPENDENCY, err))?;

        if exists {
            Ok(())
        } else {
            info!(user_id, "unknown user rejected");
            Err(EvidenceError::Forbidden(format!("unknown user {}", user_id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    struct Cases {
        owner: &'static str,
        reachable: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CaseService for Cases {
        async fn user_owns_case(&self, user_id: &str, _case_id: &str) -> Result<bool, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.reachable {
                return Err(ServiceError::Transport("connection refused".to_string()));
            }
            Ok(user_id == self.owner)
        }
    }

    struct HangingAuth;

    #[async_trait]
    impl AuthService for HangingAuth {
        async fn user_exists(&self, _user_id: &str) -> Result<bool, ServiceError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(true)
        }
    }

    fn guard(cases: Arc<Cases>, threshold: u32) -> DependencyGuard {
        let config = BreakerConfig::default()
            .with_failure_threshold(threshold)
            .with_cooldown(Duration::from_secs(60));
        DependencyGuard::new(
            cases,
            Arc::new(HangingAuth),
            GuardBreakers::new(&config),
            Duration::from_millis(20),
        )
    }

    fn cases(owner: &'static str, reachable: bool) -> Arc<Cases> {
        Arc::new(Cases {
            owner,
            reachable,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_owner_passes_and_stranger_is_forbidden() {
        let guard = guard(cases("u1", true), 3);
        guard.ensure_case_owner("u1", "c1").await.expect("owner");
        let err = guard.ensure_case_owner("u2", "c1").await.unwrap_err();
        assert!(matches!(err, EvidenceError::Forbidden(_)));
        assert_eq!(guard.breakers().case.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_unreachable_service_fails_closed_then_short_circuits() {
        let cases = cases("u1", false);
        let guard = guard(Arc::clone(&cases), 2);

        for _ in 0..2 {
            let err = guard.ensure_case_owner("u1", "c1").await.unwrap_err();
            assert!(matches!(err, EvidenceError::DependencyUnavailable { .. }));
        }
        assert_eq!(guard.breakers().case.state(), BreakerState::Open);

        let err = guard.ensure_case_owner("u1", "c1").await.unwrap_err();
        assert!(err.is_denial());
        assert!(err.to_string().contains("circuit breaker open"));
        assert_eq!(cases.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_slow_dependency_times_out_as_failure() {
        let guard = guard(cases("u1", true), 1);
        let err = guard.ensure_user_exists("u1").await.unwrap_err();
        assert!(matches!(
            err,
            EvidenceError::DependencyUnavailable { ref dependency, .. } if dependency == "auth"
        ));
        assert_eq!(guard.breakers().auth.state(), BreakerState::Open);
        assert_eq!(guard.breakers().case.state(), BreakerState::Closed);
    }
}
