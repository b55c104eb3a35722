use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tracing::debug;

use crate::error::{EvidenceError, EvidenceResult};

/// Failure talking to a dependency (as opposed to a negative answer).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected status {0}")]
    UnexpectedStatus(u16),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// Case ownership lookups.
#[async_trait]
pub trait CaseService: Send + Sync {
    async fn user_owns_case(&self, user_id: &str, case_id: &str) -> Result<bool, ServiceError>;
}

/// User existence lookups.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn user_exists(&self, user_id: &str) -> Result<bool, ServiceError>;
}

fn base_url(raw: &str) -> EvidenceResult<Url> {
    let url = Url::parse(raw)
        .map_err(|err| EvidenceError::Config(format!("invalid service url {}: {}", raw, err)))?;
    if url.cannot_be_a_base() {
        return Err(EvidenceError::Config(format!("invalid service url: {}", raw)));
    }
    Ok(url)
}

fn join_segments(base: &Url, segments: &[&str]) -> Result<Url, ServiceError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ServiceError::Transport(format!("cannot build url from {}", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn http_client(timeout: Duration) -> EvidenceResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| EvidenceError::Config(format!("failed to build http client: {}", err)))
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> ServiceError {
    if err.is_timeout() {
        ServiceError::Timeout(timeout)
    } else {
        ServiceError::Transport(err.to_string())
    }
}

/// `GET {case_url}/v1/cases/{case_id}` with the caller in `X-User-ID`.
#[derive(Debug, Clone)]
pub struct HttpCaseClient {
    http: reqwest::Client,
    base: Url,
    timeout: Duration,
}

impl HttpCaseClient {
    pub fn new(url: &str, timeout: Duration) -> EvidenceResult<Self> {
        Ok(Self {
            http: http_client(timeout)?,
            base: base_url(url)?,
            timeout,
        })
    }
}

#[async_trait]
impl CaseService for HttpCaseClient {
    async fn user_owns_case(&self, user_id: &str, case_id: &str) -> Result<bool, ServiceError> {
        let url = join_segments(&self.base, &["v1", "cases", case_id])?;
        let response = self
            .http
            .get(url)
            .header("X-User-ID", user_id)
            .send()
            .await
            .map_err(|err| transport_error(err, self.timeout))?;

        let status = response.status();
        debug!(user_id, case_id, status = status.as_u16(), "case ownership lookup");
        match status {
            StatusCode::OK => Ok(true),
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Ok(false),
            other => Err(ServiceError::UnexpectedStatus(other.as_u16())),
        }
    }
}

/// `GET {auth_url}/v1/users/{user_id}`.
#[derive(Debug, Clone)]
pub struct HttpAuthClient {
    http: reqwest::Client,
    base: Url,
    timeout: Duration,
}

impl HttpAuthClient {
    pub fn new(url: &str, timeout: Duration) -> EvidenceResult<Self> {
        Ok(Self {
            http: http_client(timeout)?,
            base: base_url(url)?,
            timeout,
        })
    }
}

#[async_trait]
impl AuthService for HttpAuthClient {
    async fn user_exists(&self, user_id: &str) -> Result<bool, ServiceError> {
        let url = join_segments(&self.base, &["v1", "users", user_id])?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| transport_error(err, self.timeout))?;

        let status = response.status();
        debug!(user_id, status = status.as_u16(), "user lookup");
        match status {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => Err(ServiceError::UnexpectedStatus(other.as_u16())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_are_escaped() {
        let base = base_url("http://cases.local/api/").expect("url");
        let url = join_segments(&base, &["v1", "cases", "c 1/../x"]).expect("join");
        assert_eq!(url.as_str(), "http://cases.local/api/v1/cases/c%201%2F..%2Fx");
    }

    #[test]
    fn test_rejects_unusable_base() {
        assert!(matches!(
            HttpCaseClient::new("mailto:ops@example.com", Duration::from_secs(1)),
            Err(EvidenceError::Config(_))
        ));
        assert!(HttpAuthClient::new("not a url", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_constructors_parse_base_url() {
        let cases = HttpCaseClient::new("http://cases.local/api", Duration::from_secs(1))
            .expect("case client");
        assert_eq!(cases.base.as_str(), "http://cases.local/api");
        assert_eq!(cases.timeout, Duration::from_secs(1));

        let auth = HttpAuthClient::new("http://auth.local/", Duration::from_millis(250))
            .expect("auth client");
        let url = join_segments(&auth.base, &["v1", "users", "u1"]).expect("join");
        assert_eq!(url.as_str(), "http://auth.local/v1/users/u1");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_an_error_not_a_denial() {
        let client = HttpCaseClient::new("http://127.0.0.1:9", Duration::from_secs(2)).expect("client");
        let result = client.user_owns_case("u1", "c1").await;
        assert!(result.is_err());
    }
}
