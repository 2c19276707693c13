//! External HTTP collaborators: private-channel authorization and user
//! liveness checks.
//!
//! Both calls are form-encoded POSTs with a hard per-attempt timeout.
//! Authorization is fail-closed: exhausting attempts without a 200 is a
//! denial. The liveness check is the opposite: any failure means "unknown,
//! try again next cycle", never "all inactive".

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::WebConfig;

/// Liveness-check failures. The sweep keeps its pending set intact and
/// retries on the next cycle.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No liveness endpoint configured.
    #[error("No liveness endpoint configured")]
    NotConfigured,

    /// Transport failure or timeout.
    #[error("Liveness request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Endpoint answered with a non-200 status.
    #[error("Liveness endpoint returned status {0}")]
    Status(u16),

    /// Endpoint body was not a JSON array of usernames.
    #[error("Malformed liveness response: {0}")]
    Malformed(String),
}

/// External authorization and liveness collaborators.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Ask the external endpoint whether `user` may subscribe to the
    /// private `channel`. `Some` carries the opaque channel info from the
    /// 200 response body; `None` is a denial (fail-closed).
    async fn authorize_channel(&self, project: &str, user: &str, channel: &str) -> Option<Value>;

    /// Ask the external endpoint which of `users` are inactive. A failure
    /// leaves liveness unknown.
    async fn check_users(&self, project: &str, users: &[String])
        -> Result<Vec<String>, AuthError>;
}

/// HTTP-backed [`Authorizer`] with per-project bounded back-off.
pub struct HttpAuthorizer {
    http: reqwest::Client,
    auth_endpoint: Option<String>,
    liveness_endpoint: Option<String>,
    max_attempts: u32,
    max_backoff: Duration,
    /// Consecutive authorization failures per project. Reset to zero on
    /// any success.
    failures: DashMap<String, u32>,
}

impl HttpAuthorizer {
    /// Build an authorizer from the web collaborator configuration.
    #[must_use]
    pub fn new(config: &WebConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_default();

        Self {
            http,
            auth_endpoint: config.auth_endpoint.clone(),
            liveness_endpoint: config.liveness_endpoint.clone(),
            max_attempts: config.max_auth_attempts.max(1),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            failures: DashMap::new(),
        }
    }

    /// Escalating delay for the project's current failure streak, capped
    /// at the configured maximum.
    fn backoff_delay(&self, project: &str) -> Duration {
        let streak = self.failures.get(project).map(|f| *f).unwrap_or(0);
        if streak == 0 {
            return Duration::ZERO;
        }
        let millis = 100u64.saturating_mul(1 << streak.min(16));
        Duration::from_millis(millis).min(self.max_backoff)
    }

    fn record_failure(&self, project: &str) {
        *self.failures.entry(project.to_string()).or_insert(0) += 1;
    }

    fn record_success(&self, project: &str) {
        self.failures.remove(project);
    }
}

#[async_trait]
impl Authorizer for HttpAuthorizer {
    async fn authorize_channel(&self, project: &str, user: &str, channel: &str) -> Option<Value> {
        let Some(endpoint) = &self.auth_endpoint else {
            warn!(channel = %channel, "No authorization endpoint, denying private channel");
            return None;
        };

        for attempt in 0..self.max_attempts {
            let delay = self.backoff_delay(project);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let result = self
                .http
                .post(endpoint)
                .form(&[("user", user), ("channel", channel)])
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    self.record_success(project);
                    // Empty or non-JSON bodies are treated as an empty
                    // info blob, not a denial.
                    let info = response.json::<Value>().await.unwrap_or(Value::Null);
                    return Some(info);
                }
                Ok(response) => {
                    debug!(
                        channel = %channel,
                        status = %response.status(),
                        attempt,
                        "Authorization denied"
                    );
                    self.record_failure(project);
                }
                Err(e) => {
                    debug!(channel = %channel, error = %e, attempt, "Authorization unreachable");
                    self.record_failure(project);
                }
            }
        }

        warn!(channel = %channel, user = %user, "Authorization attempts exhausted, denying");
        None
    }

    async fn check_users(
        &self,
        project: &str,
        users: &[String],
    ) -> Result<Vec<String>, AuthError> {
        let Some(endpoint) = &self.liveness_endpoint else {
            return Err(AuthError::NotConfigured);
        };

        let users_json = serde_json::to_string(users)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;

        let response = self
            .http
            .post(endpoint)
            .form(&[("project", project), ("users", &users_json)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthError::Status(response.status().as_u16()));
        }

        let body: Value = response.json().await?;
        let Some(items) = body.as_array() else {
            return Err(AuthError::Malformed("expected a JSON array".into()));
        };
        Ok(items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect())
    }
}

/// Post-publish webhook: POSTs every published message envelope to an
/// external endpoint. Failures are logged by the coordinator and never
/// fail the publish.
pub struct PublishWebhook {
    http: reqwest::Client,
    endpoint: String,
}

impl PublishWebhook {
    /// Build a webhook notifier for an endpoint.
    #[must_use]
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { http, endpoint }
    }
}

#[async_trait]
impl crate::node::PublishNotifier for PublishWebhook {
    async fn notify(&self, message: &vortex_core::Message) -> anyhow::Result<()> {
        self.http
            .post(&self.endpoint)
            .json(message)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_auth_denies() {
        let auth = HttpAuthorizer::new(&WebConfig::default());
        assert!(auth.authorize_channel("p", "alice", "$private").await.is_none());
    }

    #[tokio::test]
    async fn test_unconfigured_liveness_is_unknown() {
        let auth = HttpAuthorizer::new(&WebConfig::default());
        let result = auth.check_users("p", &["alice".into()]).await;
        assert!(matches!(result, Err(AuthError::NotConfigured)));
    }

    #[test]
    fn test_backoff_escalates_and_caps() {
        let auth = HttpAuthorizer::new(&WebConfig {
            max_backoff_ms: 1_000,
            ..WebConfig::default()
        });

        assert_eq!(auth.backoff_delay("p"), Duration::ZERO);

        auth.record_failure("p");
        let first = auth.backoff_delay("p");
        auth.record_failure("p");
        let second = auth.backoff_delay("p");
        assert!(second > first);

        for _ in 0..20 {
            auth.record_failure("p");
        }
        assert_eq!(auth.backoff_delay("p"), Duration::from_millis(1_000));

        auth.record_success("p");
        assert_eq!(auth.backoff_delay("p"), Duration::ZERO);
    }
}
