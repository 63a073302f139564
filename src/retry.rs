//! Retry scheduling for transport operations.
//!
//! The engine only asks a [`RetryPolicy`] whether a failure is worth another
//! attempt and how long to wait; backoff curves live in the policy.

use crate::config::RetryConfig;
use crate::metrics::MetricsSink;
use crate::pool::PooledSession;
use anyhow::Result;
use futures::future::BoxFuture;
use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    List,
    Upload,
    Download,
    Command,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Upload => "upload",
            Self::Download => "download",
            Self::Command => "command",
        }
    }
}

pub trait RetryPolicy: Send + Sync {
    /// `Some(delay)` to try again after `delay`, `None` to give up.
    /// `attempt` counts failures so far, starting at 1.
    fn next_delay(&self, kind: OperationKind, attempt: u32, error: &anyhow::Error) -> Option<Duration>;
}

/// Never retries.
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn next_delay(&self, _: OperationKind, _: u32, _: &anyhow::Error) -> Option<Duration> {
        None
    }
}

/// Retries transient failures with exponential backoff.
pub struct ClassifyingRetryPolicy {
    config: RetryConfig,
}

impl ClassifyingRetryPolicy {
    pub const fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl RetryPolicy for ClassifyingRetryPolicy {
    fn next_delay(&self, _kind: OperationKind, attempt: u32, error: &anyhow::Error) -> Option<Duration> {
        if attempt >= self.config.max_attempts || failure_reason(error).is_none() {
            return None;
        }
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        Some(
            self.config
                .base_delay
                .saturating_mul(factor)
                .min(self.config.max_delay),
        )
    }
}

/// Names the transient condition behind `error`, or `None` when it is terminal.
pub fn failure_reason(error: &anyhow::Error) -> Option<&'static str> {
    for cause in error.chain() {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return match io_err.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Some("timeout"),
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof => Some("connection_dropped"),
                _ => None,
            };
        }
    }

    let text = error.to_string().to_ascii_lowercase();
    let code = reply_code(&text);
    match code {
        Some(421) => Some("service_unavailable"),
        Some(425 | 426) => Some("data_channel"),
        Some(450 | 451) => Some("server_busy"),
        _ if text.contains("timed out") || text.contains("timeout") => Some("timeout"),
        _ if text.contains("connection reset") || text.contains("broken pipe") => {
            Some("connection_dropped")
        }
        _ => None,
    }
}

/// First three-digit FTP reply code found in a message.
fn reply_code(text: &str) -> Option<u32> {
    text.split(|c: char| !c.is_ascii_digit())
        .filter(|token| token.len() == 3)
        .filter_map(|token| token.parse::<u32>().ok())
        .find(|code| (100..600).contains(code))
}

pub struct RetryScheduler {
    policy: Arc<dyn RetryPolicy>,
    metrics: Arc<dyn MetricsSink>,
}

impl RetryScheduler {
    pub fn new(policy: Arc<dyn RetryPolicy>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { policy, metrics }
    }

    pub fn from_config(enabled: bool, config: &RetryConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        let policy: Arc<dyn RetryPolicy> = if enabled {
            Arc::new(ClassifyingRetryPolicy::new(config.clone()))
        } else {
            Arc::new(NoRetry)
        };
        Self::new(policy, metrics)
    }

    /// Runs `op` against `session` until it succeeds or the policy gives up.
    pub async fn execute<T, F>(
        &self,
        kind: OperationKind,
        key: &str,
        session: &mut PooledSession,
        mut op: F,
    ) -> Result<T>
    where
        T: Send,
        F: for<'s> FnMut(&'s mut PooledSession) -> BoxFuture<'s, Result<T>> + Send,
    {
        let mut attempt = 0;
        loop {
            match op(session).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    let Some(delay) = self.policy.next_delay(kind, attempt, &e) else {
                        return Err(e);
                    };
                    let reason = failure_reason(&e).unwrap_or("policy");
                    warn!(
                        operation = kind.as_str(),
                        key,
                        attempt,
                        reason,
                        "transient failure, retrying in {:?}: {:#}",
                        delay,
                        e
                    );
                    self.metrics.retry(kind.as_str(), reason);
                    tokio::time::sleep(delay).await;
                    debug!(operation = kind.as_str(), key, attempt, "retrying");
                }
            }
        }
    }
}
