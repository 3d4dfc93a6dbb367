use super::HostCursor;
use crate::client::ClientConfig;
use crate::infrastructure::Timer;
use crate::types::FailureKind;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of a failed connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again against `host` after `delay`.
    Retry { host: String, delay: Duration },
    /// Give up; the connection goes to `failed`.
    Fail,
}

/// Decides where and when the next connection attempt happens.
///
/// Host-level failures advance the fallback cursor and wait the
/// disconnected retry timeout. Credential failures stay on the same host and
/// back off through the credential intervals until the retry limit is hit.
#[derive(Debug)]
pub struct RetryScheduler {
    cursor: HostCursor,
    credential_backoff: Timer,
    credential_failures: u32,
    credential_retry_limit: u32,
    disconnected_retry_timeout: Duration,
    suspended_retry_timeout: Duration,
}

impl RetryScheduler {
    pub fn new(cursor: HostCursor, config: &ClientConfig) -> Self {
        Self {
            cursor,
            credential_backoff: Timer::default(),
            credential_failures: 0,
            credential_retry_limit: config.credential_retry_limit,
            disconnected_retry_timeout: config.disconnected_retry_timeout,
            suspended_retry_timeout: config.suspended_retry_timeout,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        let cursor = HostCursor::new(
            config.realtime_host.clone(),
            config.fallback_hosts.clone(),
            config.fallback_retry_timeout,
        );
        Self::new(cursor, config)
    }

    /// Host for the first attempt of a new reconnect cycle.
    pub fn begin_cycle(&mut self, now: Instant) -> String {
        self.cursor.begin_cycle(now).to_string()
    }

    pub fn current_host(&self) -> &str {
        self.cursor.current()
    }

    pub fn cursor(&self) -> &HostCursor {
        &self.cursor
    }

    pub fn on_connected(&mut self, now: Instant) {
        let host = self.cursor.current().to_string();
        self.cursor.record_success(&host, now);
        self.credential_backoff.reset();
        self.credential_failures = 0;
    }

    /// Decides the next attempt after a failed one.
    pub fn on_failure(&mut self, kind: FailureKind) -> RetryDecision {
        match kind {
            FailureKind::Host | FailureKind::Cancelled => {
                let exhausted = self.cursor.is_exhausted();
                let host = self.cursor.advance().to_string();
                if exhausted {
                    tracing::warn!(
                        "All {} hosts failed; wrapping around to {}",
                        self.cursor.len(),
                        host
                    );
                } else {
                    tracing::info!("Falling back to host {}", host);
                }
                RetryDecision::Retry {
                    host,
                    delay: self.disconnected_retry_timeout,
                }
            }
            FailureKind::Credential => {
                self.credential_failures += 1;
                if self.credential_failures >= self.credential_retry_limit {
                    tracing::warn!(
                        "Credential retry limit ({}) reached",
                        self.credential_retry_limit
                    );
                    return RetryDecision::Fail;
                }
                let delay = self.credential_backoff.next_delay();
                tracing::info!(
                    "Credential failure {} of {}; retrying in {:?}",
                    self.credential_failures,
                    self.credential_retry_limit,
                    delay
                );
                RetryDecision::Retry {
                    host: self.cursor.current().to_string(),
                    delay,
                }
            }
            FailureKind::Fatal => RetryDecision::Fail,
        }
    }

    /// Records a credential failure observed outside an attempt (e.g. a token
    /// expiring on a live connection). Returns `false` once the limit is hit.
    pub fn note_credential_failure(&mut self) -> bool {
        self.credential_failures += 1;
        self.credential_failures < self.credential_retry_limit
    }

    pub fn disconnected_retry_timeout(&self) -> Duration {
        self.disconnected_retry_timeout
    }

    pub fn suspended_retry_timeout(&self) -> Duration {
        self.suspended_retry_timeout
    }
}
