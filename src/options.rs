use std::time::Duration;

use serde::Deserialize;

use crate::{
    OperationClock, ReconnectingStreamRunner, Result, RetryPolicy, RpcError, StreamBackoff,
};

/// Timeout, retry and reconnect settings, as read from a profile.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Process-wide default timeout per remote call, in milliseconds.
    pub timeout_ms: u64,
    /// Retry behavior for unary calls.
    pub retry: RetryOptions,
    /// Reconnect behavior for streams.
    pub stream: StreamOptions,
}

/// Retry settings for unary calls.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base retry backoff in milliseconds (exponential strategy).
    pub base_delay_ms: u64,
    /// Cap of the backoff in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter half-width in milliseconds.
    pub jitter_ms: u64,
}

/// Reconnect settings for streams.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    /// Wait after the first stream failure, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Cap of the doubled wait, in milliseconds.
    pub max_backoff_ms: u64,
    /// Jitter half-width in milliseconds.
    pub jitter_ms: u64,
    /// Time a cancelled consumer gets to return, in milliseconds.
    pub grace_ms: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retry: RetryOptions::default(),
            stream: StreamOptions::default(),
        }
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 400,
            max_delay_ms: 10_000,
            jitter_ms: 200,
        }
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 10_000,
            jitter_ms: 200,
            grace_ms: 2_000,
        }
    }
}

impl SessionOptions {
    /// Parses options from a JSON profile. Missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|err| RpcError::Configuration(format!("invalid session options: {err}")))
    }

    /// Defaults, with overrides from the environment.
    ///
    /// Reads:
    /// - `TERMINAL_RPC_TIMEOUT_MS`: default per-call timeout
    /// - `TERMINAL_RPC_MAX_ATTEMPTS`: retry attempts for unary calls
    pub fn from_env() -> Result<Self> {
        let mut options = Self::default();
        if let Some(timeout_ms) = env_number("TERMINAL_RPC_TIMEOUT_MS")? {
            options.timeout_ms = timeout_ms;
        }
        if let Some(max_attempts) = env_number("TERMINAL_RPC_MAX_ATTEMPTS")? {
            options.retry.max_attempts = u32::try_from(max_attempts).map_err(|_| {
                RpcError::Configuration("TERMINAL_RPC_MAX_ATTEMPTS is too large".to_owned())
            })?;
        }
        Ok(options)
    }

    /// Clock with `timeout_ms` as process default.
    pub fn clock(&self) -> OperationClock {
        OperationClock::new(Duration::from_millis(self.timeout_ms))
    }

    /// Retry policy with the default transient classifier.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.max_attempts)
            .with_delays(
                Duration::from_millis(self.retry.base_delay_ms),
                Duration::from_millis(self.retry.max_delay_ms),
            )
            .with_jitter(Duration::from_millis(self.retry.jitter_ms))
    }

    /// Stream runner with the default fatal classifier.
    pub fn stream_runner(&self) -> ReconnectingStreamRunner {
        ReconnectingStreamRunner::new(StreamBackoff {
            initial: Duration::from_millis(self.stream.initial_backoff_ms),
            max: Duration::from_millis(self.stream.max_backoff_ms),
            jitter: Duration::from_millis(self.stream.jitter_ms),
            grace: Duration::from_millis(self.stream.grace_ms),
        })
    }
}

fn env_number(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|err| RpcError::Configuration(format!("{name} is not a number: {err}"))),
        _ => Ok(None),
    }
}
