//! Timeout resolution for single remote calls.
//!
//! [`OperationClock`] is a plain value that is threaded through the call
//! chain instead of living in shared mutable state. A caller narrows or
//! widens the timeout for a unit of work either by pushing a scoped
//! override (the returned [`TimeoutGuard`] restores the previous value when
//! dropped) or by handing a modified copy down with
//! [`OperationClock::with_override`].

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Result, RpcError};

/// Shortest override accepted; smaller requests are raised to this.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(100);
/// Longest override accepted; larger requests are lowered to this.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(120);
/// Process default used when no other default is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Clamps a requested override into `[MIN_TIMEOUT, MAX_TIMEOUT]`.
pub fn clamp_timeout(requested: Duration) -> Duration {
    requested.clamp(MIN_TIMEOUT, MAX_TIMEOUT)
}

/// Resolves the timeout for a single remote call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationClock {
    default: Duration,
    scoped: Option<Duration>,
}

impl Default for OperationClock {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl OperationClock {
    /// Creates a clock with the given process default and no override.
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            scoped: None,
        }
    }

    /// Returns the process default.
    pub fn default_timeout(&self) -> Duration {
        self.default
    }

    /// Returns the active override, if any.
    pub fn override_timeout(&self) -> Option<Duration> {
        self.scoped
    }

    /// Returns the override if one is active, else the process default.
    pub fn resolve_timeout(&self) -> Duration {
        self.scoped.unwrap_or(self.default)
    }

    /// Returns the instant at which a call started now must give up.
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.resolve_timeout()
    }

    /// Returns a copy of this clock with `timeout` (clamped) as override.
    ///
    /// Use this to pass an effective timeout down a call chain without
    /// touching the caller's clock.
    #[must_use]
    pub fn with_override(mut self, timeout: Duration) -> Self {
        self.scoped = Some(clamp_timeout(timeout));
        self
    }

    /// Installs `timeout` (clamped) as the override until the returned guard
    /// is dropped.
    ///
    /// Guards nest: pushing through a live guard shadows its value, and
    /// dropping the inner guard brings the outer value back. The guard holds
    /// the clock mutably, so releases always happen innermost first.
    pub fn push_override(&mut self, timeout: Duration) -> TimeoutGuard<'_> {
        let previous = self.scoped.replace(clamp_timeout(timeout));
        TimeoutGuard {
            clock: self,
            previous,
        }
    }
}

/// Scope of a timeout override. Restores the previous value on drop,
/// including when the scope is left through `?` or a panic.
#[derive(Debug)]
pub struct TimeoutGuard<'a> {
    clock: &'a mut OperationClock,
    previous: Option<Duration>,
}

impl TimeoutGuard<'_> {
    /// Ends the scope now.
    pub fn release(self) {}
}

impl Deref for TimeoutGuard<'_> {
    type Target = OperationClock;

    fn deref(&self) -> &OperationClock {
        self.clock
    }
}

impl DerefMut for TimeoutGuard<'_> {
    fn deref_mut(&mut self) -> &mut OperationClock {
        self.clock
    }
}

impl Drop for TimeoutGuard<'_> {
    fn drop(&mut self) {
        self.clock.scoped = self.previous;
    }
}

/// Drives `call` until it finishes, `timeout` elapses, or `cancel` fires.
///
/// `scope` is the token handed to the call; it is cancelled on every exit so
/// nothing the call spawned outlives it.
pub(crate) async fn run_bounded<T, Fut>(
    timeout: Duration,
    cancel: &CancellationToken,
    scope: CancellationToken,
    call: Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RpcError::Cancelled),
        result = tokio::time::timeout(timeout, call) => match result {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout(timeout)),
        },
    };
    scope.cancel();
    outcome
}
