//! Long-lived subscriptions that survive transport failures.
//!
//! [`ReconnectingStreamRunner::run`] keeps a [`Subscription`] alive for a
//! bounded window. When the subscription fails it tears the connection
//! down, reconnects through the [`ConnectionSession`], backs off and
//! resubscribes, until the window closes or the caller cancels. Reaching
//! the end of the window is a normal outcome, not an error.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::with_jitter, AccountFactory, ConnectionEndpoint, ConnectionSession, OperationClock,
    RemoteAccount, Result, RpcError, StatusCode,
};

/// Absolute end of a streaming window plus the caller's cancellation.
#[derive(Clone, Debug)]
pub struct StreamDeadline {
    expiry: Instant,
    cancel: CancellationToken,
}

impl StreamDeadline {
    /// Window that ends `duration` from now or when `cancel` fires.
    pub fn after(duration: Duration, cancel: CancellationToken) -> Self {
        Self {
            expiry: Instant::now() + duration,
            cancel,
        }
    }

    /// Instant the window closes.
    pub fn expiry(&self) -> Instant {
        self.expiry
    }

    /// The caller's cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Time left in the window; zero once it has closed.
    pub fn remaining(&self) -> Duration {
        self.expiry.saturating_duration_since(Instant::now())
    }

    /// `true` once the window has closed or the caller cancelled.
    pub fn is_over(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.expiry
    }

    /// Resolves when the window closes or the caller cancels.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = sleep_until(self.expiry) => {}
        }
    }
}

/// A resubscribable stream consumer.
///
/// `consume` runs until `cancel` fires (returning `Ok`) or the stream fails.
/// Every call starts a fresh subscription; a stream is never resumed.
#[async_trait]
pub trait Subscription<A: RemoteAccount>: Send {
    /// Preparation before subscribing, such as selecting a symbol.
    ///
    /// Failures are logged by the runner and do not stop the attempt.
    async fn prepare(&mut self, _account: &A, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    /// Subscribes and consumes events until cancelled or failed.
    async fn consume(&mut self, account: Arc<A>, cancel: CancellationToken) -> Result<()>;
}

/// Runs several subscriptions side by side as one.
///
/// Members share one cancellation scope. The first member to fail cancels
/// the others, which get the drain grace (2 s by default) to return before
/// they are dropped; then that first error is reported.
pub struct SubscriptionBundle<A: RemoteAccount> {
    members: Vec<Box<dyn Subscription<A>>>,
    drain_grace: Duration,
}

impl<A: RemoteAccount> Default for SubscriptionBundle<A> {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            drain_grace: Duration::from_secs(2),
        }
    }
}

impl<A: RemoteAccount> fmt::Debug for SubscriptionBundle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionBundle")
            .field("members", &self.members.len())
            .field("drain_grace", &self.drain_grace)
            .finish()
    }
}

impl<A: RemoteAccount> SubscriptionBundle<A> {
    /// Empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a member.
    pub fn with(mut self, member: impl Subscription<A> + 'static) -> Self {
        self.members.push(Box::new(member));
        self
    }

    /// How long the other members get to return after one has failed.
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// `true` without members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[async_trait]
impl<A: RemoteAccount> Subscription<A> for SubscriptionBundle<A> {
    async fn prepare(&mut self, account: &A, cancel: &CancellationToken) -> Result<()> {
        let mut first_err = None;
        for member in &mut self.members {
            if let Err(err) = member.prepare(account, cancel).await {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn consume(&mut self, account: Arc<A>, cancel: CancellationToken) -> Result<()> {
        let drain_grace = self.drain_grace;
        let scope = cancel.child_token();
        let mut running: FuturesUnordered<_> = self
            .members
            .iter_mut()
            .map(|member| member.consume(Arc::clone(&account), scope.clone()))
            .collect();

        let mut first_err = None;
        while let Some(result) = running.next().await {
            if let Err(err) = result {
                first_err = Some(err);
                break;
            }
        }

        let Some(err) = first_err else {
            return Ok(());
        };
        scope.cancel();
        let drain = async { while running.next().await.is_some() {} };
        if tokio::time::timeout(drain_grace, drain).await.is_err() {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                pending = running.len(),
                "bundle members ignored cancellation, dropping them"
            );
        }
        Err(err)
    }
}

/// Feeds every item of `stream` to `handler`, in delivery order, until
/// `cancel` fires.
///
/// A stream that ends while `cancel` is still live was closed by the remote
/// side and is reported as [`StatusCode::Unavailable`].
pub async fn pump<S, T, H>(stream: S, cancel: &CancellationToken, mut handler: H) -> Result<()>
where
    S: Stream<Item = Result<T>>,
    H: FnMut(T) -> Result<()>,
{
    futures::pin_mut!(stream);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            item = stream.next() => match item {
                Some(Ok(item)) => handler(item)?,
                Some(Err(err)) => return Err(err),
                None if cancel.is_cancelled() => return Ok(()),
                None => {
                    return Err(RpcError::remote(
                        StatusCode::Unavailable,
                        "stream closed by remote",
                    ))
                }
            },
        }
    }
}

/// Delay schedule between reconnects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamBackoff {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Cap of the doubled delay.
    pub max: Duration,
    /// Half-width of the uniform jitter.
    pub jitter: Duration,
    /// How long a consumer gets to wind down after its scope is cancelled.
    pub grace: Duration,
}

impl Default for StreamBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            jitter: Duration::from_millis(200),
            grace: Duration::from_secs(2),
        }
    }
}

/// Predicate marking errors that end a streaming run instead of
/// reconnecting.
pub type FatalClassifier = Arc<dyn Fn(&RpcError) -> bool + Send + Sync>;

/// Errors no reconnect can fix: rejected credentials and bad endpoint data.
pub fn default_fatal(err: &RpcError) -> bool {
    matches!(err, RpcError::Configuration(_))
        || matches!(
            err.code(),
            Some(StatusCode::Unauthenticated | StatusCode::PermissionDenied)
        )
}

/// Keeps a subscription alive across reconnects for a bounded window.
#[derive(Clone)]
pub struct ReconnectingStreamRunner {
    backoff: StreamBackoff,
    fatal: FatalClassifier,
}

impl fmt::Debug for ReconnectingStreamRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectingStreamRunner")
            .field("backoff", &self.backoff)
            .field("fatal", &"<fn>")
            .finish()
    }
}

impl Default for ReconnectingStreamRunner {
    fn default() -> Self {
        Self::new(StreamBackoff::default())
    }
}

impl ReconnectingStreamRunner {
    /// Runner with the given backoff and [`default_fatal`].
    pub fn new(backoff: StreamBackoff) -> Self {
        Self {
            backoff,
            fatal: Arc::new(default_fatal),
        }
    }

    /// Replaces the fatal classifier.
    ///
    /// Pass `|_| false` to reconnect on every error until the window closes.
    pub fn with_fatal<F>(mut self, fatal: F) -> Self
    where
        F: Fn(&RpcError) -> bool + Send + Sync + 'static,
    {
        self.fatal = Arc::new(fatal);
        self
    }

    /// Backoff schedule in use.
    pub fn backoff(&self) -> &StreamBackoff {
        &self.backoff
    }

    /// Runs `subscription` for up to `duration`, or until `cancel` fires.
    ///
    /// Returns `Ok(())` when the window closes, the caller cancels, or the
    /// subscription completes on its own. Transient failures, failed
    /// preparations and failed reconnects are logged and retried with
    /// backoff; only errors the fatal classifier accepts are returned.
    pub async fn run<F, S>(
        &self,
        session: &mut ConnectionSession<F>,
        endpoint: &ConnectionEndpoint,
        clock: &OperationClock,
        subscription: &mut S,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        F: AccountFactory,
        S: Subscription<F::Account>,
    {
        let deadline = StreamDeadline::after(duration, cancel.clone());
        let mut delay = self.backoff.initial;
        let mut attempt = 0u32;

        if deadline.is_over() {
            return Ok(());
        }
        if let Some(outcome) = self.connect_within(session, endpoint, clock, &deadline).await {
            return outcome;
        }

        while !deadline.is_over() {
            attempt += 1;
            let err = match self
                .attempt(session, clock, subscription, &deadline)
                .await
            {
                Ok(()) => return Ok(()),
                Err(_) if deadline.is_over() => return Ok(()),
                Err(err) => err,
            };

            if (self.fatal)(&err) {
                #[cfg(feature = "tracing")]
                tracing::error!(attempt, error = %err, "stream failed permanently");
                return Err(err);
            }

            #[cfg(feature = "tracing")]
            {
                if err.is_transient() {
                    tracing::warn!(attempt, error = %err, "stream transport failure, reconnecting");
                } else {
                    tracing::warn!(attempt, error = %err, "stream failure, reconnecting");
                }
            }

            let reconnect_clock = bounded_by(clock, deadline.remaining());
            session.disconnect(&reconnect_clock, cancel).await;
            if let Some(outcome) = self.connect_within(session, endpoint, clock, &deadline).await {
                return outcome;
            }

            let wait = with_jitter(delay, self.backoff.jitter).min(deadline.remaining());
            #[cfg(feature = "tracing")]
            tracing::debug!(attempt, wait_ms = wait.as_millis() as u64, "backing off");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = sleep(wait) => {}
            }
            delay = delay.saturating_mul(2).min(self.backoff.max);
        }

        Ok(())
    }

    /// Connects `session` within what is left of the window.
    ///
    /// `Some` carries the outcome that ends the run; `None` means carry on,
    /// whether or not the connect succeeded.
    async fn connect_within<F: AccountFactory>(
        &self,
        session: &mut ConnectionSession<F>,
        endpoint: &ConnectionEndpoint,
        clock: &OperationClock,
        deadline: &StreamDeadline,
    ) -> Option<Result<()>> {
        let clock = bounded_by(clock, deadline.remaining());
        match session
            .ensure_connected(endpoint, &clock, deadline.cancel_token())
            .await
        {
            Ok(()) => None,
            Err(_) if deadline.is_over() => Some(Ok(())),
            Err(err) if (self.fatal)(&err) => {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %err, "connect failed permanently");
                Some(Err(err))
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_err, "connect failed");
                None
            }
        }
    }

    /// One subscribe-and-consume pass under a scope that closes with the
    /// window.
    async fn attempt<F, S>(
        &self,
        session: &ConnectionSession<F>,
        clock: &OperationClock,
        subscription: &mut S,
        deadline: &StreamDeadline,
    ) -> Result<()>
    where
        F: AccountFactory,
        S: Subscription<F::Account>,
    {
        let account = session.account()?;
        let scope = deadline.cancel_token().child_token();

        let prepare_timeout = clock.resolve_timeout().min(deadline.remaining());
        let prepare = tokio::time::timeout(prepare_timeout, subscription.prepare(&account, &scope));
        tokio::select! {
            outcome = prepare => match outcome {
                Ok(Ok(())) => {}
                Ok(Err(_err)) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %_err, "stream preparation failed, subscribing anyway");
                }
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        timeout_ms = prepare_timeout.as_millis() as u64,
                        "stream preparation timed out, subscribing anyway"
                    );
                }
            },
            _ = deadline.cancel_token().cancelled() => {
                scope.cancel();
                return Err(RpcError::Cancelled);
            }
        }

        let consume = subscription.consume(account, scope.clone());
        futures::pin_mut!(consume);
        let outcome = tokio::select! {
            result = &mut consume => result,
            _ = deadline.closed() => {
                scope.cancel();
                tokio::time::timeout(self.backoff.grace, &mut consume)
                    .await
                    .unwrap_or(Err(RpcError::Cancelled))
            }
        };
        scope.cancel();
        outcome
    }
}

fn bounded_by(clock: &OperationClock, remaining: Duration) -> OperationClock {
    if remaining < clock.resolve_timeout() {
        clock.with_override(remaining)
    } else {
        *clock
    }
}
