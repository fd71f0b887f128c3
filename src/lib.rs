//! `terminal-rpc` is the call policy layer between a trading CLI and a
//! remote trading-terminal account.
//!
//! The crate does not speak the terminal's protocol; it decides how calls
//! into a [`RemoteAccount`] are bounded, retried and reconnected:
//! - [`OperationClock`] resolves the timeout of a single call, with scoped
//!   overrides via [`TimeoutGuard`]
//! - [`RetryExecutor::execute`] retries transient failures with exponential
//!   backoff and jitter
//! - [`ConnectionSession`] owns the account object and its connection
//! - [`ReconnectingStreamRunner::run`] keeps subscriptions alive across
//!   transport failures for a bounded window

mod account;
mod backoff;
mod clock;
mod endpoint;
mod error;
mod options;
mod retry;
mod session;
mod stream;

pub use account::{AccountFactory, Capabilities, RemoteAccount};
pub use backoff::{exponential_delay, with_jitter};
pub use clock::{
    clamp_timeout, OperationClock, TimeoutGuard, DEFAULT_TIMEOUT, MAX_TIMEOUT, MIN_TIMEOUT,
};
pub use endpoint::{ConnectAddress, ConnectionEndpoint};
pub use error::{RpcError, StatusCode};
pub use options::{RetryOptions, SessionOptions, StreamOptions};
pub use retry::{CallContext, RetryExecutor, RetryPolicy, TransientClassifier};
pub use session::{ConnectionSession, ConnectionState};
pub use stream::{
    default_fatal, pump, FatalClassifier, ReconnectingStreamRunner, StreamBackoff, StreamDeadline,
    Subscription, SubscriptionBundle,
};

/// Re-exported so callers can build tokens without depending on
/// `tokio-util` directly.
pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, RpcError>;
