use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    clock::run_bounded, AccountFactory, ConnectAddress, ConnectionEndpoint, OperationClock,
    RemoteAccount, Result, RpcError,
};

/// Lifecycle state of a [`ConnectionSession`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live connection. The account object, if any, may be reused.
    Disconnected,
    /// A connect call is in flight.
    Connecting,
    /// Logged in to the given endpoint.
    Connected(ConnectionEndpoint),
}

/// Owns the connection to the remote account.
///
/// The account object is rebuilt whenever the endpoint changes, so a client
/// created for one set of credentials is never reused for another. Callers
/// reach the account only through [`ConnectionSession::account`] and must
/// fetch it again after every reconnect.
pub struct ConnectionSession<F: AccountFactory> {
    factory: F,
    account: Option<Arc<F::Account>>,
    built_for: Option<ConnectionEndpoint>,
    state: ConnectionState,
    generation: u64,
}

impl<F: AccountFactory> fmt::Debug for ConnectionSession<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("has_account", &self.account.is_some())
            .finish()
    }
}

impl<F: AccountFactory> ConnectionSession<F> {
    /// Creates a disconnected session that builds accounts with `factory`.
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            account: None,
            built_for: None,
            state: ConnectionState::Disconnected,
            generation: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// `true` while connected.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected(_))
    }

    /// Number of account objects built so far.
    ///
    /// Changes every time the endpoint changes; handles obtained under an
    /// older generation are stale.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the live account, or [`RpcError::NotConnected`].
    pub fn account(&self) -> Result<Arc<F::Account>> {
        match (&self.state, &self.account) {
            (ConnectionState::Connected(_), Some(account)) => Ok(Arc::clone(account)),
            _ => Err(RpcError::NotConnected),
        }
    }

    /// Makes sure the session is connected to `endpoint`.
    ///
    /// No-op when already connected to an equal endpoint. Endpoint data is
    /// validated before any network call. The connect call is bounded by the
    /// timeout `clock` resolves; on failure the half-open account is torn
    /// down and the session is left disconnected.
    pub async fn ensure_connected(
        &mut self,
        endpoint: &ConnectionEndpoint,
        clock: &OperationClock,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let ConnectionState::Connected(current) = &self.state {
            if current == endpoint {
                return Ok(());
            }
        }

        endpoint.address()?;
        let account = self.account_for(endpoint, clock, cancel).await?;
        let address = endpoint.resolve(account.capabilities())?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            account_id = endpoint.account_id,
            address = %address,
            generation = self.generation,
            "connecting"
        );

        self.state = ConnectionState::Connecting;
        let timeout = clock.resolve_timeout();
        let scope = cancel.child_token();
        let connect = {
            let scope = scope.clone();
            let account = Arc::clone(&account);
            let credential = endpoint.credential.clone();
            let account_id = endpoint.account_id;
            async move {
                match &address {
                    ConnectAddress::Server(name) => {
                        account
                            .connect_by_name(account_id, &credential, name, scope)
                            .await
                    }
                    ConnectAddress::Host { host, port } => {
                        account
                            .connect_by_address(account_id, &credential, host, *port, scope)
                            .await
                    }
                }
            }
        };

        match run_bounded(timeout, cancel, scope, connect).await {
            Ok(()) => {
                self.state = ConnectionState::Connected(endpoint.clone());
                #[cfg(feature = "tracing")]
                tracing::info!(account_id = endpoint.account_id, "connected");
                Ok(())
            }
            Err(err) => {
                self.state = ConnectionState::Disconnected;
                #[cfg(feature = "tracing")]
                tracing::warn!(account_id = endpoint.account_id, error = %err, "connect failed");
                disconnect_quietly(account.as_ref(), clock, cancel).await;
                Err(err)
            }
        }
    }

    /// Disconnects, best effort.
    ///
    /// Failures and timeouts are logged and swallowed, and `cancel` cuts the
    /// wait short. Calling this while disconnected does nothing.
    pub async fn disconnect(&mut self, clock: &OperationClock, cancel: &CancellationToken) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.state = ConnectionState::Disconnected;
        if let Some(account) = &self.account {
            disconnect_quietly(account.as_ref(), clock, cancel).await;
        }
    }

    /// Returns the account object for `endpoint`, rebuilding it when the
    /// current one was made for a different endpoint.
    async fn account_for(
        &mut self,
        endpoint: &ConnectionEndpoint,
        clock: &OperationClock,
        cancel: &CancellationToken,
    ) -> Result<Arc<F::Account>> {
        if let (Some(account), Some(built_for)) = (&self.account, &self.built_for) {
            if built_for == endpoint {
                return Ok(Arc::clone(account));
            }
        }

        if let Some(stale) = self.account.take() {
            #[cfg(feature = "tracing")]
            tracing::info!(
                generation = self.generation,
                "endpoint changed, rebuilding account"
            );
            if self.state != ConnectionState::Disconnected {
                disconnect_quietly(stale.as_ref(), clock, cancel).await;
            }
        }
        self.state = ConnectionState::Disconnected;
        self.built_for = None;

        let account = Arc::new(self.factory.create(endpoint)?);
        self.account = Some(Arc::clone(&account));
        self.built_for = Some(endpoint.clone());
        self.generation += 1;
        Ok(account)
    }
}

/// Best-effort teardown. The disconnect call is polled before `cancel` so a
/// prompt account is still closed after the caller gave up.
async fn disconnect_quietly<A: RemoteAccount>(
    account: &A,
    clock: &OperationClock,
    cancel: &CancellationToken,
) {
    let timeout = clock.resolve_timeout();
    tokio::select! {
        biased;
        outcome = tokio::time::timeout(timeout, account.disconnect()) => match outcome {
            Ok(Ok(())) => {}
            Ok(Err(_err)) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_err, "disconnect failed");
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "disconnect timed out");
            }
        },
        _ = cancel.cancelled() => {
            #[cfg(feature = "tracing")]
            tracing::debug!("disconnect abandoned on cancel");
        }
    }
}
