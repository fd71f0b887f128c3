//! Contract of the remote trading account this crate calls into.
//!
//! The account object speaks the terminal's wire protocol; this crate only
//! decides when and how to call it. Unary and streaming calls are whatever
//! the concrete account type exposes; the session needs connect and
//! disconnect only.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{ConnectionEndpoint, Result};

/// Connect paths a remote account implements.
///
/// Older gateway builds only know one of the two connect calls; the session
/// checks this instead of probing the account at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Capabilities {
    /// Supports [`RemoteAccount::connect_by_name`].
    pub connect_by_name: bool,
    /// Supports [`RemoteAccount::connect_by_address`].
    pub connect_by_address: bool,
}

impl Capabilities {
    /// Both connect paths.
    pub const ALL: Self = Self {
        connect_by_name: true,
        connect_by_address: true,
    };
    /// Connect by server name only.
    pub const NAME_ONLY: Self = Self {
        connect_by_name: true,
        connect_by_address: false,
    };
    /// Connect by host and port only.
    pub const ADDRESS_ONLY: Self = Self {
        connect_by_name: false,
        connect_by_address: true,
    };
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::ALL
    }
}

/// A remote trading account.
#[async_trait]
pub trait RemoteAccount: Send + Sync + 'static {
    /// Connect paths this account implements.
    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    /// Logs in through a named trade server.
    async fn connect_by_name(
        &self,
        account_id: u64,
        credential: &str,
        server_name: &str,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Logs in through an explicit host and port.
    async fn connect_by_address(
        &self,
        account_id: u64,
        credential: &str,
        host: &str,
        port: u16,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Closes the connection.
    async fn disconnect(&self) -> Result<()>;
}

/// Builds a fresh account object for an endpoint.
///
/// Any `Fn(&ConnectionEndpoint) -> Result<A>` closure is a factory.
pub trait AccountFactory: Send + Sync {
    /// Account type produced.
    type Account: RemoteAccount;

    /// Creates an unconnected account for `endpoint`.
    fn create(&self, endpoint: &ConnectionEndpoint) -> Result<Self::Account>;
}

impl<F, A> AccountFactory for F
where
    F: Fn(&ConnectionEndpoint) -> Result<A> + Send + Sync,
    A: RemoteAccount,
{
    type Account = A;

    fn create(&self, endpoint: &ConnectionEndpoint) -> Result<A> {
        self(endpoint)
    }
}
