use std::fmt;

use serde::Deserialize;

use crate::{Capabilities, Result, RpcError};

/// Identifies which remote account to connect to and through what.
///
/// Two endpoints are equal when account id, credential and resolved
/// address are equal.
#[derive(Clone, Deserialize)]
pub struct ConnectionEndpoint {
    /// Trading account number.
    #[serde(alias = "Account", alias = "Login")]
    pub account_id: u64,
    /// Account password.
    #[serde(alias = "Password")]
    pub credential: String,
    /// Named trade server. Takes precedence over `host`/`port`.
    #[serde(default, alias = "ServerName")]
    pub server_name: Option<String>,
    /// Gateway host, used when no server name is set.
    #[serde(default, alias = "Host")]
    pub host: Option<String>,
    /// Gateway port, required with `host`.
    #[serde(default, alias = "Port")]
    pub port: Option<u16>,
}

/// Where a connect call goes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnectAddress {
    /// Connect by trade server name.
    Server(String),
    /// Connect by host and port.
    Host {
        /// Gateway host name or IP address.
        host: String,
        /// Gateway TCP port.
        port: u16,
    },
}

impl fmt::Display for ConnectAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(name) => write!(f, "server:{name}"),
            Self::Host { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

impl fmt::Debug for ConnectionEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEndpoint")
            .field("account_id", &self.account_id)
            .field("credential", &"<redacted>")
            .field("server_name", &self.server_name)
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl PartialEq for ConnectionEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.account_id == other.account_id
            && self.credential == other.credential
            && self.address_key() == other.address_key()
    }
}

impl Eq for ConnectionEndpoint {}

impl ConnectionEndpoint {
    /// Endpoint reached through a named trade server.
    pub fn by_server(
        account_id: u64,
        credential: impl Into<String>,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            credential: credential.into(),
            server_name: Some(server_name.into()),
            host: None,
            port: None,
        }
    }

    /// Endpoint reached through an explicit host and port.
    pub fn by_address(
        account_id: u64,
        credential: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            account_id,
            credential: credential.into(),
            server_name: None,
            host: Some(host.into()),
            port: Some(port),
        }
    }

    /// Reads the endpoint from environment variables.
    ///
    /// Reads:
    /// - `TERMINAL_ACCOUNT`: account number
    /// - `TERMINAL_PASSWORD`: account password
    /// - `TERMINAL_SERVER`: trade server name (optional)
    /// - `TERMINAL_HOST` / `TERMINAL_PORT`: gateway address (optional)
    pub fn from_env() -> Result<Self> {
        let account = std::env::var("TERMINAL_ACCOUNT").map_err(|_| {
            RpcError::Configuration("missing TERMINAL_ACCOUNT environment variable".to_owned())
        })?;
        let account_id = account.trim().parse::<u64>().map_err(|err| {
            RpcError::Configuration(format!("TERMINAL_ACCOUNT is not a number: {err}"))
        })?;
        let credential = std::env::var("TERMINAL_PASSWORD").map_err(|_| {
            RpcError::Configuration("missing TERMINAL_PASSWORD environment variable".to_owned())
        })?;
        let port = match non_empty_var("TERMINAL_PORT") {
            Some(port) => Some(port.trim().parse::<u16>().map_err(|err| {
                RpcError::Configuration(format!("TERMINAL_PORT is not a port number: {err}"))
            })?),
            None => None,
        };

        Ok(Self {
            account_id,
            credential,
            server_name: non_empty_var("TERMINAL_SERVER"),
            host: non_empty_var("TERMINAL_HOST"),
            port,
        })
    }

    /// Resolves where to connect, assuming both connect paths are available.
    pub fn address(&self) -> Result<ConnectAddress> {
        self.resolve(Capabilities::ALL)
    }

    /// Resolves where to connect given what the account supports.
    ///
    /// A server name wins when the account can connect by name; otherwise
    /// host and port are required.
    pub fn resolve(&self, capabilities: Capabilities) -> Result<ConnectAddress> {
        let server_name = trimmed(self.server_name.as_deref());
        let host = trimmed(self.host.as_deref());

        if server_name.is_none() && host.is_none() {
            return Err(RpcError::Configuration(
                "neither ServerName nor Host is set".to_owned(),
            ));
        }

        if let Some(name) = server_name {
            if capabilities.connect_by_name {
                return Ok(ConnectAddress::Server(name.to_owned()));
            }
        }

        match (host, self.port) {
            (Some(host), Some(port)) if capabilities.connect_by_address => {
                Ok(ConnectAddress::Host {
                    host: host.to_owned(),
                    port,
                })
            }
            (Some(_), Some(_)) => Err(RpcError::Configuration(
                "account cannot connect by address and no usable ServerName is set".to_owned(),
            )),
            (Some(_), None) => Err(RpcError::Configuration(
                "Host is set but Port is missing".to_owned(),
            )),
            (None, _) => Err(RpcError::Configuration(
                "account cannot connect by server name and Host is not set".to_owned(),
            )),
        }
    }

    fn address_key(&self) -> String {
        match self.address() {
            Ok(address) => address.to_string(),
            Err(_) => format!(
                "unresolved:{:?}:{:?}:{:?}",
                self.server_name, self.host, self.port
            ),
        }
    }
}

fn trimmed(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
