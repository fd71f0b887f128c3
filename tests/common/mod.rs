#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use terminal_rpc::{
    Capabilities, CancellationToken, ConnectionEndpoint, RemoteAccount, Result, RpcError,
    StatusCode,
};

/// Shared record of everything the mock accounts were asked to do.
#[derive(Default)]
pub struct Calls {
    pub built: AtomicUsize,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub orders: AtomicUsize,
    pub targets: Mutex<Vec<String>>,
    pub credentials: Mutex<Vec<String>>,
}

impl Calls {
    pub fn built(&self) -> usize {
        self.built.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn orders(&self) -> usize {
        self.orders.load(Ordering::SeqCst)
    }

    pub fn targets(&self) -> Vec<String> {
        self.targets
            .lock()
            .expect("targets mutex must not be poisoned")
            .clone()
    }
}

/// Behavior shared by every account a [`MockTerminal`] builds.
#[derive(Clone)]
pub struct MockTerminal {
    pub calls: Arc<Calls>,
    connect_results: Arc<Mutex<VecDeque<Result<()>>>>,
    connect_delay: Duration,
    disconnect_delay: Duration,
    capabilities: Capabilities,
    fail_disconnect: bool,
    order_failures: Arc<AtomicUsize>,
}

impl Default for MockTerminal {
    fn default() -> Self {
        Self {
            calls: Arc::new(Calls::default()),
            connect_results: Arc::new(Mutex::new(VecDeque::new())),
            connect_delay: Duration::ZERO,
            disconnect_delay: Duration::ZERO,
            capabilities: Capabilities::ALL,
            fail_disconnect: false,
            order_failures: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MockTerminal {
    /// Queues connect outcomes; once drained, connects succeed.
    pub fn with_connect_results(self, results: Vec<Result<()>>) -> Self {
        *self
            .connect_results
            .lock()
            .expect("connect queue mutex must not be poisoned") = results.into();
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Makes `disconnect` hang for `delay`, ignoring cancellation.
    pub fn with_disconnect_delay(mut self, delay: Duration) -> Self {
        self.disconnect_delay = delay;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_failing_disconnect(mut self) -> Self {
        self.fail_disconnect = true;
        self
    }

    /// Number of `order_send` calls that fail with UNAVAILABLE before one
    /// succeeds.
    pub fn with_order_failures(self, failures: usize) -> Self {
        self.order_failures.store(failures, Ordering::SeqCst);
        self
    }

    /// Factory closure for [`terminal_rpc::ConnectionSession::new`].
    pub fn factory(&self) -> impl Fn(&ConnectionEndpoint) -> Result<MockAccount> + Send + Sync {
        let terminal = self.clone();
        move |_: &ConnectionEndpoint| {
            let generation = terminal.calls.built.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(MockAccount {
                terminal: terminal.clone(),
                generation,
            })
        }
    }
}

pub struct MockAccount {
    terminal: MockTerminal,
    pub generation: usize,
}

impl MockAccount {
    /// Unary call standing in for an order submission.
    pub async fn order_send(&self, volume: f64, cancel: CancellationToken) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(RpcError::Cancelled);
        }
        self.terminal.calls.orders.fetch_add(1, Ordering::SeqCst);
        let remaining = self.terminal.order_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.terminal
                .order_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(RpcError::remote(StatusCode::Unavailable, "trade server busy"));
        }
        if volume <= 0.0 {
            return Err(RpcError::remote(StatusCode::InvalidArgument, "invalid volume"));
        }
        Ok(700_000 + self.generation as u64)
    }

    async fn connect(
        &self,
        target: String,
        credential: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.terminal.calls.connects.fetch_add(1, Ordering::SeqCst);
        self.terminal
            .calls
            .targets
            .lock()
            .expect("targets mutex must not be poisoned")
            .push(target);
        self.terminal
            .calls
            .credentials
            .lock()
            .expect("credentials mutex must not be poisoned")
            .push(credential.to_owned());

        if !self.terminal.connect_delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(RpcError::Cancelled),
                _ = tokio::time::sleep(self.terminal.connect_delay) => {}
            }
        }

        self.terminal
            .connect_results
            .lock()
            .expect("connect queue mutex must not be poisoned")
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

#[async_trait]
impl RemoteAccount for MockAccount {
    fn capabilities(&self) -> Capabilities {
        self.terminal.capabilities
    }

    async fn connect_by_name(
        &self,
        _account_id: u64,
        credential: &str,
        server_name: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.connect(format!("name:{server_name}"), credential, cancel)
            .await
    }

    async fn connect_by_address(
        &self,
        _account_id: u64,
        credential: &str,
        host: &str,
        port: u16,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.connect(format!("addr:{host}:{port}"), credential, cancel)
            .await
    }

    async fn disconnect(&self) -> Result<()> {
        self.terminal.calls.disconnects.fetch_add(1, Ordering::SeqCst);
        if !self.terminal.disconnect_delay.is_zero() {
            tokio::time::sleep(self.terminal.disconnect_delay).await;
        }
        if self.terminal.fail_disconnect {
            return Err(RpcError::remote(StatusCode::Internal, "socket already closed"));
        }
        Ok(())
    }
}

pub fn demo_endpoint() -> ConnectionEndpoint {
    ConnectionEndpoint::by_server(5_001_234, "demo-password", "Broker-Demo")
}

pub fn unavailable(message: &str) -> RpcError {
    RpcError::remote(StatusCode::Unavailable, message)
}
