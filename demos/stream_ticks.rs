use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::stream::{self, Stream};
use terminal_rpc::{
    pump, CancellationToken, ConnectionEndpoint, ConnectionSession, RemoteAccount, Result,
    RpcError, SessionOptions, StatusCode, Subscription,
};

/// In-memory account whose tick stream drops every few ticks.
struct PaperAccount {
    ticks_sent: AtomicU64,
}

impl PaperAccount {
    fn ticks(&self, symbol: &'static str) -> impl Stream<Item = Result<(String, f64)>> + '_ {
        stream::unfold(0u32, move |n| async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            if n == 5 {
                return Some((
                    Err(RpcError::remote(StatusCode::Unavailable, "quote feed reset")),
                    n + 1,
                ));
            }
            let seq = self.ticks_sent.fetch_add(1, Ordering::SeqCst);
            Some((Ok((symbol.to_owned(), 1.0850 + seq as f64 * 0.0001)), n + 1))
        })
    }

    async fn order_send(&self, volume: f64) -> Result<u64> {
        if volume <= 0.0 {
            return Err(RpcError::remote(StatusCode::InvalidArgument, "invalid volume"));
        }
        Ok(1_000 + self.ticks_sent.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl RemoteAccount for PaperAccount {
    async fn connect_by_name(
        &self,
        account_id: u64,
        _credential: &str,
        server_name: &str,
        _cancel: CancellationToken,
    ) -> Result<()> {
        println!("login {account_id} @ {server_name}");
        Ok(())
    }

    async fn connect_by_address(
        &self,
        account_id: u64,
        _credential: &str,
        host: &str,
        port: u16,
        _cancel: CancellationToken,
    ) -> Result<()> {
        println!("login {account_id} @ {host}:{port}");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        println!("logout");
        Ok(())
    }
}

struct PrintTicks;

#[async_trait]
impl Subscription<PaperAccount> for PrintTicks {
    async fn consume(
        &mut self,
        account: Arc<PaperAccount>,
        cancel: CancellationToken,
    ) -> Result<()> {
        pump(account.ticks("EURUSD"), &cancel, |(symbol, bid)| {
            println!("{symbol} {bid:.5}");
            Ok(())
        })
        .await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = SessionOptions::from_json(
        r#"{"timeout_ms": 3000, "stream": {"initial_backoff_ms": 250}}"#,
    )?;
    let endpoint = ConnectionEndpoint::by_server(5_001_234, "demo-password", "Broker-Demo");
    let clock = options.clock();
    let cancel = CancellationToken::new();

    let mut session = ConnectionSession::new(|_: &ConnectionEndpoint| {
        Ok::<_, RpcError>(PaperAccount {
            ticks_sent: AtomicU64::new(0),
        })
    });
    session.ensure_connected(&endpoint, &clock, &cancel).await?;

    let ticket = terminal_rpc::RetryExecutor::new(clock)
        .execute(&options.retry_policy(), &cancel, |_| {
            let account = session.account();
            async move { account?.order_send(0.1).await }
        })
        .await?;
    println!("order placed, ticket {ticket}");

    options
        .stream_runner()
        .run(
            &mut session,
            &endpoint,
            &clock,
            &mut PrintTicks,
            Duration::from_secs(3),
            &cancel,
        )
        .await?;

    session.disconnect(&clock, &cancel).await;
    Ok(())
}
