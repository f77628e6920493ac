//! rpcbus CLI entry point

mod cli;

use crate::cli::{Cli, Commands};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::StreamExt;
use rpcbus::memory::MemoryBroker;
use rpcbus::{
    json_handler, Binding, BindingKind, Client, ClientConfig, ConnectionConfig, LinkState,
    Router, RpcError, Server, ServerConfig,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const REQUESTS: &str = "demo.requests";
const REPLIES: &str = "demo.replies";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = Settings {
        call_timeout: Duration::from_millis(cli.call_timeout_ms),
        retry_wait: Duration::from_millis(cli.retry_wait_ms),
        attempts: cli.attempts,
    };

    match cli.command {
        Commands::Demo {
            binding,
            calls,
            concurrency,
            handlers,
        } => demo(&settings, binding, calls, concurrency, handlers).await,
        Commands::Reconnect { binding, calls } => reconnect(&settings, binding, calls).await,
    }
}

struct Settings {
    call_timeout: Duration,
    retry_wait: Duration,
    attempts: u32,
}

impl Settings {
    fn connection(&self) -> ConnectionConfig {
        ConnectionConfig::new("memory://demo")
            .retry(self.retry_wait, self.attempts)
            .client_id("rpcbus-demo")
    }
}

fn binding(broker: &MemoryBroker, kind: BindingKind) -> Binding {
    match kind {
        BindingKind::Exchange => Binding::exchange(broker.clone()),
        BindingKind::Log => Binding::log(broker.clone()),
    }
}

fn demo_router() -> Router {
    Router::builder()
        .route("echo", json_handler(|value: Value| async move { Ok::<_, anyhow::Error>(value) }))
        .route(
            "sum",
            json_handler(|numbers: Vec<i64>| async move {
                Ok::<_, anyhow::Error>(numbers.iter().sum::<i64>())
            }),
        )
        .route(
            "fail",
            json_handler(|_: Value| async move {
                Err::<Value, _>(anyhow::anyhow!("fail handler always fails"))
            }),
        )
        .build()
}

async fn start_pair(
    broker: &MemoryBroker,
    kind: BindingKind,
    settings: &Settings,
    handlers: usize,
) -> Result<(Server, Client)> {
    let server_config = ServerConfig::new(settings.connection().group_id("rpcbus-demo-servers"))
        .max_concurrent_handlers(handlers);
    let server = Server::new(binding(broker, kind), server_config, REQUESTS, demo_router())
        .await
        .context("Failed to start server")?;
    server.start();

    let client_config = ClientConfig::new(settings.connection()).call_timeout(settings.call_timeout);
    let client = Client::connect(binding(broker, kind), client_config, REQUESTS, REPLIES)
        .await
        .context("Failed to connect client")?;

    Ok((server, client))
}

/// Issue call number `i`; the mix covers every reply status
async fn issue(client: &Client, i: usize) -> Result<()> {
    match i % 20 {
        19 => {
            client.remote_call::<Value, Value>("missing", None).await?;
        }
        9 => {
            client.remote_call::<Value, Value>("fail", Some(&json!(i))).await?;
        }
        7 | 8 | 17 | 18 => {
            let numbers: Vec<i64> = (0..=i as i64).collect();
            let total: i64 = client.remote_call("sum", Some(&numbers)).await?;
            if total != numbers.iter().sum::<i64>() {
                bail!("wrong sum {} for call {}", total, i);
            }
        }
        _ => {
            let payload = json!({"call": i, "tag": format!("req-{}", i)});
            let echoed: Value = client.remote_call("echo", Some(&payload)).await?;
            if echoed != payload {
                bail!("echo mismatch for call {}", i);
            }
        }
    }
    Ok(())
}

fn outcome(result: &Result<()>) -> &'static str {
    let Err(e) = result else {
        return "ok";
    };
    match e.downcast_ref::<RpcError>() {
        Some(RpcError::BadHandler) => "bad-handler",
        Some(RpcError::InternalServer) => "internal-error",
        Some(RpcError::Timeout) => "timeout",
        Some(RpcError::ConnectionClosed) => "connection-closed",
        Some(_) => "other",
        None => "mismatch",
    }
}

fn print_summary(outcomes: &[(Result<()>, Duration)], elapsed: Duration) {
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for (result, _) in outcomes {
        *counts.entry(outcome(result)).or_default() += 1;
    }

    let mut latencies: Vec<Duration> = outcomes.iter().map(|(_, latency)| *latency).collect();
    latencies.sort_unstable();
    let percentile = |p: usize| -> Duration {
        if latencies.is_empty() {
            return Duration::ZERO;
        }
        latencies[(latencies.len() - 1) * p / 100]
    };

    println!("Calls: {} in {:?}", outcomes.len(), elapsed);
    for (label, count) in &counts {
        println!("  {:<18} {}", label, count);
    }
    println!(
        "Latency: p50 {:?}  p99 {:?}  max {:?}",
        percentile(50),
        percentile(99),
        latencies.last().copied().unwrap_or_default()
    );
}

async fn demo(
    settings: &Settings,
    kind: BindingKind,
    calls: usize,
    concurrency: usize,
    handlers: usize,
) -> Result<()> {
    let broker = MemoryBroker::new();
    let (server, client) = start_pair(&broker, kind, settings, handlers).await?;

    info!(binding = ?kind, calls, concurrency, "Running demo");
    let started = Instant::now();

    let outcomes: Vec<(Result<()>, Duration)> = futures::stream::iter(0..calls)
        .map(|i| {
            let client = client.clone();
            async move {
                let call_started = Instant::now();
                let result = issue(&client, i).await;
                (result, call_started.elapsed())
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    print_summary(&outcomes, started.elapsed());

    client.shutdown().await.context("Client shutdown failed")?;
    server.shutdown().await.context("Server shutdown failed")?;
    Ok(())
}

async fn reconnect(settings: &Settings, kind: BindingKind, calls: usize) -> Result<()> {
    let broker = MemoryBroker::new();
    let (server, client) = start_pair(&broker, kind, settings, 1).await?;

    let mut client_state = client.state_receiver();
    let watcher = tokio::spawn(async move {
        while client_state.changed().await.is_ok() {
            let state = *client_state.borrow();
            println!("client link: {:?}", state);
            if matches!(state, LinkState::Failed | LinkState::Stopped) {
                break;
            }
        }
    });

    let started = Instant::now();
    let mut outcomes = Vec::with_capacity(calls);
    for i in 0..calls {
        if i == calls / 2 {
            println!("severing every broker session (dials so far: {})", broker.dial_count());
            broker.sever_all();
        }

        let call_started = Instant::now();
        let result = issue(&client, i).await;
        outcomes.push((result, call_started.elapsed()));
        sleep(Duration::from_millis(50)).await;
    }

    print_summary(&outcomes, started.elapsed());
    println!(
        "Dials: {}  client: {:?}  server: {:?}",
        broker.dial_count(),
        client.state(),
        server.state()
    );

    client.shutdown().await.context("Client shutdown failed")?;
    server.shutdown().await.context("Server shutdown failed")?;
    let _ = watcher.await;
    Ok(())
}
