//! chainrelay CLI — exercise endpoint pools and subscriptions from the terminal.
//!
//! Usage:
//! ```bash
//! # Probe a set of nodes and print the pool's health snapshot
//! chainrelay status --url https://rpc-a.example.com --url https://rpc-b.example.com
//!
//! # Send one JSON-RPC call through the retry driver
//! chainrelay call --url https://rpc-a.example.com --url https://rpc-b.example.com --method status
//!
//! # Stream events from a subscription
//! chainrelay subscribe --ws wss://rpc-a.example.com/websocket --query "tm.event='NewBlock'" --count 5
//! ```

use std::env;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chainrelay_core::{ClientConfig, ClientPool, PoolError, TracingMetrics};
use chainrelay_http::{HttpEndpoint, HttpEndpointConfig};
use chainrelay_ws::{MultiplexerConfig, SubscriptionMultiplexer};

/// Optional `--config` document. Every section may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CliConfig {
    /// HTTP endpoints used when no `--url` is given.
    endpoints: Vec<String>,
    /// WebSocket endpoint used when no `--ws` is given.
    websocket: Option<String>,
    #[serde(flatten)]
    client: ClientConfig,
    http: HttpEndpointConfig,
    multiplexer: MultiplexerConfig,
    log: LogConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct LogConfig {
    /// Filter directives, e.g. `"info,chainrelay_core=debug"`.
    level: String,
    /// Emit JSON lines instead of human-readable text.
    json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "status" => cmd_status(&args[2..]).await,
        "call" => cmd_call(&args[2..]).await,
        "subscribe" => cmd_subscribe(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("chainrelay {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainrelay {}", env!("CARGO_PKG_VERSION"));
    println!("Resilient access to redundant blockchain nodes\n");
    println!("USAGE:");
    println!("    chainrelay <COMMAND> [FLAGS]\n");
    println!("COMMANDS:");
    println!("    status     Probe a pool of HTTP endpoints and print its health snapshot");
    println!("    call       Send one JSON-RPC call through the retry driver");
    println!("    subscribe  Stream events from a WebSocket subscription");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("COMMON FLAGS:");
    println!("    --config <FILE>    JSON config (endpoints, websocket, pool, backoff, retry, http, multiplexer, log)\n");
    println!("STATUS FLAGS:");
    println!("    --url <URL>        HTTP JSON-RPC endpoint, repeatable  [required]");
    println!("    --rounds <N>       Call + probe rounds before reporting  [default: 3]");
    println!("    --method <M>       Method used for the test calls  [default: status]\n");
    println!("CALL FLAGS:");
    println!("    --url <URL>        HTTP JSON-RPC endpoint, repeatable  [required]");
    println!("    --method <M>       JSON-RPC method  [required]");
    println!("    --params <JSON>    Params as a JSON array or object\n");
    println!("SUBSCRIBE FLAGS:");
    println!("    --ws <URL>         WebSocket endpoint  [required]");
    println!("    --query <Q>        Subscription query  [required]");
    println!("    --count <N>        Exit after N events");
}

// ─── Commands ─────────────────────────────────────────────────────────────────

async fn cmd_status(args: &[String]) -> Result<()> {
    let config = load_config(args)?;
    let rounds: u32 = parse_number(args, "--rounds")?.unwrap_or(3);
    let method = parse_flag(args, "--method").unwrap_or_else(|| "status".into());
    let pool = build_pool(args, &config)?;

    for round in 1..=rounds {
        let outcome = pool
            .execute(&method, |ep| {
                let method = method.clone();
                async move { ep.call::<Value>(&method, Value::Null).await }
            })
            .await;
        if let Err(e) = outcome {
            tracing::warn!(round, error = %e, "status call failed");
        }
        let report = pool.probe_cooling().await;
        tracing::info!(
            round,
            probed = report.probed,
            reactivated = report.reactivated.len(),
            "round complete"
        );
    }

    println!("{}", serde_json::to_string_pretty(&pool.snapshot())?);
    pool.close().await;
    Ok(())
}

async fn cmd_call(args: &[String]) -> Result<()> {
    let config = load_config(args)?;
    let method = parse_flag(args, "--method").context("--method is required")?;
    let params: Value = match parse_flag(args, "--params") {
        Some(raw) => serde_json::from_str(&raw).context("--params must be valid JSON")?,
        None => Value::Null,
    };
    let pool = build_pool(args, &config)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let result = pool
        .execute_with_retry(&method, &cancel, |ep| {
            let method = method.clone();
            let params = params.clone();
            async move { ep.call::<Value>(&method, params).await }
        })
        .await;
    pool.close().await;

    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(PoolError::Cancelled) => bail!("interrupted"),
        Err(e) => Err(e).context(format!("{method} failed")),
    }
}

async fn cmd_subscribe(args: &[String]) -> Result<()> {
    let config = load_config(args)?;
    let url = parse_flag(args, "--ws")
        .or_else(|| config.websocket.clone())
        .context("--ws is required")?;
    let query = parse_flag(args, "--query").context("--query is required")?;
    let count: Option<u64> = parse_number(args, "--count")?;

    let mux = SubscriptionMultiplexer::websocket(url, config.multiplexer);
    let (id, mut events) = mux.subscribe_channel(query).await?;
    tracing::info!(subscription = %id, "subscribed");

    let mut received = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
                received += 1;
                if count.is_some_and(|n| received >= n) {
                    break;
                }
            }
        }
    }

    mux.close().await;
    Ok(())
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn load_config(args: &[String]) -> Result<CliConfig> {
    let config = match parse_flag(args, "--config") {
        Some(path) => {
            let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?
        }
        None => CliConfig::default(),
    };
    init_tracing(&config.log);
    Ok(config)
}

/// `RUST_LOG` wins over the config file. Logs go to stderr so stdout stays
/// machine-readable.
fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn build_pool(args: &[String], config: &CliConfig) -> Result<Arc<ClientPool<HttpEndpoint>>> {
    let mut urls = parse_flags(args, "--url");
    if urls.is_empty() {
        urls = config.endpoints.clone();
    }
    if urls.is_empty() {
        bail!("at least one --url is required");
    }
    let endpoints = urls
        .into_iter()
        .map(|url| HttpEndpoint::new(url, config.http.clone()).map(Arc::new))
        .collect::<Result<Vec<_>, _>>()?;

    let pool = ClientPool::new(endpoints, config.client.pool.clone())?
        .with_backoff(config.client.backoff.clone())
        .with_retry(config.client.retry.clone())
        .with_metrics(Arc::new(TracingMetrics));
    Ok(Arc::new(pool))
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

/// Every value given for a repeatable flag.
fn parse_flags(args: &[String], flag: &str) -> Vec<String> {
    args.windows(2)
        .filter(|pair| pair[0] == flag)
        .map(|pair| pair[1].clone())
        .collect()
}

fn parse_number<T: std::str::FromStr>(args: &[String], flag: &str) -> Result<Option<T>> {
    match parse_flag(args, flag) {
        Some(raw) => match raw.parse() {
            Ok(n) => Ok(Some(n)),
            Err(_) => bail!("{flag} expects a number, got {raw:?}"),
        },
        None => Ok(None),
    }
}
