use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod app;
mod config;
mod endpoint;
mod error;
mod latency;
mod store;
mod subscription;
mod xray;

use app::AppState;
use config::AppConfig;
use store::{HttpFetch, MemStore, Store};
use xray::Engine;

#[derive(Parser)]
#[command(name = "xrayctl")]
#[command(version = "0.1.0")]
#[command(about = "A simple-first local control plane for the Xray proxy engine", long_about = None)]
struct Cli {
    /// Parse a share link and print the endpoint as JSON
    #[arg(long, value_name = "LINK")]
    parse: Option<String>,

    /// Update all subscriptions, promote the fastest endpoint, then exit
    #[arg(long)]
    sync: bool,

    /// Test latencies of all subscription endpoints, print them, then exit
    #[arg(long)]
    test: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // Parse mode needs no engine, no store, no network
    if let Some(link) = &cli.parse {
        return parse_link(link);
    }

    // Load or create config
    let config = AppConfig::load().unwrap_or_default();
    let _ = config.save();

    let store = Arc::new(MemStore::new());
    for (index, mut sub) in config.subscriptions.iter().cloned().enumerate() {
        if sub.id.is_empty() {
            sub.id = if sub.name.is_empty() {
                format!("sub-{}", index + 1)
            } else {
                sub.name.clone()
            };
        }
        store.add_subscription(sub);
    }

    let engine = Engine::from_config(&config)?;
    let state = AppState::new(store, Arc::new(HttpFetch::new()?), config.clone(), engine);

    if cli.test {
        state.sync.update_subscriptions().await?;
        print_endpoints(&state).await?;
        return Ok(());
    }

    if cli.sync {
        state.refresh_all().await?;
        print_current(&state).await;
        return Ok(());
    }

    run(&state, &config).await
}

/// Sync once, promote the fastest endpoint, then keep refreshing on the
/// configured intervals until interrupted.
async fn run(state: &AppState, config: &AppConfig) -> Result<()> {
    if let Err(err) = state.refresh_all().await {
        warn!("initial refresh failed: {}", err);
    }
    print_current(state).await;

    let mut sub_tick = tokio::time::interval(Duration::from_secs(
        config.sub_update_interval.max(1) as u64 * 60,
    ));
    let mut test_tick = tokio::time::interval(Duration::from_secs(
        config.ep_test_interval.max(1) as u64 * 60,
    ));
    // both fire immediately on first poll; the initial refresh covered that
    sub_tick.tick().await;
    test_tick.tick().await;

    loop {
        tokio::select! {
            _ = sub_tick.tick() => {
                if let Err(err) = state.refresh_all().await {
                    warn!("scheduled refresh failed: {}", err);
                }
            }

            _ = test_tick.tick() => {
                if let Err(err) = retest_and_promote(state).await {
                    warn!("scheduled latency test failed: {}", err);
                }
            }

            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    state.stop_current().await;
    Ok(())
}

async fn retest_and_promote(state: &AppState) -> error::Result<()> {
    state.test_all().await?;
    state.select_fastest().await?;

    if let Some(traffic) = state.current_stats().await? {
        tracing::info!(
            "proxy traffic: {} B up / {} B down",
            traffic.uplink,
            traffic.downlink
        );
    }

    Ok(())
}

fn parse_link(link: &str) -> Result<()> {
    match endpoint::parser::parse(link) {
        Some(ep) => {
            println!("{}", serde_json::to_string_pretty(&ep)?);
            Ok(())
        }
        None => {
            eprintln!("✗ Not a recognized share link");
            std::process::exit(1);
        }
    }
}

async fn print_endpoints(state: &AppState) -> Result<()> {
    let eps = state.store.endpoints().await?;
    println!("✓ {} endpoints:", eps.len());

    for ep in eps {
        let latency = match ep.latency {
            endpoint::LATENCY_TESTING => "testing".to_string(),
            0 => "-".to_string(),
            endpoint::LATENCY_UNREACHABLE => "unreachable".to_string(),
            ms => format!("{} ms", ms),
        };
        println!(
            "  - {} ({}) {}:{} [{}]",
            ep.name,
            ep.protocol.tag(),
            ep.host,
            ep.port,
            latency
        );
    }

    Ok(())
}

async fn print_current(state: &AppState) {
    match state.current_endpoint().await {
        Some(ep) => println!("✓ Current endpoint: {} ({}:{})", ep.name, ep.host, ep.port),
        None => println!("✗ No endpoint promoted"),
    }
}
