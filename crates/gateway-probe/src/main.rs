//! gateway-probe: exercise the Polygon (and optionally Claude) gateways and
//! report latency, cache hits and limiter usage.
//!
//! Usage:
//!   cargo run -p gateway-probe -- --symbols AAPL MSFT
//!   cargo run -p gateway-probe -- --symbols KO --repeat 3
//!   cargo run -p gateway-probe -- --symbols NVDA --cache-db sqlite://gateway_cache.db

use anyhow::Context;
use call_gateway::{Gateway, GatewayConfig, GatewayStats};
use llm_client::ClaudeClient;
use polygon_client::PolygonClient;
use std::sync::Arc;
use std::time::Instant;

const DEFAULT_SYMBOLS: &[&str] = &["AAPL", "MSFT", "KO"];
const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const PEER_COUNT: usize = 5;

struct Args {
    symbols: Vec<String>,
    repeat: usize,
    cache_db: Option<String>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();

    let symbols: Vec<String> = match args.iter().position(|a| a == "--symbols") {
        Some(idx) => args[idx + 1..]
            .iter()
            .take_while(|a| !a.starts_with("--"))
            .map(|s| s.to_uppercase())
            .collect(),
        None => Vec::new(),
    };

    let repeat = args
        .iter()
        .position(|a| a == "--repeat")
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
        .unwrap_or(2);

    let cache_db = args
        .iter()
        .position(|a| a == "--cache-db")
        .and_then(|i| args.get(i + 1))
        .cloned();

    Args {
        symbols: if symbols.is_empty() {
            DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect()
        } else {
            symbols
        },
        repeat: repeat.max(1),
        cache_db,
    }
}

fn init_tracing() {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "gateway_probe=info,call_gateway=info,polygon_client=warn".into())
    };
    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt().json().with_env_filter(filter()).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
    }
}

async fn build_gateway(name: &str, env_prefix: &str, cache_db: Option<&String>) -> anyhow::Result<Arc<Gateway>> {
    let mut config = GatewayConfig::from_env(env_prefix)
        .with_context(|| format!("invalid {} gateway configuration", name))?;
    if let Some(url) = cache_db {
        config.durable_cache_url = Some(url.clone());
    }

    let gateway = Gateway::builder()
        .name(name)
        .config(config)
        .connect_durable()
        .await
        .build()?;
    Ok(Arc::new(gateway))
}

#[derive(Default)]
struct SymbolReport {
    price: Option<f64>,
    price_source: &'static str,
    peers: Vec<String>,
    peer_source: &'static str,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let args = parse_args();
    let api_key = std::env::var("POLYGON_API_KEY").context("POLYGON_API_KEY must be set")?;

    let polygon_gateway = build_gateway("polygon", "POLYGON", args.cache_db.as_ref()).await?;
    let polygon = PolygonClient::new(api_key, polygon_gateway.clone());

    let claude = match std::env::var("ANTHROPIC_API_KEY") {
        Ok(key) => {
            let gateway = build_gateway("anthropic", "ANTHROPIC", args.cache_db.as_ref()).await?;
            let model = std::env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
            Some(ClaudeClient::new(key, model, gateway))
        }
        Err(_) => {
            tracing::info!("ANTHROPIC_API_KEY not set, prices and peers come from Polygon only");
            None
        }
    };

    tracing::info!(symbols = ?args.symbols, repeat = args.repeat, "Probing gateways");

    let mut reports: Vec<(String, SymbolReport)> = Vec::new();
    for round in 1..=args.repeat {
        reports.clear();
        for symbol in &args.symbols {
            let mut report = SymbolReport::default();

            let started = Instant::now();
            match polygon.get_current_price(symbol).await {
                Ok(Some(price)) => {
                    report.price = Some(price);
                    report.price_source = "polygon";
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(symbol = %symbol, kind = e.kind(), error = %e, "Price lookup failed"),
            }
            if report.price.is_none() {
                if let Some(claude) = &claude {
                    match claude.current_price(symbol).await {
                        Ok(Some(price)) => {
                            report.price = Some(price);
                            report.price_source = "llm";
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!(symbol = %symbol, error = %e, "LLM price lookup failed"),
                    }
                }
            }
            tracing::info!(
                symbol = %symbol,
                round,
                elapsed_ms = started.elapsed().as_millis() as u64,
                price = ?report.price,
                source = report.price_source,
                "Current price"
            );

            let started = Instant::now();
            match polygon.get_industry_peers(symbol, PEER_COUNT).await {
                Ok(peers) if !peers.is_empty() => {
                    report.peers = peers;
                    report.peer_source = "sic";
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(symbol = %symbol, error = %e, "SIC peer lookup failed"),
            }
            if report.peers.is_empty() {
                if let Some(claude) = &claude {
                    match claude.similar_companies(symbol, PEER_COUNT).await {
                        Ok(peers) => {
                            report.peers = peers;
                            report.peer_source = "llm";
                        }
                        Err(e) => tracing::warn!(symbol = %symbol, error = %e, "LLM peer lookup failed"),
                    }
                }
            }
            tracing::info!(
                symbol = %symbol,
                round,
                elapsed_ms = started.elapsed().as_millis() as u64,
                peers = report.peers.len(),
                source = report.peer_source,
                "Industry peers"
            );

            reports.push((symbol.clone(), report));
        }
    }

    println!();
    println!("{:<8} {:>20}  {}", "SYMBOL", "PRICE", "PEERS");
    for (symbol, report) in &reports {
        let price = report
            .price
            .map(|p| format!("{:.2} ({})", p, report.price_source))
            .unwrap_or_else(|| "n/a".to_string());
        let peers = if report.peers.is_empty() {
            "-".to_string()
        } else {
            format!("{} ({})", report.peers.join(", "), report.peer_source)
        };
        println!("{:<8} {:>20}  {}", symbol, price, peers);
    }

    println!();
    print_stats(&polygon_gateway.stats().await);
    if let Some(claude) = &claude {
        print_stats(&claude.gateway().stats().await);
    }

    Ok(())
}

fn print_stats(stats: &GatewayStats) {
    let lookups = stats.cache_hits + stats.cache_misses;
    let hit_rate = if lookups > 0 {
        stats.cache_hits as f64 / lookups as f64 * 100.0
    } else {
        0.0
    };
    println!(
        "[{}] hits={} misses={} ({:.0}% hit rate) producer_calls={} cached={} window={}/{} per {}s",
        stats.name,
        stats.cache_hits,
        stats.cache_misses,
        hit_rate,
        stats.producer_calls,
        stats.memory_entries,
        stats.calls_in_window,
        stats.max_calls,
        stats.window.as_secs(),
    );
}
