//! Entry point for the nodescore daemon. Parses args, loads config and runs the collector + API.

use anyhow::Context;
use nodescore::{
    api,
    collector::Collector,
    config::{Config, StoreConfig},
    registry::StaticRegistry,
    sampler::{HttpSampler, Reading, Sampler, ScriptedSampler},
    state::AppState,
    store::{JsonlStore, MemoryStore, MetricsStore},
    types::NodeId,
};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "[--config PATH|-c PATH] [--port PORT|-p PORT] [--demo]";

#[derive(Debug, Default, PartialEq)]
struct ParsedArgs {
    config: Option<PathBuf>,
    port: Option<u16>,
    demo: bool,
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<ParsedArgs, String> {
    let mut it = args.into_iter();
    let prog = it.next().unwrap_or_else(|| "nodescore".into());
    let mut parsed = ParsedArgs::default();

    let port = |v: Option<String>| -> Result<u16, String> {
        v.as_deref()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| format!("Invalid port. Usage: {prog} {USAGE}"))
    };

    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => return Err(format!("Usage: {prog} {USAGE}")),
            "--config" | "-c" => parsed.config = it.next().map(PathBuf::from),
            "--port" | "-p" => parsed.port = Some(port(it.next())?),
            "--demo" => parsed.demo = true,
            _ if arg.starts_with("--config=") => {
                if let Some((_, v)) = arg.split_once('=') {
                    if !v.is_empty() {
                        parsed.config = Some(PathBuf::from(v));
                    }
                }
            }
            _ if arg.starts_with("--port=") => {
                parsed.port = Some(port(arg.split_once('=').map(|(_, v)| v.to_string()))?);
            }
            _ => return Err(format!("Unexpected argument {arg:?}. Usage: {prog} {USAGE}")),
        }
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = match parse_args(env::args()) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            return Ok(());
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut cfg = Config::load(parsed.config.as_deref()).context("loading config")?;
    cfg.apply_env().context("applying NODESCORE_* overrides")?;
    if let Some(p) = parsed.port {
        cfg.port = p;
    }

    let sampler: Arc<dyn Sampler> = if parsed.demo {
        let (sampler, nodes) = demo_sampler();
        cfg.nodes.extend(nodes);
        cfg.interval_secs = 10;
        Arc::new(sampler)
    } else {
        Arc::new(HttpSampler::new(cfg.sampler.clone()).context("building http client")?)
    };

    let store: Arc<dyn MetricsStore> = match &cfg.store {
        StoreConfig::Memory { max_rows } => Arc::new(MemoryStore::new(*max_rows)),
        StoreConfig::Jsonl { path } => {
            info!("persisting metrics to {}", path.display());
            Arc::new(JsonlStore::new(path))
        }
    };
    let registry = Arc::new(StaticRegistry::new(cfg.nodes.clone()));
    let collector = Arc::new(Collector::new(
        sampler,
        registry.clone(),
        store.clone(),
        cfg.interval(),
    ));

    // Follow registry changes before the initial sweep so no approval slips between them.
    let follower = collector.follow_registry(registry.subscribe());

    let app = api::router(AppState {
        collector: collector.clone(),
        registry,
        store,
        auth_token: cfg.auth_token.clone(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("nodescore listening on http://{addr}");

    let sweep = {
        let c = collector.clone();
        tokio::spawn(async move {
            let n = c.track_approved().await;
            info!(nodes = n, "initial collection sweep done");
        })
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("shutting down");
    sweep.abort();
    follower.abort();
    collector.shutdown().await;
    Ok(())
}

// --- Demo Mode ---

fn demo_sampler() -> (ScriptedSampler, Vec<NodeId>) {
    let sampler = ScriptedSampler::new(Reading::new(40.0, 250.0));
    let steady = NodeId::from("demo-steady:8080");
    let flaky = NodeId::from("demo-flaky:8080");
    let slow = NodeId::from("demo-slow:8080");

    let steady_pattern = [Reading::new(18.0, 640.0), Reading::new(22.0, 610.0), Reading::new(19.5, 655.0)];
    let flaky_pattern = [Reading::new(35.0, 300.0), Reading::unreachable(), Reading::new(60.0, 120.0)];
    let slow_pattern = [Reading::new(180.0, 45.0), Reading::new(240.0, 30.0)];

    sampler.script(&steady, steady_pattern.iter().copied().cycle().take(10_000));
    sampler.script(&flaky, flaky_pattern.iter().copied().cycle().take(10_000));
    sampler.script(&slow, slow_pattern.iter().copied().cycle().take(10_000));
    (sampler, vec![steady, flaky, slow])
}
