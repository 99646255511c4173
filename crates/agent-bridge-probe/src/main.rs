//! Agent bridge probe
//!
//! Routes a probe agent to every configured Factorio server, runs one
//! `query_state` batch through the bridge and prints a JSON health report:
//! - HEALTHY: the batch round-tripped and the mod answered
//! - UNHEALTHY: RCON works but the mod rejected the query
//! - DOWN: no session could be opened or the exchange failed
//!
//! The config path comes from the first argument or `AGENT_BRIDGE_CONFIG`.

use agent_bridge_core::{BridgeError, QueryScope, ServerId, ServerRequirements, ServerRouter};
use anyhow::{Context, Result};
use factorio_bridge::{AgentBridge, BridgeConfig, StaticRouter};
use serde_json::{Value, json};
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const CONFIG_ENV: &str = "AGENT_BRIDGE_CONFIG";
const PROBE_AGENT: &str = "probe";

fn load_config() -> Result<BridgeConfig> {
    match std::env::args().nth(1).or_else(|| std::env::var(CONFIG_ENV).ok()) {
        Some(path) => {
            info!("Loading config from {}", path);
            BridgeConfig::from_json_file(&path).with_context(|| format!("loading {}", path))
        }
        None => Ok(BridgeConfig::default()),
    }
}

/// Probe one server and describe the outcome
async fn probe(bridge: &AgentBridge, router: &StaticRouter, server: &ServerId) -> Value {
    let requirements = ServerRequirements {
        agent_id: format!("{}-{}", PROBE_AGENT, server),
        preferred: Some(server.clone()),
    };
    let handle = match router.acquire_server(&requirements).await {
        Ok(handle) => handle,
        Err(e) => {
            return json!({ "name": server, "status": "DOWN", "error": e.to_string() });
        }
    };

    let started = Instant::now();
    let result = bridge
        .observe(&handle.agent_id, &handle.endpoint, QueryScope::Player)
        .await;
    let latency_ms = started.elapsed().as_millis() as u64;

    let mut report = json!({
        "name": server,
        "address": handle.endpoint.address,
        "latency_ms": latency_ms,
    });
    match result {
        Ok(state) => {
            report["status"] = json!("HEALTHY");
            report["tick"] = json!(state.tick);
            if let Some(player) = state.player {
                report["player"] = json!({ "x": player.position.x, "y": player.position.y });
            }
        }
        Err(e) => {
            // A rejected or unparseable answer still proves RCON works
            let status = match e {
                BridgeError::Game { .. } | BridgeError::MalformedResponse(_) => "UNHEALTHY",
                _ => "DOWN",
            };
            warn!("Probe of {} failed: {}", server, e);
            report["status"] = json!(status);
            report["error"] = json!({ "code": e.code().as_str(), "message": e.to_string() });
        }
    }

    if let Some(stats) = bridge.pool().stats(server) {
        report["pool"] = json!({
            "capacity": stats.capacity,
            "idle": stats.idle,
            "in_use": stats.in_use,
            "opened": stats.opened,
            "unreachable": stats.unreachable,
        });
    }

    if let Err(e) = router.release_server(handle).await {
        warn!("Releasing {} failed: {}", server, e);
    }
    report
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout carries only the report
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config()?;
    let servers: Vec<ServerId> = config.servers.iter().map(|s| s.id.clone()).collect();
    info!("Probing {} server(s)", servers.len());

    let router = StaticRouter::new(config.servers.clone(), config.pool_size);
    let bridge = AgentBridge::new(config)?;

    let mut reports = Vec::with_capacity(servers.len());
    for server in &servers {
        reports.push(probe(&bridge, &router, server).await);
    }
    bridge.shutdown().await;

    let healthy = reports
        .iter()
        .filter(|report| report["status"] == "HEALTHY")
        .count();
    let summary = json!({
        "servers": reports,
        "healthy": healthy,
        "total": servers.len(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    info!("{}/{} server(s) healthy", healthy, servers.len());
    Ok(())
}
