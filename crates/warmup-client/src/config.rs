use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::time::Duration;
use url::Url;
use warmup_core::{ResourceId, ALL_TARGET};

pub const DEFAULT_HUB_URL: &str = "ws://127.0.0.1:47800/ws";
pub const DEFAULT_HTTP_URL: &str = "http://127.0.0.1:47800/";
pub const DEFAULT_RESOURCES: &str = "stylevae,transitionnet";

#[derive(Parser, Debug)]
#[command(name = "warmup-ctl")]
pub struct Args {
    #[command(subcommand)]
    pub command: Cmd,
    #[arg(long, global = true, default_value = "")]
    hub_url: String,
    #[arg(long, global = true, default_value = "")]
    http_url: String,
    /// Resources known to the local simulator.
    #[arg(long = "resource", global = true)]
    resources: Vec<String>,
    #[arg(long, global = true, default_value_t = 5)]
    reconnect_interval: u64,
    #[arg(long, global = true, default_value_t = 10)]
    ack_timeout: u64,
    #[arg(long, global = true, default_value_t = 5)]
    ping_interval: u64,
    #[arg(long, global = true, default_value_t = 15)]
    liveness_timeout: u64,
    #[arg(long, global = true, default_value_t = 2)]
    poll_interval: u64,
    #[arg(long, global = true, default_value_t = 500)]
    sim_step_ms: u64,
    #[arg(long, global = true, default_value_t = false)]
    no_simulator: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Cmd {
    /// Warm up one resource, or `all`.
    Warmup {
        target: String,
        /// Keep printing until every targeted resource settles.
        #[arg(long, default_value_t = false)]
        follow: bool,
    },
    /// Print a fresh snapshot of every resource.
    Status,
    /// Round-trip a ping through the active transport.
    Ping,
    /// Print every event until interrupted.
    Watch,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub hub_url: Url,
    pub http_url: Url,
    pub resources: Vec<ResourceId>,
    pub reconnect_interval: Duration,
    pub ack_timeout: Duration,
    pub ping_interval: Duration,
    pub liveness_timeout: Duration,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub sim_step: Duration,
    pub simulator: bool,
    pub log_stdout: bool,
}

pub fn load_config(args: &Args) -> anyhow::Result<ClientConfig> {
    let hub_url = resolve_hub_url(&args.hub_url)?;
    let http_url = resolve_http_url(&args.http_url, &hub_url)?;
    Ok(ClientConfig {
        hub_url,
        http_url,
        resources: resolve_resources(&args.resources),
        reconnect_interval: Duration::from_secs(args.reconnect_interval.max(1)),
        ack_timeout: Duration::from_secs(args.ack_timeout.max(1)),
        ping_interval: Duration::from_secs(args.ping_interval),
        liveness_timeout: Duration::from_secs(args.liveness_timeout),
        poll_interval: Duration::from_secs(args.poll_interval),
        request_timeout: Duration::from_secs(5),
        sim_step: Duration::from_millis(args.sim_step_ms),
        simulator: !args.no_simulator,
        log_stdout: resolve_log_stdout(),
    })
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn resolve_hub_url(flag: &str) -> anyhow::Result<Url> {
    let raw = if !flag.trim().is_empty() {
        flag.to_string()
    } else {
        non_empty_env("WARMUP_HUB_URL").unwrap_or_else(|| DEFAULT_HUB_URL.to_string())
    };
    let url = Url::parse(raw.trim()).with_context(|| format!("invalid hub url '{raw}'"))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        bail!("hub url must use ws:// or wss://, got '{raw}'");
    }
    Ok(url)
}

/// Flag, then env, then the hub url's host on plain http.
fn resolve_http_url(flag: &str, hub_url: &Url) -> anyhow::Result<Url> {
    let explicit = if !flag.trim().is_empty() {
        Some(flag.to_string())
    } else {
        non_empty_env("WARMUP_HTTP_URL")
    };
    if let Some(raw) = explicit {
        return Url::parse(raw.trim()).with_context(|| format!("invalid http url '{raw}'"));
    }
    let scheme = if hub_url.scheme() == "wss" { "https" } else { "http" };
    let host = hub_url.host_str().unwrap_or("127.0.0.1");
    let derived = match hub_url.port() {
        Some(port) => format!("{scheme}://{host}:{port}/"),
        None => format!("{scheme}://{host}/"),
    };
    Url::parse(&derived).with_context(|| format!("invalid derived http url '{derived}'"))
}

fn resolve_resources(flags: &[String]) -> Vec<ResourceId> {
    let joined = flags.join(",");
    let raw = if joined.trim().is_empty() {
        non_empty_env("WARMUP_RESOURCES").unwrap_or_else(|| DEFAULT_RESOURCES.to_string())
    } else {
        joined
    };
    let mut out: Vec<ResourceId> = Vec::new();
    for part in raw.split(',').map(str::trim) {
        if part.is_empty() || part == ALL_TARGET {
            continue;
        }
        let id = ResourceId::from(part);
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

fn resolve_log_stdout() -> bool {
    if let Some(value) = non_empty_env("WARMUP_LOG_STDOUT") {
        return matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        );
    }
    false
}
