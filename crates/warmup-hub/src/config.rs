use crate::error::HubError;
use clap::Parser;
use std::{net::SocketAddr, time::Duration};
use warmup_core::ResourceId;

pub const DEFAULT_ADDR: &str = "127.0.0.1:47800";
pub const DEFAULT_RESOURCES: &str = "stylevae,transitionnet";

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub resources: Vec<ResourceId>,
    pub debug: bool,
    pub ping_interval: Duration,
    pub max_missed_pings: u32,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub max_warmup: Duration,
    pub stage_delay: Duration,
    pub failing: Vec<ResourceId>,
    pub log_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            resources: parse_resource_list(DEFAULT_RESOURCES),
            debug: false,
            ping_interval: Duration::from_secs(10),
            max_missed_pings: 3,
            write_timeout: Duration::from_secs(2),
            queue_capacity: 256,
            max_warmup: Duration::from_secs(300),
            stage_delay: Duration::from_millis(750),
            failing: Vec::new(),
            log_dir: String::new(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "warmup-hub")]
pub struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long = "resource")]
    resources: Vec<String>,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    #[arg(long, default_value_t = 3)]
    max_missed_pings: u32,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    #[arg(long, default_value_t = 300)]
    max_warmup: u64,
    #[arg(long, default_value_t = 750)]
    stage_delay_ms: u64,
    #[arg(long = "fail-resource")]
    failing: Vec<String>,
    #[arg(long, default_value = "")]
    log_dir: String,
}

pub fn load_config() -> Config {
    config_from_args(Args::parse())
}

pub fn config_from_args(args: Args) -> Config {
    Config {
        addr: resolve_addr(&args.addr),
        resources: resolve_resources(&args.resources),
        debug: args.debug || env_true("WARMUP_HUB_DEBUG"),
        ping_interval: Duration::from_secs(args.ping_interval),
        max_missed_pings: args.max_missed_pings,
        write_timeout: Duration::from_secs(args.write_timeout),
        queue_capacity: args.queue_capacity.max(1),
        max_warmup: Duration::from_secs(args.max_warmup),
        stage_delay: Duration::from_millis(args.stage_delay_ms),
        failing: args
            .failing
            .iter()
            .flat_map(|value| parse_resource_list(value))
            .collect(),
        log_dir: resolve_log_dir(&args.log_dir),
    }
}

/// Parses the bind address and refuses anything but loopback; the hub has no
/// authentication.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr, HubError> {
    let parsed: SocketAddr = addr.trim().parse().map_err(|err: std::net::AddrParseError| {
        HubError::InvalidAddr {
            addr: addr.to_string(),
            reason: err.to_string(),
        }
    })?;
    if !parsed.ip().is_loopback() {
        return Err(HubError::NonLoopback(parsed));
    }
    Ok(parsed)
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    non_empty_env("WARMUP_HUB_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string())
}

fn resolve_resources(flags: &[String]) -> Vec<ResourceId> {
    let from_flags: Vec<ResourceId> = flags
        .iter()
        .flat_map(|value| parse_resource_list(value))
        .collect();
    if !from_flags.is_empty() {
        return from_flags;
    }
    let raw = non_empty_env("WARMUP_RESOURCES").unwrap_or_else(|| DEFAULT_RESOURCES.to_string());
    parse_resource_list(&raw)
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    non_empty_env("WARMUP_LOG_DIR").unwrap_or_default()
}

/// Splits a comma list into unique resource ids, keeping first-seen order.
/// `all` is reserved for targeting and never names a resource.
pub fn parse_resource_list(raw: &str) -> Vec<ResourceId> {
    let mut out: Vec<ResourceId> = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() || part == warmup_core::ALL_TARGET {
            continue;
        }
        let id = ResourceId::from(part);
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_addresses_are_accepted() {
        assert!(parse_listen_addr("127.0.0.1:47800").is_ok());
        assert!(parse_listen_addr("[::1]:47800").is_ok());
    }

    #[test]
    fn non_loopback_and_garbage_are_refused() {
        assert!(matches!(
            parse_listen_addr("0.0.0.0:47800"),
            Err(HubError::NonLoopback(_))
        ));
        assert!(matches!(
            parse_listen_addr("localhost"),
            Err(HubError::InvalidAddr { .. })
        ));
    }

    #[test]
    fn resource_list_dedups_and_skips_reserved_target() {
        let parsed = parse_resource_list(" stylevae, all,,transitionnet ,stylevae");
        assert_eq!(
            parsed,
            vec![ResourceId::from("stylevae"), ResourceId::from("transitionnet")]
        );
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "warmup-hub",
            "--addr",
            "127.0.0.1:9000",
            "--resource",
            "a,b",
            "--resource",
            "c",
            "--fail-resource",
            "b",
            "--ping-interval",
            "1",
            "--queue-capacity",
            "0",
        ]);
        let config = config_from_args(args);
        assert_eq!(config.addr, "127.0.0.1:9000");
        assert_eq!(config.resources.len(), 3);
        assert_eq!(config.failing, vec![ResourceId::from("b")]);
        assert_eq!(config.ping_interval, Duration::from_secs(1));
        assert_eq!(config.queue_capacity, 1);
    }
}
