use std::sync::Arc;
use tracing::{error, info};
use warmup_hub::{
    config::{load_config, parse_listen_addr},
    launch,
    logging::init_logging,
    operation::TimedWarmup,
    server::serve,
};

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr = match parse_listen_addr(&config.addr) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let operation = TimedWarmup::new(config.stage_delay).failing(config.failing.iter().cloned());
    let state = match launch(&config, Arc::new(operation)) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    let resources = config
        .resources
        .iter()
        .map(|resource| resource.as_str())
        .collect::<Vec<_>>()
        .join(",");
    info!(event = "hub_start", addr = %addr, resources = %resources);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
    };
    if let Err(err) = serve(listener, state, shutdown).await {
        error!(event = "hub_error", error = %err);
    }
}
