pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fallback;
pub mod health;
pub mod http;
pub mod logging;
pub mod simulator;
pub mod transport;
pub mod view;
pub mod ws;

use config::ClientConfig;
use error::TransportError;
use fallback::{FallbackSettings, FallbackTransport};
use transport::Transport;

/// Builds the ranked tier list described by `config`.
pub fn build_transport(config: &ClientConfig) -> Result<FallbackTransport, TransportError> {
    let mut tiers: Vec<Box<dyn Transport>> = vec![
        Box::new(ws::PushTransport::new(
            config.hub_url.clone(),
            config.request_timeout,
        )),
        Box::new(http::HttpTransport::new(
            config.http_url.clone(),
            config.request_timeout,
            config.poll_interval,
        )?),
    ];
    if config.simulator {
        tiers.push(Box::new(simulator::SimulatedTransport::new(
            config.resources.clone(),
            config.sim_step,
        )));
    }
    Ok(FallbackTransport::new(
        tiers,
        FallbackSettings {
            reconnect_interval: config.reconnect_interval,
            ping_interval: config.ping_interval,
            liveness_timeout: config.liveness_timeout,
            ..FallbackSettings::default()
        },
    ))
}
