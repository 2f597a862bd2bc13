use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid listen address '{addr}': {reason}")]
    InvalidAddr { addr: String, reason: String },
    #[error("refusing non-loopback listen address {0}")]
    NonLoopback(SocketAddr),
    #[error("no resources configured")]
    NoResources,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
