use std::time::Duration;
use thiserror::Error;
use warmup_core::FrameError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("http error: {0}")]
    Http(String),
    #[error("no transport tier available")]
    NoTier,
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return TransportError::Http(format!("timeout: {err}"));
        }
        TransportError::Http(err.to_string())
    }
}
