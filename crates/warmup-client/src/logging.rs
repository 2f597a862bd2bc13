use std::io;
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

/// Installs the CLI subscriber. Logs go to stderr only when asked for, so
/// they never interleave with the event stream on stdout.
pub fn init_logging(log_stdout: bool) -> bool {
    let level = match std::env::var("WARMUP_LOG_LEVEL") {
        Ok(level) if !level.trim().is_empty() => level,
        _ => "info".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let make_writer = if log_stdout {
        BoxMakeWriter::new(io::stderr)
    } else {
        BoxMakeWriter::new(io::sink)
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).is_ok()
}
