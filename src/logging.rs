use std::io;

use time::macros::format_description;
use time::UtcOffset;
use tracing_subscriber::{self, fmt, prelude::*};

/// Env var a user can set to control the filter without passing
/// `--log-level` on every launch; `--log-level` always wins when given.
const LOG_ENV_VAR: &str = "BUXN_LS_LOG";

fn resolve_filter(log_level: Option<&str>) -> tracing_subscriber::EnvFilter {
    if let Some(level) = log_level {
        return tracing_subscriber::EnvFilter::new(level);
    }
    tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Wire up stderr logging for the server. stdout is reserved for JSON-RPC
/// traffic in stdio mode, so every log line goes to stderr regardless of
/// launch mode.
pub fn init_logger(no_color: bool, log_level: Option<&str>) -> io::Result<()> {
    let timer = fmt::time::OffsetTime::new(
        UtcOffset::UTC,
        format_description!("[[[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z]"),
    );

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_timer(timer).with_ansi(!no_color);

    let filter = resolve_filter(log_level);

    match tracing_subscriber::registry().with(filter).with(stderr_layer).try_init() {
        Ok(()) => Ok(()),
        Err(err) => {
            // A second call (e.g. from a test harness that already installed
            // a subscriber) is not a fatal condition for this server.
            if err.to_string().contains("already been set") {
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::Other, err))
            }
        }
    }
}
