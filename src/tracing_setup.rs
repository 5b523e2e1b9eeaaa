use std::net::SocketAddr;

use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Initialize tracing from the `[logging]` section. `RUST_LOG` wins over the
/// configured level when set.
pub fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.level)
            .wrap_err_with(|| format!("Invalid log level: {}", logging.level))?,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if logging.json {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(logging.include_spans)
                    .with_span_list(logging.include_spans),
            )
            .try_init()
            .wrap_err("Failed to install tracing subscriber")?;
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
            .wrap_err("Failed to install tracing subscriber")?;
    }

    tracing::info!(
        level = %logging.level,
        json = logging.json,
        "wiregate logging initialized"
    );
    Ok(())
}

/// Span covering one accepted client connection, from detection to close.
pub fn connection_span(connection_id: &str, peer: SocketAddr) -> tracing::Span {
    tracing::info_span!(
        "connection",
        connection.id = connection_id,
        peer.addr = %peer,
        protocol = tracing::field::Empty,
        backend = tracing::field::Empty,
    )
}

/// Span covering one proxied HTTP request.
pub fn request_span(method: &str, path: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        http.status_code = tracing::field::Empty,
        backend = tracing::field::Empty,
    )
}
