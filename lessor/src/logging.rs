//! Installation of the global tracing subscriber

use color_eyre::eyre::{self, WrapErr};
use tracing_subscriber::{
    filter::LevelFilter,
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LogFormat;

/// Installs the subscriber for the whole process
///
/// `level` is the default; `RUST_LOG` directives take precedence.
pub fn init(level: &str, format: LogFormat) -> eyre::Result<()> {
    let level: LevelFilter = level
        .parse()
        .wrap_err_with(|| format!("invalid log level `{}`", level))?;

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let fmt_layer = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Standard => fmt::layer().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .wrap_err("failed to install tracing subscriber")
}
