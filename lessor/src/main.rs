//! `lessor`, a caching proxy in front of an upstream secret service
//!
//! Callers send their requests to the proxy instead of the upstream. The
//! proxy logs in on their behalf, caches leased secrets and tokens, and
//! keeps them renewed until they are revoked or expire.

#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use color_eyre::eyre;

mod app;
mod config;
mod logging;

use config::Config;

/// A caching proxy for an upstream secret service
#[derive(Debug, Parser)]
#[command(name = "lessor", version, about)]
struct Cli {
    /// Path of the TOML configuration file
    #[arg(short, long, env = "LESSOR_CONFIG")]
    config: PathBuf,

    /// Address to listen on, overriding `listener.address`
    #[arg(long, env = "LESSOR_LISTEN")]
    listen: Option<SocketAddr>,

    /// Upstream address, overriding `upstream.address`
    #[arg(long, env = "LESSOR_UPSTREAM")]
    upstream: Option<String>,

    /// Default log level, overriding `log_level`
    #[arg(long, env = "LESSOR_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(listen) = self.listen {
            config.listener.address = listen;
        }
        if let Some(upstream) = self.upstream {
            config.upstream.address = upstream;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    if let Err(error) = dotenvy::dotenv() {
        if !error.not_found() {
            eprintln!("warning: failed to load .env file: {}", error);
        }
    }

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    cli.apply(&mut config);
    config.validate()?;

    logging::init(&config.log_level, config.log_format)?;

    app::run(config).await
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut config: Config = "[upstream]\naddress = \"http://127.0.0.1:8200\""
            .parse()
            .unwrap();

        Cli::parse_from([
            "lessor",
            "--config",
            "lessor.toml",
            "--listen",
            "0.0.0.0:9100",
            "--upstream",
            "https://vault.internal:8200",
            "--log-level",
            "trace",
        ])
        .apply(&mut config);

        assert_eq!(config.listener.address.port(), 9100);
        assert_eq!(config.upstream.address, "https://vault.internal:8200");
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn absent_overrides_keep_file_values() {
        let mut config: Config = "log_level = \"warn\"\n[upstream]\naddress = \"http://127.0.0.1:8200\""
            .parse()
            .unwrap();

        Cli::parse_from(["lessor", "-c", "lessor.toml"]).apply(&mut config);

        assert_eq!(config.log_level, "warn");
        assert_eq!(config.upstream.address, "http://127.0.0.1:8200");
    }
}
