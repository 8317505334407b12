//! Command line interface.
//!
//! Subcommands:
//! - `serve`: run the HTTP API until Ctrl-C
//! - `factory-reset`: remove every container on the host and exit
//! - `check-config`: print the effective configuration as JSON

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::FleetConfig;
use crate::error::ConfigError;

/// Default log filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "sandbox_fleet=info,tower_http=info";

#[derive(Parser, Debug)]
#[command(name = "sandbox-fleet")]
#[command(about = "Provisions and manages VM-backed sandbox containers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the fleet API
    Serve {
        /// Address to listen on
        #[arg(long, env = "FLEET_BIND", default_value = "0.0.0.0:8080")]
        bind: SocketAddr,

        /// Configuration file (YAML, or JSON by extension)
        #[arg(short, long, env = "FLEET_CONFIG")]
        config: Option<PathBuf>,

        /// Emit logs as JSON lines
        #[arg(long, env = "FLEET_LOG_JSON")]
        log_json: bool,
    },

    /// Remove every container on the host and prune volumes and networks
    FactoryReset {
        #[arg(short, long, env = "FLEET_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Load and validate configuration, then print it
    CheckConfig {
        #[arg(short, long, env = "FLEET_CONFIG")]
        config: Option<PathBuf>,
    },
}

impl Command {
    pub fn config_path(&self) -> Option<&PathBuf> {
        match self {
            Self::Serve { config, .. }
            | Self::FactoryReset { config }
            | Self::CheckConfig { config } => config.as_ref(),
        }
    }
}

/// Install the global tracing subscriber.
pub fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Effective configuration for `check-config`, pretty-printed.
pub fn render_config(config: &FleetConfig) -> Result<String, ConfigError> {
    serde_json::to_string_pretty(config).map_err(|e| ConfigError::ParseError(e.to_string()))
}
