use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// A local reverse proxy multiplexing AI coding CLIs onto a pool of
/// upstream providers.
#[derive(Debug, Parser)]
#[command(name = "switchyard", version, about)]
pub struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "SWITCHYARD_CONFIG", default_value = "switchyard.yaml")]
    pub config: PathBuf,

    /// Override the listen address from the configuration file.
    #[arg(short, long, env = "SWITCHYARD_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Log filter, e.g. "info" or "proxy=debug".
    #[arg(long, env = "SWITCHYARD_LOG", default_value = "info")]
    pub log_filter: String,
}
