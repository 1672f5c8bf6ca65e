use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(name = "layerproxy", about = "Caching proxy for container image layers")]
pub struct Cli {
    /// Path to the configuration file (defaults to ./layerproxy.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address the proxy listens on.
    #[arg(long, visible_alias = "addr")]
    pub listen: Option<SocketAddr>,

    /// Directory holding cached blobs.
    #[arg(short = 'd', long)]
    pub cache_dir: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Log output format.
    #[arg(long, value_enum)]
    pub log: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
