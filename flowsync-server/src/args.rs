//! Command-line arguments and environment overrides.
//!
//! Precedence per setting: command-line flag, then environment variable,
//! then the [`ServerConfig`] default.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use flowsync_collab::ServerConfig;

pub const ENV_BIND: &str = "FLOWSYNC_BIND";
pub const ENV_STORAGE_PATH: &str = "FLOWSYNC_STORAGE_PATH";
pub const ENV_COLLABORATION: &str = "FLOWSYNC_COLLABORATION";

/// flowsync - collaborative workflow document server
#[derive(Parser, Debug)]
#[command(name = "flowsync-server")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address to listen on [env: FLOWSYNC_BIND]
    #[arg(long)]
    pub bind: Option<String>,

    /// RocksDB directory; omit for an in-memory store [env: FLOWSYNC_STORAGE_PATH]
    #[arg(long)]
    pub storage_path: Option<PathBuf>,

    /// Refuse live joins; the operation facade keeps working [env: FLOWSYNC_COLLABORATION=false]
    #[arg(long)]
    pub no_collaboration: bool,

    /// Maximum connections per workflow room
    #[arg(long)]
    pub max_clients_per_room: Option<usize>,

    /// Seconds between checkpoint passes
    #[arg(long)]
    pub checkpoint_interval: Option<u64>,

    /// Seconds an empty room stays resident
    #[arg(long)]
    pub idle_grace: Option<u64>,

    /// JSON file holding an array of node templates
    #[arg(long)]
    pub templates: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// `false`/`0`/`off`/`no` (any case) disable; anything else enables.
pub fn parse_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "false" | "0" | "off" | "no"
    )
}

impl Cli {
    /// Resolve the server configuration, reading overrides through `env`.
    pub fn to_config(&self, env: impl Fn(&str) -> Option<String>) -> ServerConfig {
        let mut config = ServerConfig::default();
        if let Some(bind) = self.bind.clone().or_else(|| env(ENV_BIND)) {
            config.bind_addr = bind;
        }
        config.storage_path = self
            .storage_path
            .clone()
            .or_else(|| env(ENV_STORAGE_PATH).filter(|p| !p.is_empty()).map(PathBuf::from));
        config.collaboration_enabled = if self.no_collaboration {
            false
        } else {
            env(ENV_COLLABORATION).map_or(true, |v| parse_flag(&v))
        };
        if let Some(max) = self.max_clients_per_room {
            config.max_clients_per_room = max;
        }
        if let Some(secs) = self.checkpoint_interval {
            config.checkpoint_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = self.idle_grace {
            config.idle_grace = Duration::from_secs(secs);
        }
        config
    }
}
