//! Command-line configuration.

use std::path::PathBuf;
use std::time::Duration;

use chronolog_store::{CollectionPattern, RouterConfig};
use clap::Parser;

use crate::server::ServerConfig;

#[derive(Debug, Parser)]
#[command(author, version, about = "Per-user time-series record store over WebSocket")]
pub struct Cli {
    /// Shared secret clients send in the api-key handshake
    #[arg(short = 's', long = "secret-key", value_name = "KEY")]
    pub secret_key: String,

    /// Collection pattern `name:ttl_minutes` or `prefix.*:ttl_minutes` (repeatable)
    #[arg(short = 'c', long = "collection", value_name = "PATTERN", required = true)]
    pub collections: Vec<CollectionPattern>,

    /// Persistence root. Without it every collection is in-memory only
    #[arg(short = 'd', long = "storage-dir", value_name = "DIR")]
    pub storage_dir: Option<String>,

    /// Seconds between flushes. 0 or unset disables flushing
    #[arg(short = 'i', long = "storage-interval", value_name = "SECONDS")]
    pub storage_interval: Option<u64>,

    /// Address to listen on
    #[arg(long = "bind", value_name = "ADDR", default_value = "0.0.0.0:1985")]
    pub bind_addr: String,
}

impl Cli {
    /// Split into the store-side and transport-side configuration.
    pub fn into_parts(self) -> (RouterConfig, ServerConfig) {
        let storage_root = self
            .storage_dir
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from);
        let storage_interval = self
            .storage_interval
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let router = RouterConfig {
            storage_root,
            patterns: self.collections,
        };
        let server = ServerConfig {
            bind_addr: self.bind_addr,
            secret_key: self.secret_key,
            storage_interval,
        };
        (router, server)
    }
}
