//! Configuration types and constants for the relaypoint server.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::server::RelayConfig;

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
/// Heartbeat period advertised to clients in WELCOME.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;
/// Intervals of silence tolerated before eviction; 2 forgives one missed PING.
pub const MISSED_HEARTBEAT_THRESHOLD: u32 = 2;
/// A connection that has not completed HELLO within this window is dropped,
/// so half-open clients cannot pin resources.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;
/// Per-session outbound buffer.  A session that falls this far behind is
/// treated as dead and evicted rather than silently losing frames.
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 256;
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;
/// Hard cap on one history query or offline replay; truncation is logged.
pub const MAX_HISTORY_MESSAGES: usize = 10_000;
/// How long shutdown waits for live sessions to drain before giving up.
pub const SHUTDOWN_DRAIN_TIMEOUT_SECS: u64 = 5;

/// Message relay for long-lived agent clients.
///
/// Agents connect over WebSocket at `/ws`, exchange JSON frames, and receive
/// missed messages on reconnect.  Message history and presence persist in
/// SQLite.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(name = "relaypoint", version, about)]
pub struct Cli {
    /// Server bind address [env: RELAYPOINT_BIND] [default: 0.0.0.0:8080]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// Data directory for the message database [env: RELAYPOINT_HOME] [default: ~/.relaypoint]
    #[arg(long, short = 'd')]
    pub data_dir: Option<PathBuf>,

    /// Heartbeat interval in seconds [env: RELAYPOINT_HEARTBEAT_SECS] [default: 30]
    #[arg(long)]
    pub heartbeat_secs: Option<u64>,

    /// Maximum simultaneous connections [env: RELAYPOINT_MAX_CONNECTIONS] [default: 64]
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Keep the message log in memory instead of on disk
    #[arg(long)]
    pub in_memory: bool,
}

pub struct Config {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub heartbeat_secs: u64,
    pub max_connections: usize,
    pub in_memory: bool,
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Self {
        let bind_addr = cli
            .bind
            .or_else(|| std::env::var("RELAYPOINT_BIND").ok())
            .unwrap_or_else(|| DEFAULT_BIND.to_string());

        let data_dir = cli
            .data_dir
            .or_else(|| std::env::var("RELAYPOINT_HOME").ok().map(PathBuf::from))
            .unwrap_or_else(|| {
                std::env::var("HOME")
                    .map(|h| PathBuf::from(h).join(".relaypoint"))
                    .unwrap_or_else(|_| PathBuf::from(".relaypoint"))
            });

        let heartbeat_secs = cli
            .heartbeat_secs
            .or_else(|| {
                std::env::var("RELAYPOINT_HEARTBEAT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(DEFAULT_HEARTBEAT_SECS);

        let max_connections = cli
            .max_connections
            .or_else(|| {
                std::env::var("RELAYPOINT_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);

        Self {
            bind_addr,
            data_dir,
            heartbeat_secs,
            max_connections,
            in_memory: cli.in_memory,
        }
    }

    /// Runtime tuning derived from the resolved configuration.
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            max_connections: self.max_connections,
            ..RelayConfig::default()
        }
    }
}
