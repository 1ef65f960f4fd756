use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::cache::{DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_CONNECTIONS};
use crate::history::DEFAULT_MAX_PACKETS;

pub const DEFAULT_DB_DOWNLOAD_URL: &str =
    "https://download.maxmind.com/app/geoip_download?edition_id=GeoLite2-City&suffix=tar.gz";
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);

/// How capture handles are acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CaptureMode {
    /// Capture in a child process that relays frames over its stdout.
    Relay,
    /// Capture in this process.
    Direct,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "connmap", version, about = "Live, geolocated view of network flows")]
pub struct Args {
    /// Address for the WebSocket RPC server to listen on
    #[arg(long, default_value = "127.0.0.1:0")]
    pub listen: String,

    /// Heartbeat interval in seconds for client connections
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT.as_secs())]
    pub heartbeat: u64,

    /// Path to the GeoLite2 City database
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// URL the database archive is downloaded from
    #[arg(long, default_value = DEFAULT_DB_DOWNLOAD_URL)]
    pub db_download_url: String,

    /// Number of packets kept in the history
    #[arg(long, default_value_t = DEFAULT_MAX_PACKETS)]
    pub max_packet_cache: usize,

    /// Number of live connections kept before the cache is cleared
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections_cache: usize,

    /// Seconds a connection stays live without new packets
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT.as_secs())]
    pub idle_timeout: u64,

    #[arg(long, value_enum, default_value_t = CaptureMode::Relay)]
    pub capture_mode: CaptureMode,

    /// Privilege escalations attempted per trace request before giving up
    #[arg(long, default_value_t = 1)]
    pub max_escalations: u32,

    /// Seconds to wait for a client to answer an escalation prompt (waits forever if unset)
    #[arg(long)]
    pub consent_timeout: Option<u64>,

    /// PID of the companion UI process to terminate on restart
    #[arg(long, env = "CONNMAP_COMPANION_PID")]
    pub companion_pid: Option<u32>,

    /// Log filter, e.g. "info" or "connmap=debug"
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Fixed for the lifetime of the agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub idle_timeout: Duration,
    pub capture_mode: CaptureMode,
    pub max_escalations: u32,
    pub consent_timeout: Option<Duration>,
    pub companion_pid: Option<u32>,
}

/// Changeable by clients at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub db_path: PathBuf,
    pub db_download_url: String,
    pub max_packet_cache: usize,
    pub max_connections_cache: usize,
}

impl Args {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat.max(1))
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout),
            capture_mode: self.capture_mode,
            max_escalations: self.max_escalations,
            consent_timeout: self.consent_timeout.map(Duration::from_secs),
            companion_pid: self.companion_pid,
        }
    }

    pub fn settings(&self) -> Settings {
        Settings {
            db_path: self.db_path.clone().unwrap_or_else(default_db_path),
            db_download_url: self.db_download_url.clone(),
            max_packet_cache: self.max_packet_cache,
            max_connections_cache: self.max_connections_cache,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            capture_mode: CaptureMode::Relay,
            max_escalations: 1,
            consent_timeout: None,
            companion_pid: None,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            db_path: default_db_path(),
            db_download_url: DEFAULT_DB_DOWNLOAD_URL.into(),
            max_packet_cache: DEFAULT_MAX_PACKETS,
            max_connections_cache: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".local")
        .join("share")
        .join("connmap")
        .join("GeoLite2-City.mmdb")
}
