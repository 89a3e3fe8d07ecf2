//! Manager configuration and the command-line surface of the daemon.

use clap::builder::TypedValueParser;
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// First port probed when allocating a preview server.
pub const DEFAULT_BASE_PORT: u16 = 5000;

/// Maximum number of preview servers alive at the same time.
pub const DEFAULT_MAX_SERVERS: usize = 10;

/// Number of sequential candidates tried before giving up on a port.
pub const DEFAULT_MAX_PORT_ATTEMPTS: u16 = 100;

/// Port of the control API.
pub const DEFAULT_CONTROL_PORT: u16 = 3001;

/// How long a stopping preview may take to drain its connections.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Settings for [`crate::manager::PreviewManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub base_port: u16,
    pub max_servers: usize,
    pub max_port_attempts: u16,
    /// Parent directory of every instance root
    pub previews_dir: PathBuf,
    /// Host name used when building preview URLs (e.g., "localhost")
    pub public_host: String,
    /// Interface preview listeners bind to
    pub bind_host: IpAddr,
    pub shutdown_grace: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            base_port: DEFAULT_BASE_PORT,
            max_servers: DEFAULT_MAX_SERVERS,
            max_port_attempts: DEFAULT_MAX_PORT_ATTEMPTS,
            previews_dir: default_previews_dir(),
            public_host: "localhost".to_string(),
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

fn default_previews_dir() -> PathBuf {
    std::env::temp_dir().join("preview-servers")
}

#[derive(Debug, Parser)]
#[command(name = "preview-manager")]
#[command(version, about = "Serve generated projects on ephemeral preview ports")]
pub struct Cli {
    /// Port the control API listens on
    #[arg(long, env = "PREVIEW_CONTROL_PORT", default_value_t = DEFAULT_CONTROL_PORT)]
    pub port: u16,

    /// First port probed for preview servers
    #[arg(long, env = "PREVIEW_BASE_PORT", default_value_t = DEFAULT_BASE_PORT)]
    pub base_port: u16,

    /// Maximum concurrent preview servers; the oldest is evicted beyond this
    #[arg(
        long,
        env = "PREVIEW_MAX_SERVERS",
        default_value_t = DEFAULT_MAX_SERVERS,
        value_parser = clap::value_parser!(u64).range(1..).map(|v| v as usize)
    )]
    pub max_servers: usize,

    /// Number of candidate ports tried before failing
    #[arg(
        long,
        env = "PREVIEW_MAX_PORT_ATTEMPTS",
        default_value_t = DEFAULT_MAX_PORT_ATTEMPTS,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub max_port_attempts: u16,

    /// Directory that holds materialized preview files
    #[arg(long, env = "PREVIEW_DIR")]
    pub previews_dir: Option<PathBuf>,

    /// Host name used in returned preview URLs
    #[arg(long, env = "PREVIEW_PUBLIC_HOST", default_value = "localhost")]
    pub public_host: String,

    /// IP address the control API and preview servers bind to
    #[arg(long, env = "PREVIEW_BIND_HOST", default_value = "0.0.0.0")]
    pub bind_host: IpAddr,
}

impl Cli {
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            base_port: self.base_port,
            max_servers: self.max_servers,
            max_port_attempts: self.max_port_attempts,
            previews_dir: self
                .previews_dir
                .clone()
                .unwrap_or_else(default_previews_dir),
            public_host: self.public_host.clone(),
            bind_host: self.bind_host,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}
