//! Configuration for the distributor (`fleet`) and the node (`fleetd`).
//!
//! Everything is an explicit value handed to the components at
//! construction; nothing reads the environment after startup.

use crate::protocol::{timeouts, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_IN_FLIGHT, DEFAULT_PORT};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("fleetsync");
        }
    }
    // Unix-like default
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("fleetsync");
    }
    PathBuf::from(".fleetsync")
}

fn load_toml<T>(explicit: Option<&Path>, default_name: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => {
            let p = config_dir().join(default_name);
            if !p.exists() {
                return Ok(T::default());
            }
            p
        }
    };
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))
}

/// Distributor-side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Port used when a node target does not name one
    pub port: u16,
    /// Identity presented to nodes; host name when unset
    pub identity: Option<String>,
    /// Chunk budget for large files; small files are those up to half of it
    pub chunk_size: usize,
    /// Cap on concurrently in-flight chunk writes
    pub max_in_flight: usize,
    pub heartbeat_secs: u64,
    pub tls: bool,
    /// Browse mDNS when a symbolic node name is not in `hosts`
    pub mdns: bool,
    pub mdns_timeout_ms: u64,
    /// Symbolic node name -> "host[:port]"
    pub hosts: BTreeMap<String, String>,
    pub log_file: Option<PathBuf>,
    pub journal: Option<PathBuf>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            identity: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            heartbeat_secs: timeouts::HEARTBEAT_SECS,
            tls: false,
            mdns: true,
            mdns_timeout_ms: 1_500,
            hosts: BTreeMap::new(),
            log_file: None,
            journal: None,
        }
    }
}

impl DeployConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let cfg: Self = load_toml(path, "fleet.toml")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size < 2 {
            anyhow::bail!("chunk_size must be at least 2 bytes");
        }
        if self.chunk_size > crate::protocol::MAX_FRAME_SIZE / 2 {
            anyhow::bail!(
                "chunk_size {} exceeds the frame limit ({} max)",
                self.chunk_size,
                crate::protocol::MAX_FRAME_SIZE / 2
            );
        }
        if self.max_in_flight == 0 {
            anyhow::bail!("max_in_flight must be at least 1");
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

/// Locations substituted for `%TOKEN%` placeholders on a node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathTokens {
    pub temp: Option<PathBuf>,
    pub local_app_data: Option<PathBuf>,
    pub app_data: Option<PathBuf>,
    pub program_data: Option<PathBuf>,
    pub home: Option<PathBuf>,
}

impl PathTokens {
    /// Fill unset entries from this machine's environment
    pub fn with_environment_defaults(mut self) -> Self {
        let env_path = |k: &str| std::env::var_os(k).map(PathBuf::from);
        let home = env_path("HOME").or_else(|| env_path("USERPROFILE"));
        if self.temp.is_none() {
            self.temp = Some(std::env::temp_dir());
        }
        if self.home.is_none() {
            self.home = home.clone();
        }
        if self.local_app_data.is_none() {
            self.local_app_data = env_path("LOCALAPPDATA")
                .or_else(|| home.as_ref().map(|h| h.join(".local").join("share")));
        }
        if self.app_data.is_none() {
            self.app_data =
                env_path("APPDATA").or_else(|| home.as_ref().map(|h| h.join(".config")));
        }
        if self.program_data.is_none() {
            self.program_data = env_path("PROGRAMDATA").or_else(|| {
                if cfg!(windows) {
                    None
                } else {
                    Some(PathBuf::from("/var/lib"))
                }
            });
        }
        self
    }
}

/// Node-side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub bind: String,
    /// When set, every file operation is confined under this directory
    pub root: Option<PathBuf>,
    pub allowed_identities: Vec<String>,
    pub heartbeat_secs: u64,
    pub tls: bool,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub paths: PathTokens,
    /// How long service start/stop waits for the target state
    pub service_wait_secs: u64,
    pub log_file: Option<PathBuf>,
    /// Instance name registered on mDNS; host name when unset
    pub advertise_name: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: format!("0.0.0.0:{DEFAULT_PORT}"),
            root: None,
            allowed_identities: Vec::new(),
            heartbeat_secs: timeouts::HEARTBEAT_SECS,
            tls: false,
            tls_cert: None,
            tls_key: None,
            paths: PathTokens::default(),
            service_wait_secs: 30,
            log_file: None,
            advertise_name: None,
        }
    }
}

impl NodeConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        load_toml(path, "fleetd.toml")
    }

    /// Silence after which a connection is dropped
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1)) * timeouts::DEAD_AFTER_BEATS
    }
}
