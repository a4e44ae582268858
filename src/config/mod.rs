//! Configuration module
//!
//! Two kinds of configuration live here: the client's own YAML [`Config`],
//! and the engine document synthesized from a proxy link.

pub mod builder;
pub mod descriptor;
pub mod document;
pub mod parser;

pub use builder::{build_document, extract_proxy_ports, extract_server_address, normalize};
pub use descriptor::{ConnectionDescriptor, Security, SecurityMode, Transport};
pub use document::{ConfigDocument, Inbound, InboundKind, Outbound, RoutingRule, RuleMatch};
pub use parser::{parse_link, parse_subscription, resolve_from_blob};

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Engine start timeout used when the config does not set one
pub const DEFAULT_START_TIMEOUT_SECS: u64 = 15;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Directory holding geo data and the generated engine document
    pub data_dir: PathBuf,

    /// Precompiled domain matcher cache handed to the engine
    pub matcher_cache: Option<PathBuf>,

    /// Engine settings
    pub engine: EngineConfig,

    /// Saved link and routing policy
    pub profile: PathBuf,

    /// Control API listen address
    pub external_controller: Option<String>,

    /// Control API secret
    pub secret: Option<String>,

    /// Log level
    pub log_level: Option<String>,

    /// Reachability probing
    pub reachability: ReachabilityConfig,
}

impl Config {
    /// Load configuration from file (synchronous)
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load from string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::config("data-dir cannot be empty"));
        }
        if self.engine.start_timeout_secs == 0 {
            return Err(Error::config("engine.start-timeout-secs must be positive"));
        }
        if let Some(addr) = &self.external_controller {
            addr.parse::<std::net::SocketAddr>().map_err(|_| {
                Error::config(format!("invalid external-controller address: {}", addr))
            })?;
        }
        if self.reachability.interval_secs == 0 {
            return Err(Error::config("reachability.interval-secs must be positive"));
        }
        Ok(())
    }

    /// Save configuration to file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.start_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),
            matcher_cache: None,
            engine: EngineConfig::default(),
            profile: PathBuf::from("./profile.yaml"),
            external_controller: None,
            secret: None,
            log_level: Some("info".to_string()),
            reachability: ReachabilityConfig::default(),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EngineConfig {
    /// Engine executable run with `run -c <config>`
    pub executable: Option<PathBuf>,

    /// Seconds to wait for the engine to report a start result
    pub start_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            executable: None,
            start_timeout_secs: DEFAULT_START_TIMEOUT_SECS,
        }
    }
}

/// Reachability probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ReachabilityConfig {
    /// `host:port` dialled to decide whether the network path is up
    pub probe: Option<String>,

    /// Seconds between probes
    pub interval_secs: u64,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        ReachabilityConfig {
            probe: None,
            interval_secs: 5,
        }
    }
}
