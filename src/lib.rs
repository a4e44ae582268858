//! Pulse Tunnel - proxy-link VPN client core
//!
//! Turns a `vless://` share link into a running local tunnel:
//! - Link and subscription parsing
//! - Routing policy resolution (country, government, custom domains)
//! - Engine document synthesis and normalization
//! - Tunnel lifecycle with a bounded engine start
//! - Base64 JSON envelope for the embedded engine
//! - Local control API
//!
//! # Architecture
//!
//! ```text
//!                     +----------------+
//!                     |   hub/ (API)   |
//!                     +-------+--------+
//!                             |
//!                     +-------v--------+
//!                     |    tunnel/     |
//!                     +-------+--------+
//!                             |
//!        +--------------+-----+--------+--------------+
//!        |              |              |              |
//! +------v------+ +-----v-----+ +------v------+ +-----v------+
//! |   config/   | |  engine/  | |  platform/  | |   dns/     |
//! | (documents) | | (adapter) | | (settings)  | | (resolve)  |
//! +------+------+ +-----------+ +-------------+ +------------+
//!        |
//! +------v------+
//! |    rule/    |
//! |  (policy)   |
//! +-------------+
//! ```

pub mod common;
pub mod config;
pub mod dns;
pub mod engine;
pub mod hub;
pub mod platform;
pub mod rule;
pub mod store;
pub mod tunnel;

pub use common::error::{Error, Result};
pub use config::Config;

use engine::{EngineAdapter, ProcessEngine};
use hub::AppState;
use platform::{EnvFilePlatform, NoReachability, ProbeReachability, ReachabilityMonitor};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use store::YamlProfileStore;
use tunnel::{ManagerOptions, TunnelManager, TunnelSource};
use tracing::{error, info, warn};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine executable used when the config does not name one
pub const DEFAULT_ENGINE_EXECUTABLE: &str = "xray";

/// File the proxy exports are written to, relative to the data directory
pub const PROXY_ENV_FILE: &str = "proxy.env";

/// Adapter for the engine executable named in the config
pub fn engine_adapter(config: &Config) -> EngineAdapter {
    let executable = config
        .engine
        .executable
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENGINE_EXECUTABLE));
    EngineAdapter::new(Arc::new(ProcessEngine::with_executable(executable)))
}

/// Client instance wiring configuration to a tunnel manager
pub struct Client {
    config: Config,
    manager: Arc<TunnelManager>,
    api_addr: Option<SocketAddr>,
    api_secret: String,
}

impl Client {
    /// Create a new client from configuration
    pub fn new(config: Config) -> Result<Self> {
        info!("Initializing Pulse Tunnel v{}", VERSION);

        let api_addr = match &config.external_controller {
            Some(addr) => Some(
                addr.parse::<SocketAddr>()
                    .map_err(|_| Error::config(format!("invalid external-controller: {}", addr)))?,
            ),
            None => None,
        };
        let api_secret = config.secret.clone().unwrap_or_default();

        let adapter = engine_adapter(&config);
        info!("Engine adapter initialized");

        let platform = Arc::new(EnvFilePlatform::new(config.data_dir.join(PROXY_ENV_FILE)));
        let resolver = Arc::new(dns::SystemResolver::new());

        let reachability: Arc<dyn ReachabilityMonitor> = match &config.reachability.probe {
            Some(probe) => {
                info!("Reachability probe: {}", probe);
                Arc::new(ProbeReachability::new(
                    probe.clone(),
                    Duration::from_secs(config.reachability.interval_secs),
                ))
            }
            None => Arc::new(NoReachability),
        };

        let store = Arc::new(YamlProfileStore::new(&config.profile));

        let manager = TunnelManager::new(
            adapter,
            platform,
            resolver,
            reachability,
            ManagerOptions::from(&config),
        )
        .with_store(store);

        Ok(Client {
            config,
            manager: Arc::new(manager),
            api_addr,
            api_secret,
        })
    }

    /// Run the control API (when configured) until a shutdown signal
    ///
    /// With a source, one connect attempt is made first; a failed attempt
    /// ends the run with its error.
    pub async fn run(&self, source: Option<TunnelSource>) -> Result<()> {
        let mut handles = Vec::new();

        if let Some(addr) = self.api_addr {
            let state = self.create_app_state();
            handles.push(tokio::spawn(async move {
                if let Err(e) = hub::start_server(state, addr).await {
                    warn!("Control API server error: {}", e);
                }
            }));
        }

        let connected = match source {
            Some(source) => connect_or_interrupt(&self.manager, source, shutdown_signal()).await,
            None => Ok(true),
        };
        match connected {
            Ok(true) => {
                shutdown_signal().await?;
                info!("Received shutdown signal");
            }
            Ok(false) => info!("Interrupted while connecting"),
            Err(e) => {
                for handle in handles {
                    handle.abort();
                }
                return Err(e);
            }
        }

        self.manager.stop().await;
        for handle in handles {
            handle.abort();
        }

        info!("Client stopped");
        Ok(())
    }

    /// Create AppState for the control API
    pub fn create_app_state(&self) -> AppState {
        AppState::new(self.api_secret.clone(), self.manager.clone())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &Arc<TunnelManager> {
        &self.manager
    }
}

/// Run one connect attempt unless `interrupted` resolves first
///
/// `Ok(true)` once running, `Ok(false)` when interrupted. An interrupted
/// attempt is torn down before returning.
async fn connect_or_interrupt<F>(
    manager: &TunnelManager,
    source: TunnelSource,
    interrupted: F,
) -> Result<bool>
where
    F: std::future::Future<Output = Result<()>>,
{
    tokio::select! {
        result = manager.connect(source) => match result {
            Ok(_) => {
                info!("Tunnel running; press Ctrl+C to stop");
                Ok(true)
            }
            Err(e) => {
                error!("Connect failed: {}", e);
                Err(Error::engine(e.user_message()))
            }
        },
        signal = interrupted => {
            if let Err(e) = signal {
                warn!("Waiting for shutdown signal failed: {}", e);
            }
            manager.stop().await;
            Ok(false)
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_client_from_default_config() {
        let client = Client::new(Config::default()).unwrap();
        assert_eq!(client.manager().state(), tunnel::TunnelState::Idle);
        assert!(client.api_addr.is_none());
        assert!(client.create_app_state().secret.is_empty());
    }

    struct SlowEngine {
        stops: std::sync::atomic::AtomicUsize,
    }

    impl engine::EngineBackend for SlowEngine {
        fn run_from_json(&self, _request: &str) -> String {
            std::thread::sleep(Duration::from_millis(300));
            engine::CallResponse::ok(None).encode()
        }

        fn stop(&self) -> String {
            self.stops.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            engine::CallResponse::ok(None).encode()
        }

        fn version(&self) -> String {
            engine::CallResponse::ok(Some("test".to_string())).encode()
        }

        fn test_config(&self, _request: &str) -> String {
            engine::CallResponse::ok(None).encode()
        }
    }

    #[tokio::test]
    async fn test_interrupt_during_connect_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join(PROXY_ENV_FILE);
        let engine = Arc::new(SlowEngine {
            stops: std::sync::atomic::AtomicUsize::new(0),
        });
        let manager = TunnelManager::new(
            EngineAdapter::new(engine.clone()),
            Arc::new(EnvFilePlatform::new(&env_file)),
            Arc::new(dns::SystemResolver::with_nameservers(&[])),
            Arc::new(NoReachability),
            ManagerOptions {
                data_dir: dir.path().to_path_buf(),
                ..Default::default()
            },
        );
        let source = TunnelSource::Link {
            link: "vless://11111111-1111-1111-1111-111111111111@203.0.113.5:443?security=tls&sni=example.com#a"
                .to_string(),
            policy: rule::RoutingPolicy::default(),
        };

        let interrupted = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        };
        let connected = connect_or_interrupt(&manager, source, interrupted).await.unwrap();

        assert!(!connected);
        assert_eq!(manager.state(), tunnel::TunnelState::Idle);
        assert_eq!(engine.stops.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!env_file.exists());
    }

    #[test]
    fn test_client_rejects_bad_controller() {
        let config = Config {
            external_controller: Some("not-an-address".to_string()),
            ..Default::default()
        };
        assert!(Client::new(config).is_err());
    }
}
