//! Tunnel lifecycle manager
//!
//! Drives one connect attempt through
//! `Preparing -> ResolvingAddress -> ApplyingSettings -> StartingEngine -> Running`
//! and tears it down again on stop. One manager owns the engine and the
//! reachability subscription; callers must not start a second attempt while
//! one is in flight.

use super::slot::ResolutionSlot;
use super::state::{TunnelAttempt, TunnelError, TunnelEvent, TunnelState, TunnelStatus};
use crate::config::builder::{
    document_for_link, extract_proxy_ports, extract_server_address, normalize,
};
use crate::config::document::ConfigDocument;
use crate::config::{Config, DEFAULT_START_TIMEOUT_SECS};
use crate::engine::EngineAdapter;
use crate::platform::{
    HostResolver, NetworkPlatform, NetworkSettings, ReachabilityMonitor, SubscriptionToken,
};
use crate::rule::RoutingPolicy;
use crate::store::{Profile, ProfileStore};
use crate::Error;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Default upper bound on waiting for the engine's stop call
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffered lifecycle events per subscriber
const EVENT_CAPACITY: usize = 64;

/// Where the document for an attempt comes from
#[derive(Debug, Clone)]
pub enum TunnelSource {
    /// A proxy link or subscription blob, built with the given policy
    Link { link: String, policy: RoutingPolicy },
    /// A complete document built elsewhere
    Document(ConfigDocument),
    /// The link and policy saved in the profile store
    Saved,
}

/// Paths and timings used by the manager
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub data_dir: PathBuf,
    pub matcher_cache: Option<PathBuf>,
    pub start_timeout: Duration,
    /// Stop gives up waiting for the engine after this long
    pub stop_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        ManagerOptions {
            data_dir: PathBuf::from("./data"),
            matcher_cache: None,
            start_timeout: Duration::from_secs(DEFAULT_START_TIMEOUT_SECS),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl From<&Config> for ManagerOptions {
    fn from(config: &Config) -> Self {
        ManagerOptions {
            data_dir: config.data_dir.clone(),
            matcher_cache: config.matcher_cache.clone(),
            start_timeout: config.start_timeout(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// Document ready to run plus what was learned from it
struct Prepared {
    document: ConfigDocument,
    server_address: Option<String>,
    ports: (u16, u16),
    /// Profile to save once the tunnel runs
    profile: Option<Profile>,
}

/// What reaches the start slot first
enum StartOutcome {
    Engine(crate::Result<Option<String>>),
    TimedOut,
}

struct Inner {
    state: TunnelState,
    attempt: Option<TunnelAttempt>,
    reachability: Option<SubscriptionToken>,
}

/// Owner of the single tunnel of this process
pub struct TunnelManager {
    adapter: EngineAdapter,
    platform: Arc<dyn NetworkPlatform>,
    resolver: Arc<dyn HostResolver>,
    reachability: Arc<dyn ReachabilityMonitor>,
    store: Option<Arc<dyn ProfileStore>>,
    options: ManagerOptions,
    inner: Mutex<Inner>,
    degraded: Arc<AtomicBool>,
    events: broadcast::Sender<TunnelEvent>,
}

/// Fails the attempt if `connect` is dropped before it finishes
struct AttemptGuard<'a> {
    manager: &'a TunnelManager,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.manager.abandon();
    }
}

impl TunnelManager {
    pub fn new(
        adapter: EngineAdapter,
        platform: Arc<dyn NetworkPlatform>,
        resolver: Arc<dyn HostResolver>,
        reachability: Arc<dyn ReachabilityMonitor>,
        options: ManagerOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        TunnelManager {
            adapter,
            platform,
            resolver,
            reachability,
            store: None,
            options,
            inner: Mutex::new(Inner {
                state: TunnelState::Idle,
                attempt: None,
                reachability: None,
            }),
            degraded: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    /// Use a profile store for [`TunnelSource::Saved`] and to remember links
    pub fn with_store(mut self, store: Arc<dyn ProfileStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn state(&self) -> TunnelState {
        self.inner.lock().state
    }

    pub fn status(&self) -> TunnelStatus {
        let inner = self.inner.lock();
        TunnelStatus {
            state: inner.state,
            degraded: inner.state == TunnelState::Running && self.degraded.load(Ordering::SeqCst),
            attempt: inner.attempt.clone(),
        }
    }

    /// Lifecycle events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Engine version string
    pub async fn engine_version(&self) -> crate::Result<String> {
        let adapter = self.adapter.clone();
        tokio::task::spawn_blocking(move || adapter.version())
            .await
            .map_err(|e| Error::internal(format!("engine version task failed: {}", e)))?
    }

    /// Have the engine check a document without running it
    pub async fn test_document(&self, document: &ConfigDocument) -> crate::Result<()> {
        let adapter = self.adapter.clone();
        let data_dir = self.options.data_dir.clone();
        let document = document.clone();
        tokio::task::spawn_blocking(move || adapter.test_config(&data_dir, &document))
            .await
            .map_err(|e| Error::internal(format!("engine config test task failed: {}", e)))?
    }

    fn emit(&self, event: TunnelEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn transition(&self, state: TunnelState) {
        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            inner.state = state;
            if let Some(attempt) = inner.attempt.as_mut() {
                attempt.state = state;
            }
            previous
        };
        if previous != state {
            info!("Tunnel state: {} -> {}", previous, state);
            self.emit(TunnelEvent::StateChanged { state });
        }
    }

    fn update_attempt(&self, f: impl FnOnce(&mut TunnelAttempt)) {
        if let Some(attempt) = self.inner.lock().attempt.as_mut() {
            f(attempt);
        }
    }

    fn fail(&self, err: TunnelError) -> TunnelError {
        error!("Tunnel attempt failed: {}", err);
        self.update_attempt(|attempt| attempt.error = Some(err.clone()));
        self.transition(TunnelState::Failed);
        self.emit(TunnelEvent::Failed {
            message: err.user_message(),
        });
        err
    }

    /// Mark an attempt that stopped mid-way as failed
    ///
    /// No-op unless the state is still between Preparing and StartingEngine.
    /// Settings that may already be applied are reset in the background.
    fn abandon(&self) {
        let state = self.state();
        if !state.is_connecting() {
            return;
        }
        warn!("Tunnel attempt abandoned during {}", state);
        self.transition(TunnelState::Failed);
        self.emit(TunnelEvent::Failed {
            message: "The connect attempt was cancelled.".to_string(),
        });

        if matches!(state, TunnelState::ApplyingSettings | TunnelState::StartingEngine) {
            let platform = self.platform.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = platform.reset().await {
                            warn!("Resetting network settings after abandoned attempt: {}", e);
                        }
                    });
                }
                Err(_) => warn!("No runtime to reset network settings of abandoned attempt"),
            }
        }
    }

    /// Run one connect attempt to completion
    ///
    /// Returns the status once the tunnel is running. The caller must not
    /// call `connect` again until this returns. Dropping the future before
    /// then leaves the attempt `Failed` with network settings reset.
    pub async fn connect(&self, source: TunnelSource) -> Result<TunnelStatus, TunnelError> {
        let attempt = TunnelAttempt::new();
        info!("Starting tunnel attempt {}", attempt.id);
        self.inner.lock().attempt = Some(attempt);
        self.degraded.store(false, Ordering::SeqCst);
        self.transition(TunnelState::Preparing);
        let _guard = AttemptGuard { manager: self };

        let prepared = match self.prepare(source).await {
            Ok(prepared) => prepared,
            Err(err) => return Err(self.fail(err)),
        };
        let (socks_port, http_port) = prepared.ports;
        self.update_attempt(|attempt| {
            attempt.server_address = prepared.server_address.clone();
            attempt.socks_port = socks_port;
            attempt.http_port = http_port;
        });

        self.transition(TunnelState::ResolvingAddress);
        let server_ip = match prepared.server_address.as_deref() {
            Some(address) => self.resolve_server(address).await,
            None => {
                warn!("Document has no proxy outbound address");
                None
            }
        };
        self.update_attempt(|attempt| attempt.server_ip = server_ip);

        self.transition(TunnelState::ApplyingSettings);
        let settings = NetworkSettings::for_tunnel(server_ip, http_port);
        if let Err(e) = self.platform.apply(&settings).await {
            return Err(self.fail(TunnelError::SettingsApplyFailed(e.to_string())));
        }

        self.transition(TunnelState::StartingEngine);
        if let Err(err) = self.start_engine(&prepared.document).await {
            if let Err(e) = self.platform.reset().await {
                warn!("Resetting network settings after failed start: {}", e);
            }
            return Err(self.fail(err));
        }

        let token = self.reachability.subscribe(self.reachability_handler());
        self.inner.lock().reachability = Some(token);
        self.transition(TunnelState::Running);
        info!(
            "Tunnel running (socks {}, http {})",
            socks_port, http_port
        );

        if let (Some(store), Some(profile)) = (&self.store, &prepared.profile) {
            if let Err(e) = store.save(profile).await {
                warn!("Failed to save profile: {}", e);
            }
        }

        Ok(self.status())
    }

    async fn prepare(&self, source: TunnelSource) -> Result<Prepared, TunnelError> {
        let (document, profile) = match source {
            TunnelSource::Document(document) => (document, None),
            TunnelSource::Link { link, policy } => {
                let (descriptor, document) = document_for_link(&link, &policy).map_err(|e| {
                    warn!("Link unusable: {}", e);
                    TunnelError::NoConfiguration
                })?;
                (document, Some(Profile::from_descriptor(&descriptor, policy)))
            }
            TunnelSource::Saved => {
                let profile = self.load_profile().await?;
                let link = profile.link.as_deref().ok_or(TunnelError::NoConfiguration)?;
                let (_, document) = document_for_link(link, &profile.routing).map_err(|e| {
                    warn!("Saved link unusable: {}", e);
                    TunnelError::NoConfiguration
                })?;
                (document, None)
            }
        };

        let document = normalize(document);
        let ports = extract_proxy_ports(&document);
        let server_address = extract_server_address(&document);
        debug!(
            "Prepared document: server {:?}, ports {:?}",
            server_address, ports
        );

        Ok(Prepared {
            document,
            server_address,
            ports,
            profile,
        })
    }

    async fn load_profile(&self) -> Result<Profile, TunnelError> {
        let store = self.store.as_ref().ok_or(TunnelError::NoConfiguration)?;
        match store.load().await {
            Ok(Some(profile)) => Ok(profile),
            Ok(None) => Err(TunnelError::NoConfiguration),
            Err(e) => {
                warn!("Failed to load profile: {}", e);
                Err(TunnelError::NoConfiguration)
            }
        }
    }

    /// IPv4 address of the server; `None` when it cannot be resolved
    async fn resolve_server(&self, address: &str) -> Option<Ipv4Addr> {
        if let Ok(ip) = address.parse::<Ipv4Addr>() {
            return Some(ip);
        }
        match self.resolver.resolve_ipv4(address).await {
            Ok(ips) => {
                let ip = ips.first().copied();
                debug!("Server {} resolved to {:?}", address, ip);
                ip
            }
            Err(e) => {
                warn!("Resolving {} failed, continuing without it: {}", address, e);
                None
            }
        }
    }

    /// Start the engine, racing it against the start timeout
    ///
    /// The engine call cannot be cancelled; on timeout it keeps running in
    /// the background and whatever it returns later is logged and dropped.
    async fn start_engine(&self, document: &ConfigDocument) -> Result<(), TunnelError> {
        let (slot, result) = ResolutionSlot::new();

        let adapter = self.adapter.clone();
        let data_dir = self.options.data_dir.clone();
        let matcher_cache = self.options.matcher_cache.clone();
        let document = document.clone();
        let worker_slot = slot.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = adapter.start(&data_dir, matcher_cache.as_deref(), &document);
            if let Err(StartOutcome::Engine(late)) = worker_slot.resolve(StartOutcome::Engine(outcome)) {
                match late {
                    Ok(_) => warn!("Engine started after the attempt ended; result discarded"),
                    Err(e) => warn!("Engine failed after the attempt ended: {}", e),
                }
            }
        });

        let start_timeout = self.options.start_timeout;
        let timer_slot = slot.clone();
        let timer = tokio::spawn(async move {
            sleep(start_timeout).await;
            if timer_slot.resolve(StartOutcome::TimedOut).is_ok() {
                warn!("Engine start timed out after {:?}", start_timeout);
            }
        });

        let outcome = result.await;
        timer.abort();

        match outcome {
            Ok(StartOutcome::Engine(Ok(_))) => Ok(()),
            Ok(StartOutcome::Engine(Err(Error::Engine(reason)))) => {
                Err(TunnelError::EngineStartFailed(reason))
            }
            Ok(StartOutcome::Engine(Err(e))) => Err(TunnelError::EngineStartFailed(e.to_string())),
            Ok(StartOutcome::TimedOut) => Err(TunnelError::EngineStartTimeout),
            Err(_) => Err(TunnelError::EngineStartFailed(
                "engine start task ended without a result".to_string(),
            )),
        }
    }

    fn reachability_handler(&self) -> crate::platform::ReachabilityHandler {
        let degraded = self.degraded.clone();
        let events = self.events.clone();
        Arc::new(move |reachable: bool| {
            let was_degraded = degraded.swap(!reachable, Ordering::SeqCst);
            if was_degraded == reachable {
                let _ = events.send(TunnelEvent::DegradedChanged {
                    degraded: !reachable,
                });
            }
        })
    }

    /// Tear the tunnel down
    ///
    /// Always completes: engine and platform failures are logged, never
    /// returned. A failed attempt is cleaned up too, since a late engine
    /// start may have left the engine running.
    pub async fn stop(&self) {
        let token = {
            let mut inner = self.inner.lock();
            if inner.state == TunnelState::Idle {
                debug!("Stop requested while idle");
                return;
            }
            inner.reachability.take()
        };
        self.transition(TunnelState::Stopping);

        if let Some(token) = token {
            self.reachability.cancel(token);
        }

        let adapter = self.adapter.clone();
        let stop_timeout = self.options.stop_timeout;
        match timeout(stop_timeout, tokio::task::spawn_blocking(move || adapter.stop())).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("Engine stop reported failure: {}", e),
            Ok(Err(e)) => warn!("Engine stop task failed: {}", e),
            Err(_) => warn!("Engine stop did not return within {:?}", stop_timeout),
        }

        if let Err(e) = self.platform.reset().await {
            warn!("Resetting network settings failed: {}", e);
        }

        self.degraded.store(false, Ordering::SeqCst);
        self.inner.lock().attempt = None;
        self.transition(TunnelState::Idle);
    }
}
