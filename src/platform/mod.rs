//! Operating-system collaborators
//!
//! The tunnel core reaches the OS through three seams: applying network
//! settings, resolving the server hostname and watching path reachability.
//! Hosts provide their own implementations; the ones here are usable from
//! the command line.

mod env_file;
mod reachability;
mod settings;

pub use env_file::EnvFilePlatform;
pub use reachability::ProbeReachability;
pub use settings::{
    DnsSettings, NetworkSettings, ProxySettings, DNS_SERVERS, FALLBACK_REMOTE, INTERFACE_ADDRESS,
    MATCH_ALL_DOMAINS,
};

use crate::Result;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Applies and removes tunnel network settings
#[async_trait]
pub trait NetworkPlatform: Send + Sync {
    /// Apply settings; the tunnel does not start when this fails
    async fn apply(&self, settings: &NetworkSettings) -> Result<()>;

    /// Remove whatever `apply` installed
    async fn reset(&self) -> Result<()>;
}

/// Hostname resolution restricted to IPv4
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve_ipv4(&self, host: &str) -> Result<Vec<Ipv4Addr>>;
}

/// Callback receiving `true` when the path is usable and `false` when not
///
/// Called from the monitor's own task; it must not block.
pub type ReachabilityHandler = Arc<dyn Fn(bool) + Send + Sync>;

/// Handle of one reachability subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(pub u64);

/// Source of network path changes
pub trait ReachabilityMonitor: Send + Sync {
    fn subscribe(&self, handler: ReachabilityHandler) -> SubscriptionToken;

    fn cancel(&self, token: SubscriptionToken);
}

/// Monitor that never reports a change
#[derive(Debug, Default)]
pub struct NoReachability;

impl ReachabilityMonitor for NoReachability {
    fn subscribe(&self, _handler: ReachabilityHandler) -> SubscriptionToken {
        SubscriptionToken(0)
    }

    fn cancel(&self, _token: SubscriptionToken) {}
}
