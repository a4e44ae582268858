//! System resolver for the proxy server hostname

use crate::platform::{HostResolver, DNS_SERVERS};
use crate::{Error, Result};
use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::{debug, warn};

/// IPv4 resolver backed by the system configuration
pub struct SystemResolver {
    resolver: TokioAsyncResolver,
}

impl SystemResolver {
    /// Resolver from `/etc/resolv.conf` (or the platform equivalent),
    /// falling back to the public resolvers when it cannot be read
    pub fn new() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            warn!("System resolver unavailable ({}), using public resolvers", e);
            Self::build_resolver(&DNS_SERVERS.map(|ip| SocketAddr::new(ip, 53)))
        });
        SystemResolver { resolver }
    }

    /// Resolver querying the given servers over UDP
    pub fn with_nameservers(nameservers: &[SocketAddr]) -> Self {
        SystemResolver {
            resolver: Self::build_resolver(nameservers),
        }
    }

    fn build_resolver(nameservers: &[SocketAddr]) -> TokioAsyncResolver {
        let mut config = ResolverConfig::new();
        for addr in nameservers {
            config.add_name_server(NameServerConfig::new(*addr, Protocol::Udp));
        }

        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);
        opts.attempts = 2;

        TokioAsyncResolver::tokio(config, opts)
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve_ipv4(&self, host: &str) -> Result<Vec<Ipv4Addr>> {
        // Check if it's already an IP
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(vec![ip]);
        }

        let response = self
            .resolver
            .ipv4_lookup(host)
            .await
            .map_err(|e| Error::dns(format!("{}: {}", host, e)))?;

        let ips: Vec<Ipv4Addr> = response.iter().map(|a| a.0).collect();
        if ips.is_empty() {
            return Err(Error::dns(format!("No IPv4 address found for {}", host)));
        }

        debug!("DNS {} -> {:?}", host, ips);
        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolver_ip_passthrough() {
        let resolver = SystemResolver::new();
        let ips = resolver.resolve_ipv4("8.8.8.8").await.unwrap();
        assert_eq!(ips, vec![Ipv4Addr::new(8, 8, 8, 8)]);
    }

    #[tokio::test]
    async fn test_unreachable_nameserver_fails() {
        // Discard port on loopback: queries time out or are refused
        let resolver = SystemResolver::with_nameservers(&["127.0.0.1:9".parse().unwrap()]);
        assert!(resolver.resolve_ipv4("example.invalid").await.is_err());
    }
}
