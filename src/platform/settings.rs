//! Network settings applied while the tunnel runs

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// Address of the point-to-point tunnel interface
pub const INTERFACE_ADDRESS: Ipv4Addr = Ipv4Addr::new(198, 18, 0, 1);

/// Public resolvers configured while the tunnel is up
pub const DNS_SERVERS: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
];

/// Remote address used when the server address could not be resolved
pub const FALLBACK_REMOTE: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Proxy match-domain list meaning "every domain"
pub const MATCH_ALL_DOMAINS: &str = "";

/// Everything the platform applies for one tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkSettings {
    /// Remote endpoint reported for the tunnel
    pub tunnel_remote_address: IpAddr,

    /// Interface address; a /32 with no routes through it
    pub interface: Ipv4Net,

    /// Routes captured by the interface
    pub included_routes: Vec<Ipv4Net>,

    /// Routes kept off the interface
    pub excluded_routes: Vec<Ipv4Net>,

    pub dns: DnsSettings,

    pub proxy: ProxySettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DnsSettings {
    pub servers: Vec<IpAddr>,
    /// Empty string matches every domain
    pub match_domains: Vec<String>,
}

/// System HTTP/HTTPS proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProxySettings {
    pub host: IpAddr,
    pub port: u16,
    pub http_enabled: bool,
    pub https_enabled: bool,
    /// Empty string matches every domain
    pub match_domains: Vec<String>,
}

impl NetworkSettings {
    /// Settings for a tunnel whose engine serves HTTP on `http_port`
    ///
    /// The interface captures no routes: the engine only terminates HTTP and
    /// SOCKS connections, so raw packets routed into the interface would be
    /// dropped.
    pub fn for_tunnel(server_ip: Option<Ipv4Addr>, http_port: u16) -> Self {
        let excluded_routes = server_ip
            .map(|ip| vec![Ipv4Net::from(ip)])
            .unwrap_or_default();

        NetworkSettings {
            tunnel_remote_address: server_ip.map(IpAddr::V4).unwrap_or(FALLBACK_REMOTE),
            interface: Ipv4Net::from(INTERFACE_ADDRESS),
            included_routes: Vec::new(),
            excluded_routes,
            dns: DnsSettings {
                servers: DNS_SERVERS.to_vec(),
                match_domains: vec![MATCH_ALL_DOMAINS.to_string()],
            },
            proxy: ProxySettings {
                host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: http_port,
                http_enabled: true,
                https_enabled: true,
                match_domains: vec![MATCH_ALL_DOMAINS.to_string()],
            },
        }
    }

    /// `http://host:port` of the system proxy
    pub fn proxy_url(&self) -> String {
        format!("http://{}:{}", self.proxy.host, self.proxy.port)
    }
}
