//! Typed engine configuration document
//!
//! Mirrors the engine's JSON shape:
//!
//! ```text
//! { "log": {"loglevel": ..}, "inbounds": [..], "outbounds": [..], "routing": {"rules": [..]} }
//! ```
//!
//! Every struct keeps the keys it does not model in a flattened `extra` map,
//! so documents built elsewhere survive a decode/encode cycle unchanged.

use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Default SOCKS listener port
pub const DEFAULT_SOCKS_PORT: u16 = 10808;

/// Default HTTP listener port
pub const DEFAULT_HTTP_PORT: u16 = 10809;

/// Bind address for local listeners
pub const LOCAL_LISTEN: &str = "127.0.0.1";

/// Engine log level forced on every document
pub const ENGINE_LOG_LEVEL: &str = "warning";

/// Outbound tag of the proxy outbound
pub const PROXY_TAG: &str = "proxy";

/// Outbound tag of the direct outbound
pub const DIRECT_TAG: &str = "direct";

/// Outbound protocols that carry a remote proxy server
pub const PROXY_PROTOCOLS: &[&str] = &["vless", "vmess", "trojan", "shadowsocks", "socks", "http"];

/// Full engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub inbounds: Vec<Inbound>,

    #[serde(default)]
    pub outbounds: Vec<Outbound>,

    #[serde(default)]
    pub routing: Routing,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConfigDocument {
    /// Decode from the engine's JSON form
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Encode to the engine's JSON form
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// First listener with the given protocol
    pub fn inbound(&self, kind: InboundKind) -> Option<&Inbound> {
        self.inbounds.iter().find(|i| i.kind() == kind)
    }

    /// Outbound by tag
    pub fn outbound(&self, tag: &str) -> Option<&Outbound> {
        self.outbounds.iter().find(|o| o.tag.as_deref() == Some(tag))
    }
}

/// Log section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loglevel: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Listener protocol family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Socks,
    Http,
    Tun,
    Other,
}

impl InboundKind {
    pub fn from_protocol(protocol: &str) -> Self {
        match protocol.to_ascii_lowercase().as_str() {
            "socks" | "socks5" => InboundKind::Socks,
            "http" => InboundKind::Http,
            "tun" => InboundKind::Tun,
            _ => InboundKind::Other,
        }
    }
}

/// Port value as found in a document
///
/// Engines accept numbers, numeric strings and port ranges; only a single
/// port in 1..=65535 is usable as a listener port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    Number(i64),
    Text(String),
    Other(Value),
}

impl PortSpec {
    pub fn as_port(&self) -> Option<u16> {
        let n = match self {
            PortSpec::Number(n) => *n,
            PortSpec::Text(s) => s.trim().parse::<i64>().ok()?,
            PortSpec::Other(_) => return None,
        };
        if (1..=u16::MAX as i64).contains(&n) {
            Some(n as u16)
        } else {
            None
        }
    }
}

impl From<u16> for PortSpec {
    fn from(port: u16) -> Self {
        PortSpec::Number(port as i64)
    }
}

/// Local listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    #[serde(default)]
    pub protocol: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Inbound {
    /// SOCKS listener on the loopback address with UDP enabled
    pub fn socks(port: u16) -> Self {
        Inbound {
            tag: Some("socks".to_string()),
            protocol: "socks".to_string(),
            listen: Some(LOCAL_LISTEN.to_string()),
            port: Some(port.into()),
            settings: Some(serde_json::json!({ "auth": "noauth", "udp": true })),
            extra: Map::new(),
        }
    }

    /// HTTP listener on the loopback address
    pub fn http(port: u16) -> Self {
        Inbound {
            tag: Some("http".to_string()),
            protocol: "http".to_string(),
            listen: Some(LOCAL_LISTEN.to_string()),
            port: Some(port.into()),
            settings: Some(Value::Object(Map::new())),
            extra: Map::new(),
        }
    }

    pub fn kind(&self) -> InboundKind {
        InboundKind::from_protocol(&self.protocol)
    }

    pub fn port_number(&self) -> Option<u16> {
        self.port.as_ref().and_then(PortSpec::as_port)
    }
}

/// Outbound connection handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    #[serde(default)]
    pub protocol: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<OutboundSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Outbound {
    /// Direct (freedom) outbound
    pub fn direct() -> Self {
        Outbound {
            tag: Some(DIRECT_TAG.to_string()),
            protocol: "freedom".to_string(),
            settings: Some(OutboundSettings::default()),
            stream_settings: None,
            extra: Map::new(),
        }
    }

    pub fn is_proxy_protocol(&self) -> bool {
        let protocol = self.protocol.to_ascii_lowercase();
        PROXY_PROTOCOLS.contains(&protocol.as_str())
    }

    /// First remote server entry (`vnext` for VLESS/VMess, `servers` otherwise)
    pub fn server(&self) -> Option<&ServerEntry> {
        let settings = self.settings.as_ref()?;
        settings.vnext.first().or_else(|| settings.servers.first())
    }
}

/// Outbound settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundSettings {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vnext: Vec<ServerEntry>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<ServerEntry>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Remote server entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<UserEntry>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// User credentials inside a server entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Transport and security settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reality_settings: Option<RealitySettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WsSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc_settings: Option<GrpcSettings>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealitySettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WsSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Routing section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_strategy: Option<String>,

    #[serde(default)]
    pub rules: Vec<RoutingRule>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What a routing rule matches on
#[derive(Debug, Clone, PartialEq)]
pub enum RuleMatch {
    /// Domain and all of its subdomains
    DomainSuffix(String),
    /// IP range selector, e.g. `geoip:de` or a CIDR
    IpRange(String),
    /// Every TCP and UDP connection
    CatchAll,
    /// A rule shape this crate does not model, kept verbatim
    Custom(Map<String, Value>),
}

/// One ordered routing rule; the first matching rule wins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct RoutingRule {
    pub matcher: RuleMatch,
    /// Outbound tag the rule routes to
    pub target: String,
}

impl RoutingRule {
    pub fn domain_suffix(domain: impl Into<String>, target: impl Into<String>) -> Self {
        RoutingRule {
            matcher: RuleMatch::DomainSuffix(domain.into()),
            target: target.into(),
        }
    }

    pub fn ip_range(range: impl Into<String>, target: impl Into<String>) -> Self {
        RoutingRule {
            matcher: RuleMatch::IpRange(range.into()),
            target: target.into(),
        }
    }

    pub fn catch_all(target: impl Into<String>) -> Self {
        RoutingRule {
            matcher: RuleMatch::CatchAll,
            target: target.into(),
        }
    }
}

const DOMAIN_PREFIX: &str = "domain:";
const CATCH_ALL_NETWORK: &str = "tcp,udp";

fn single_string(value: &Value) -> Option<&str> {
    match value.as_array()?.as_slice() {
        [Value::String(s)] => Some(s),
        _ => None,
    }
}

impl From<Map<String, Value>> for RoutingRule {
    fn from(mut map: Map<String, Value>) -> Self {
        let target = match map.remove("outboundTag") {
            Some(Value::String(tag)) => tag,
            Some(other) => {
                map.insert("outboundTag".to_string(), other);
                String::new()
            }
            None => String::new(),
        };

        let is_field = map
            .get("type")
            .map(|t| t.as_str() == Some("field"))
            .unwrap_or(true);
        let keys: Vec<&str> = map
            .keys()
            .map(String::as_str)
            .filter(|k| *k != "type")
            .collect();

        let matcher = match (is_field, keys.as_slice()) {
            (true, ["domain"]) => single_string(&map["domain"])
                .and_then(|d| d.strip_prefix(DOMAIN_PREFIX))
                .map(|d| RuleMatch::DomainSuffix(d.to_string())),
            (true, ["ip"]) => single_string(&map["ip"]).map(|ip| RuleMatch::IpRange(ip.to_string())),
            (true, ["network"]) => (map["network"].as_str() == Some(CATCH_ALL_NETWORK))
                .then_some(RuleMatch::CatchAll),
            _ => None,
        };

        RoutingRule {
            matcher: matcher.unwrap_or(RuleMatch::Custom(map)),
            target,
        }
    }
}

fn field_rule(key: &str, value: Value) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("type".to_string(), Value::from("field"));
    map.insert(key.to_string(), value);
    map
}

impl From<RoutingRule> for Map<String, Value> {
    fn from(rule: RoutingRule) -> Self {
        let mut map = match rule.matcher {
            RuleMatch::DomainSuffix(domain) => field_rule(
                "domain",
                Value::from(vec![format!("{}{}", DOMAIN_PREFIX, domain)]),
            ),
            RuleMatch::IpRange(range) => field_rule("ip", Value::from(vec![range])),
            RuleMatch::CatchAll => field_rule("network", Value::from(CATCH_ALL_NETWORK)),
            RuleMatch::Custom(map) => map,
        };
        if !rule.target.is_empty() {
            map.insert("outboundTag".to_string(), Value::from(rule.target));
        }
        map
    }
}
