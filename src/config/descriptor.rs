//! Connection descriptor decoded from a proxy link

use crate::common::Address;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Proxy-link scheme handled by this client
pub const LINK_SCHEME: &str = "vless";

/// Scheme prefix as it appears at the start of a link
pub const LINK_PREFIX: &str = "vless://";

/// Security mode name, without the mode-specific parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    None,
    Tls,
    Reality,
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityMode::None => write!(f, "none"),
            SecurityMode::Tls => write!(f, "tls"),
            SecurityMode::Reality => write!(f, "reality"),
        }
    }
}

/// TLS parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsParams {
    pub sni: Option<String>,
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
}

/// REALITY parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealityParams {
    pub sni: Option<String>,
    pub fingerprint: Option<String>,
    pub public_key: String,
    pub short_id: Option<String>,
}

/// Security layer with the fields that only exist for that layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Security {
    None,
    Tls(TlsParams),
    Reality(RealityParams),
}

impl Security {
    pub fn mode(&self) -> SecurityMode {
        match self {
            Security::None => SecurityMode::None,
            Security::Tls(_) => SecurityMode::Tls,
            Security::Reality(_) => SecurityMode::Reality,
        }
    }

    pub fn sni(&self) -> Option<&str> {
        match self {
            Security::None => None,
            Security::Tls(p) => p.sni.as_deref(),
            Security::Reality(p) => p.sni.as_deref(),
        }
    }

    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            Security::None => None,
            Security::Tls(p) => p.fingerprint.as_deref(),
            Security::Reality(p) => p.fingerprint.as_deref(),
        }
    }
}

/// Stream transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Ws {
        path: Option<String>,
        host: Option<String>,
    },
    Grpc {
        service_name: Option<String>,
    },
    /// Any other transport name, passed to the engine as-is
    Other { name: String },
}

impl Transport {
    pub fn name(&self) -> &str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Ws { .. } => "ws",
            Transport::Grpc { .. } => "grpc",
            Transport::Other { name } => name,
        }
    }
}

/// A decoded proxy link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// User identifier from the link's userinfo
    pub id: String,
    pub address: Address,
    pub port: u16,
    pub security: Security,
    pub transport: Transport,
    pub flow: Option<String>,
    pub encryption: String,
    /// URL-decoded fragment, empty when the link has none
    pub remark: String,
}

impl ConnectionDescriptor {
    pub fn security_mode(&self) -> SecurityMode {
        self.security.mode()
    }

    pub fn sni(&self) -> Option<&str> {
        self.security.sni()
    }

    /// Remark, or the address when the link carried no fragment
    pub fn display_name(&self) -> String {
        if self.remark.is_empty() {
            self.address.to_host()
        } else {
            self.remark.clone()
        }
    }

    /// Re-encode as a share link
    pub fn to_link(&self) -> String {
        let mut params: Vec<(&str, String)> = Vec::new();
        params.push(("encryption", self.encryption.clone()));
        params.push(("security", self.security_mode().to_string()));

        match &self.security {
            Security::None => {}
            Security::Tls(tls) => {
                push_opt(&mut params, "sni", &tls.sni);
                push_opt(&mut params, "fp", &tls.fingerprint);
                if !tls.alpn.is_empty() {
                    params.push(("alpn", tls.alpn.join(",")));
                }
            }
            Security::Reality(reality) => {
                push_opt(&mut params, "sni", &reality.sni);
                push_opt(&mut params, "fp", &reality.fingerprint);
                params.push(("pbk", reality.public_key.clone()));
                push_opt(&mut params, "sid", &reality.short_id);
            }
        }

        params.push(("type", self.transport.name().to_string()));
        match &self.transport {
            Transport::Ws { path, host } => {
                push_opt(&mut params, "path", path);
                push_opt(&mut params, "host", host);
            }
            Transport::Grpc { service_name } => {
                push_opt(&mut params, "serviceName", service_name);
            }
            Transport::Tcp | Transport::Other { .. } => {}
        }
        push_opt(&mut params, "flow", &self.flow);

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let mut link = format!(
            "{}{}@{}:{}?{}",
            LINK_PREFIX,
            urlencoding::encode(&self.id),
            self.address.to_authority_host(),
            self.port,
            query
        );
        if !self.remark.is_empty() {
            link.push('#');
            link.push_str(&urlencoding::encode(&self.remark));
        }
        link
    }
}

fn push_opt<'a>(params: &mut Vec<(&'a str, String)>, key: &'a str, value: &Option<String>) {
    if let Some(v) = value {
        params.push((key, v.clone()));
    }
}
