//! Engine document synthesis and inspection
//!
//! [`build_document`] turns a descriptor and a rule list into a complete
//! engine document. [`normalize`] and the `extract_*` helpers work on any
//! document, including ones produced elsewhere.

use super::descriptor::{ConnectionDescriptor, Security, Transport};
use super::document::{
    ConfigDocument, Inbound, InboundKind, LogConfig, Outbound, OutboundSettings, RealitySettings,
    Routing, RoutingRule, ServerEntry, StreamSettings, TlsSettings, UserEntry, WsSettings,
    GrpcSettings, DEFAULT_HTTP_PORT, DEFAULT_SOCKS_PORT, ENGINE_LOG_LEVEL, PROXY_TAG,
};
use super::parser::{parse_link, resolve_from_blob};
use crate::rule::{build_rules, RoutingPolicy};
use crate::Result;
use serde_json::Map;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

/// Fingerprint used when the link carries none
pub const DEFAULT_FINGERPRINT: &str = "chrome";

/// Domain strategy of generated documents
pub const DOMAIN_STRATEGY: &str = "AsIs";

/// Build a complete engine document for one server
pub fn build_document(descriptor: &ConnectionDescriptor, rules: Vec<RoutingRule>) -> ConfigDocument {
    let document = ConfigDocument {
        log: LogConfig {
            loglevel: Some(ENGINE_LOG_LEVEL.to_string()),
            extra: Map::new(),
        },
        inbounds: vec![
            Inbound::socks(DEFAULT_SOCKS_PORT),
            Inbound::http(DEFAULT_HTTP_PORT),
        ],
        outbounds: vec![proxy_outbound(descriptor), Outbound::direct()],
        routing: Routing {
            domain_strategy: Some(DOMAIN_STRATEGY.to_string()),
            rules,
            extra: Map::new(),
        },
        extra: Map::new(),
    };

    info!(
        "Built engine document for {} ({}, {}, {} rules)",
        descriptor.display_name(),
        descriptor.transport.name(),
        descriptor.security_mode(),
        document.routing.rules.len()
    );
    document
}

fn proxy_outbound(descriptor: &ConnectionDescriptor) -> Outbound {
    let user = UserEntry {
        id: Some(descriptor.id.clone()),
        encryption: Some(descriptor.encryption.clone()),
        flow: descriptor.flow.clone(),
        extra: Map::new(),
    };
    let server = ServerEntry {
        address: Some(descriptor.address.to_host()),
        port: Some(descriptor.port.into()),
        users: vec![user],
        extra: Map::new(),
    };

    Outbound {
        tag: Some(PROXY_TAG.to_string()),
        protocol: "vless".to_string(),
        settings: Some(OutboundSettings {
            vnext: vec![server],
            servers: Vec::new(),
            extra: Map::new(),
        }),
        stream_settings: Some(stream_settings(descriptor)),
        extra: Map::new(),
    }
}

fn stream_settings(descriptor: &ConnectionDescriptor) -> StreamSettings {
    let mut stream = StreamSettings {
        network: Some(descriptor.transport.name().to_string()),
        security: Some(descriptor.security_mode().to_string()),
        ..Default::default()
    };

    let server_name = || {
        descriptor
            .sni()
            .map(String::from)
            .unwrap_or_else(|| descriptor.address.to_host())
    };
    let fingerprint = || {
        descriptor
            .security
            .fingerprint()
            .unwrap_or(DEFAULT_FINGERPRINT)
            .to_string()
    };

    match &descriptor.security {
        Security::None => {}
        Security::Tls(tls) => {
            stream.tls_settings = Some(TlsSettings {
                server_name: Some(server_name()),
                fingerprint: Some(fingerprint()),
                alpn: tls.alpn.clone(),
                extra: Map::new(),
            });
        }
        Security::Reality(reality) => {
            stream.reality_settings = Some(RealitySettings {
                server_name: Some(server_name()),
                fingerprint: Some(fingerprint()),
                public_key: Some(reality.public_key.clone()),
                short_id: Some(reality.short_id.clone().unwrap_or_default()),
                extra: Map::new(),
            });
        }
    }

    match &descriptor.transport {
        Transport::Ws { path, host } => {
            let mut headers = BTreeMap::new();
            if let Some(host) = host {
                headers.insert("Host".to_string(), host.clone());
            }
            stream.ws_settings = Some(WsSettings {
                path: Some(path.clone().unwrap_or_else(|| "/".to_string())),
                headers,
                extra: Map::new(),
            });
        }
        Transport::Grpc { service_name } => {
            stream.grpc_settings = Some(GrpcSettings {
                service_name: service_name.clone(),
                extra: Map::new(),
            });
        }
        Transport::Tcp | Transport::Other { .. } => {}
    }

    stream
}

/// Resolve a link (or subscription blob) and build its document
pub fn document_for_link(
    raw: &str,
    policy: &RoutingPolicy,
) -> Result<(ConnectionDescriptor, ConfigDocument)> {
    let link = resolve_from_blob(raw)?;
    let descriptor = parse_link(&link)?;
    let rules = build_rules(&descriptor, policy);
    let document = build_document(&descriptor, rules);
    Ok((descriptor, document))
}

/// Make a document usable by the local tunnel
///
/// Removes `tun` listeners and duplicate SOCKS/HTTP listeners, adds the
/// default SOCKS and HTTP listeners when missing and forces the engine log
/// level. Applying it twice gives the same result as applying it once.
pub fn normalize(mut document: ConfigDocument) -> ConfigDocument {
    let mut has_socks = false;
    let mut has_http = false;
    let before = document.inbounds.len();

    document.inbounds.retain(|inbound| match inbound.kind() {
        InboundKind::Tun => false,
        InboundKind::Socks => !std::mem::replace(&mut has_socks, true),
        InboundKind::Http => !std::mem::replace(&mut has_http, true),
        InboundKind::Other => true,
    });
    let dropped = before - document.inbounds.len();
    if dropped > 0 {
        debug!("normalize: dropped {} listeners", dropped);
    }

    if !has_socks {
        debug!("normalize: adding SOCKS listener on {}", DEFAULT_SOCKS_PORT);
        document.inbounds.push(Inbound::socks(DEFAULT_SOCKS_PORT));
    }
    if !has_http {
        debug!("normalize: adding HTTP listener on {}", DEFAULT_HTTP_PORT);
        document.inbounds.push(Inbound::http(DEFAULT_HTTP_PORT));
    }

    document.log.loglevel = Some(ENGINE_LOG_LEVEL.to_string());
    document
}

/// Local `(socks, http)` listener ports, falling back to the defaults
pub fn extract_proxy_ports(document: &ConfigDocument) -> (u16, u16) {
    let port = |kind, default| {
        document
            .inbound(kind)
            .and_then(Inbound::port_number)
            .unwrap_or(default)
    };
    (
        port(InboundKind::Socks, DEFAULT_SOCKS_PORT),
        port(InboundKind::Http, DEFAULT_HTTP_PORT),
    )
}

/// Remote address of the first outbound using a proxy protocol
pub fn extract_server_address(document: &ConfigDocument) -> Option<String> {
    document
        .outbounds
        .iter()
        .find(|o| o.is_proxy_protocol())
        .and_then(Outbound::server)
        .and_then(|server| server.address.as_deref())
        .map(str::trim)
        .filter(|address| !address.is_empty())
        .map(String::from)
}

/// Write a document as pretty JSON, creating the parent directory
pub async fn write_document<P: AsRef<Path>>(document: &ConfigDocument, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, document.to_json_pretty()?).await?;
    debug!("Wrote engine document to {}", path.display());
    Ok(())
}
