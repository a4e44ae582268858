//! Proxy-link parser and subscription blob resolution

use super::descriptor::{
    ConnectionDescriptor, RealityParams, Security, TlsParams, Transport, LINK_PREFIX, LINK_SCHEME,
};
use crate::common::{net::parse_port, Address};
use crate::{Error, Result};
use base64::Engine;
use std::collections::HashMap;
use tracing::debug;

/// Parse a proxy link into a connection descriptor
///
/// Format: `vless://<id>@<host>:<port>?<params>#<remark>`
pub fn parse_link(uri: &str) -> Result<ConnectionDescriptor> {
    let uri = uri.trim();

    let scheme_end = uri
        .find("://")
        .ok_or_else(|| Error::invalid_scheme(uri.split(':').next().unwrap_or_default()))?;
    let scheme = &uri[..scheme_end];
    if !scheme.eq_ignore_ascii_case(LINK_SCHEME) {
        return Err(Error::invalid_scheme(scheme));
    }
    let rest = &uri[scheme_end + 3..];

    // Split by # to get the remark
    let (rest, remark) = match rest.split_once('#') {
        Some((rest, fragment)) => (rest, decode_lossy(fragment)),
        None => (rest, String::new()),
    };

    // Split by ? to get query params
    let (authority, query) = match rest.split_once('?') {
        Some((authority, query)) => (authority, Some(query)),
        None => (rest, None),
    };

    // Anything after the authority is a path the link format does not use
    let authority = authority.split('/').next().unwrap_or_default();

    let (userinfo, host_port) = match authority.rsplit_once('@') {
        Some((userinfo, host_port)) => (Some(userinfo), host_port),
        None => (None, authority),
    };

    let (host, port) = split_host_port(host_port)?;
    let address = Address::from(host);
    let port = match port {
        Some(p) => parse_port(p)?,
        None => return Err(Error::invalid_port("missing port")),
    };

    let params = parse_query(query.unwrap_or_default())?;

    let id = match userinfo {
        Some(u) => urlencoding::decode(u)
            .map_err(|_| Error::malformed_query("identifier is not valid UTF-8"))?
            .into_owned(),
        None => String::new(),
    };
    if id.is_empty() {
        return Err(Error::malformed_query("missing user identifier"));
    }

    let security = build_security(&params)?;
    let transport = build_transport(&params);

    let descriptor = ConnectionDescriptor {
        id,
        address,
        port,
        security,
        transport,
        flow: non_empty(&params, "flow"),
        encryption: non_empty(&params, "encryption").unwrap_or_else(|| "none".to_string()),
        remark,
    };

    debug!(
        "Parsed link {} -> {} ({}/{})",
        descriptor.display_name(),
        descriptor.address.to_string_with_port(descriptor.port),
        descriptor.transport.name(),
        descriptor.security_mode()
    );

    Ok(descriptor)
}

/// Find one proxy link in a subscription payload
///
/// A payload that already is a link is returned unchanged (trimmed).
/// Otherwise it is base64-decoded and the first line carrying the link
/// scheme is returned.
pub fn resolve_from_blob(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if has_link_prefix(trimmed) {
        return Ok(trimmed.to_string());
    }

    let decoded = decode_base64_text(trimmed).ok_or(Error::NotFound)?;

    let found = split_lines(&decoded)
        .find(|line| has_link_prefix(line))
        .map(String::from);
    found.ok_or(Error::NotFound)
}

/// Parse every proxy link in a subscription payload (plain or base64)
///
/// Lines of other protocols and links that fail to parse are skipped.
pub fn parse_subscription(raw: &str) -> Vec<ConnectionDescriptor> {
    let trimmed = raw.trim();
    let text = if trimmed.lines().any(|l| l.contains("://")) {
        trimmed.to_string()
    } else {
        match decode_base64_text(trimmed) {
            Some(decoded) => decoded,
            None => return Vec::new(),
        }
    };

    split_lines(&text)
        .filter(|line| has_link_prefix(line))
        .filter_map(|line| match parse_link(line) {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                debug!("Skipping subscription line: {}", e);
                None
            }
        })
        .collect()
}

/// Check for the link scheme prefix, ignoring case
pub fn has_link_prefix(s: &str) -> bool {
    s.get(..LINK_PREFIX.len())
        .map(|p| p.eq_ignore_ascii_case(LINK_PREFIX))
        .unwrap_or(false)
}

fn split_lines(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| c == '\n' || c == '\r')
        .map(str::trim)
        .filter(|l| !l.is_empty())
}

/// Decode base64 text, tolerating missing padding, the URL-safe alphabet
/// and embedded line wrapping
fn decode_base64_text(s: &str) -> Option<String> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};

    let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }

    let bytes = STANDARD
        .decode(&compact)
        .or_else(|_| STANDARD_NO_PAD.decode(&compact))
        .or_else(|_| URL_SAFE.decode(&compact))
        .or_else(|_| URL_SAFE_NO_PAD.decode(&compact))
        .ok()?;

    String::from_utf8(bytes).ok()
}

/// Split `host:port`, honouring bracketed IPv6 literals
fn split_host_port(s: &str) -> Result<(&str, Option<&str>)> {
    if let Some(stripped) = s.strip_prefix('[') {
        let end = stripped.find(']').ok_or(Error::MissingHost)?;
        let host = &stripped[..end];
        if host.is_empty() {
            return Err(Error::MissingHost);
        }
        let tail = &stripped[end + 1..];
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p),
            None if tail.is_empty() => None,
            None => return Err(Error::invalid_port(tail)),
        };
        return Ok((host, port));
    }

    let (host, port) = match s.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (s, None),
    };
    if host.is_empty() {
        return Err(Error::MissingHost);
    }
    Ok((host, port))
}

fn parse_query(query: &str) -> Result<HashMap<String, String>> {
    let mut params = HashMap::new();

    for param in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = param.split_once('=').unwrap_or((param, ""));
        let key = urlencoding::decode(key)
            .map_err(|_| Error::malformed_query(format!("invalid encoding in key '{}'", key)))?;
        let value = urlencoding::decode(value)
            .map_err(|_| Error::malformed_query(format!("invalid encoding in '{}'", key)))?;
        if key.is_empty() {
            return Err(Error::malformed_query(format!("empty key in '{}'", param)));
        }
        params.insert(key.into_owned(), value.into_owned());
    }

    Ok(params)
}

fn build_security(params: &HashMap<String, String>) -> Result<Security> {
    let mode = params
        .get("security")
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default();

    let sni = non_empty(params, "sni").or_else(|| non_empty(params, "serverName"));
    let fingerprint = non_empty(params, "fp");

    match mode.as_str() {
        "" | "none" => Ok(Security::None),
        "tls" => Ok(Security::Tls(TlsParams {
            sni,
            fingerprint,
            alpn: params
                .get("alpn")
                .map(|a| {
                    a.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        })),
        "reality" => {
            let public_key = non_empty(params, "pbk")
                .ok_or_else(|| Error::malformed_query("reality requires pbk"))?;
            Ok(Security::Reality(RealityParams {
                sni,
                fingerprint,
                public_key,
                short_id: non_empty(params, "sid"),
            }))
        }
        other => Err(Error::malformed_query(format!(
            "unsupported security '{}'",
            other
        ))),
    }
}

fn build_transport(params: &HashMap<String, String>) -> Transport {
    let name = params
        .get("type")
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "tcp".to_string());

    match name.as_str() {
        "tcp" => Transport::Tcp,
        "ws" => Transport::Ws {
            path: non_empty(params, "path"),
            host: non_empty(params, "host"),
        },
        "grpc" => Transport::Grpc {
            service_name: non_empty(params, "serviceName"),
        },
        _ => Transport::Other { name },
    }
}

fn non_empty(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn decode_lossy(s: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(s.as_bytes())).into_owned()
}
