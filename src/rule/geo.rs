//! Country table and `geoip.dat` trimming
//!
//! The engine loads `geoip.dat` from the data directory. The bundled copy is
//! trimmed to the countries below, so an ip-range rule can only reference one
//! of them.

use crate::{Error, Result};
use prost::Message;
use std::collections::HashSet;
use tracing::{debug, info};

/// Countries carried by the bundled geo data, with their top-level domain
const COUNTRIES: &[(&str, &str)] = &[
    ("DE", "de"),
    ("GB", "uk"),
    ("FR", "fr"),
    ("NL", "nl"),
    ("RU", "ru"),
    ("US", "us"),
    ("TR", "tr"),
    ("IT", "it"),
    ("ES", "es"),
    ("PL", "pl"),
    ("UA", "ua"),
    ("KZ", "kz"),
    ("AE", "ae"),
    ("IL", "il"),
    ("CN", "cn"),
    ("BR", "br"),
    ("JP", "jp"),
    ("KR", "kr"),
    ("IN", "in"),
    ("AU", "au"),
    ("CA", "ca"),
];

/// A country the geo data knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Country {
    code: &'static str,
    tld: &'static str,
}

impl Country {
    /// Look up a country code, ignoring case and surrounding whitespace
    pub fn lookup(code: &str) -> Option<Country> {
        let code = code.trim();
        COUNTRIES
            .iter()
            .find(|(c, _)| c.eq_ignore_ascii_case(code))
            .map(|&(code, tld)| Country { code, tld })
    }

    /// Upper-case ISO 3166 code
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Country top-level domain without the dot
    pub fn tld(&self) -> &'static str {
        self.tld
    }

    /// Engine selector for the country's IP ranges
    pub fn geoip_selector(&self) -> String {
        format!("geoip:{}", self.code.to_ascii_lowercase())
    }
}

/// All country codes the bundled geo data carries
pub fn supported_countries() -> impl Iterator<Item = &'static str> {
    COUNTRIES.iter().map(|(code, _)| *code)
}

/// `GeoIPList` message of the engine's geo data
#[derive(Clone, PartialEq, prost::Message)]
pub struct GeoIpList {
    #[prost(message, repeated, tag = "1")]
    pub entry: Vec<GeoIp>,
}

/// One country (or named set) of IP ranges
#[derive(Clone, PartialEq, prost::Message)]
pub struct GeoIp {
    #[prost(string, tag = "1")]
    pub country_code: String,
    #[prost(message, repeated, tag = "2")]
    pub cidr: Vec<Cidr>,
    #[prost(bool, tag = "3")]
    pub reverse_match: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Cidr {
    /// 4 or 16 address bytes
    #[prost(bytes = "vec", tag = "1")]
    pub ip: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub prefix: u32,
}

/// Decode a `geoip.dat` file
pub fn decode_geoip(data: &[u8]) -> Result<GeoIpList> {
    GeoIpList::decode(data).map_err(|e| Error::parse(format!("invalid geoip data: {}", e)))
}

/// Re-encode a `GeoIPList` keeping only the given countries
///
/// Codes are compared upper-cased; `keep` must hold upper-case codes.
pub fn strip_geoip(data: &[u8], keep: &HashSet<String>) -> Result<Vec<u8>> {
    let mut list = decode_geoip(data)?;
    let total = list.entry.len();

    list.entry.retain(|entry| {
        let kept = keep.contains(&entry.country_code.to_ascii_uppercase());
        if kept {
            debug!("Keeping geoip entry {} ({} ranges)", entry.country_code, entry.cidr.len());
        }
        kept
    });

    let out = list.encode_to_vec();
    info!(
        "geoip: kept {}/{} entries, {} -> {} bytes",
        list.entry.len(),
        total,
        data.len(),
        out.len()
    );
    Ok(out)
}

/// The default keep-set: every supported country
pub fn default_keep_set() -> HashSet<String> {
    supported_countries().map(String::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geoip_entry(code: &str, ranges: &[([u8; 4], u32)]) -> GeoIp {
        GeoIp {
            country_code: code.to_string(),
            cidr: ranges
                .iter()
                .map(|(ip, prefix)| Cidr {
                    ip: ip.to_vec(),
                    prefix: *prefix,
                })
                .collect(),
            reverse_match: false,
        }
    }

    #[test]
    fn test_country_lookup() {
        let de = Country::lookup(" de ").unwrap();
        assert_eq!(de.code(), "DE");
        assert_eq!(de.tld(), "de");
        assert_eq!(de.geoip_selector(), "geoip:de");
        assert_eq!(Country::lookup("GB").unwrap().tld(), "uk");
        assert!(Country::lookup("ZZ").is_none());
        assert!(Country::lookup("").is_none());
        assert_eq!(supported_countries().count(), 21);
    }

    #[test]
    fn test_strip_geoip_keeps_selected() {
        let private: Vec<([u8; 4], u32)> = (0..50).map(|i| ([10, i, 0, 0], 16)).collect();
        let data = GeoIpList {
            entry: vec![
                geoip_entry("DE", &[([5, 1, 0, 0], 16), ([31, 0, 0, 0], 8)]),
                geoip_entry("private", &private),
                geoip_entry("us", &[([3, 0, 0, 0], 8)]),
            ],
        }
        .encode_to_vec();
        let keep: HashSet<String> = ["DE", "US"].iter().map(|s| s.to_string()).collect();

        let stripped = decode_geoip(&strip_geoip(&data, &keep).unwrap()).unwrap();
        let codes: Vec<&str> = stripped.entry.iter().map(|e| e.country_code.as_str()).collect();
        assert_eq!(codes, vec!["DE", "us"]);
        assert_eq!(stripped.entry[0].cidr[1], Cidr { ip: vec![31, 0, 0, 0], prefix: 8 });
    }

    #[test]
    fn test_strip_geoip_keeps_reverse_match() {
        let mut entry = geoip_entry("CN", &[([1, 0, 1, 0], 24)]);
        entry.reverse_match = true;
        let data = GeoIpList { entry: vec![entry] }.encode_to_vec();

        let stripped = decode_geoip(&strip_geoip(&data, &default_keep_set()).unwrap()).unwrap();
        assert!(stripped.entry[0].reverse_match);
    }

    #[test]
    fn test_truncated_geoip_is_error() {
        let mut data = GeoIpList {
            entry: vec![geoip_entry("DE", &[([5, 1, 0, 0], 16)])],
        }
        .encode_to_vec();
        data.truncate(data.len() - 2);
        assert!(decode_geoip(&data).is_err());
        assert!(strip_geoip(&data, &default_keep_set()).is_err());
    }
}
