//! Routing policy and rule generation

use super::geo::Country;
use crate::config::descriptor::ConnectionDescriptor;
use crate::config::document::{RoutingRule, DIRECT_TAG, PROXY_TAG};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// User routing preferences
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RoutingPolicy {
    /// ISO 3166 country code of the user's home country
    pub country_code: Option<String>,

    /// Domains that always go direct
    pub custom_domains: Vec<String>,

    /// Send the country's top-level domain direct
    pub bypass_tld: bool,

    /// Send government and banking sites direct
    pub bypass_government: bool,

    /// Send streaming services direct
    pub bypass_streaming: bool,

    /// Send e-commerce sites direct
    pub bypass_ecommerce: bool,
}

impl RoutingPolicy {
    /// Country from the geo data, `None` for a missing or unknown code
    pub fn known_country(&self) -> Option<Country> {
        self.country_code.as_deref().and_then(Country::lookup)
    }

    /// Any of the bypass categories that match on IP ranges
    pub fn wants_ip_bypass(&self) -> bool {
        self.bypass_government || self.bypass_streaming || self.bypass_ecommerce
    }

    /// Custom domains, normalized, in supplied order with duplicates removed
    pub fn domains(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.custom_domains
            .iter()
            .filter_map(|d| normalize_domain(d))
            .filter(|d| seen.insert(d.clone()))
            .collect()
    }

    /// True when the policy produces no rules at all
    pub fn is_inert(&self) -> bool {
        self.known_country().is_none() && self.domains().is_empty()
    }
}

/// Lower-case a domain and strip wildcard and dot decorations
fn normalize_domain(raw: &str) -> Option<String> {
    let domain = raw.trim().to_ascii_lowercase();
    let domain = domain.strip_prefix("*.").unwrap_or(&domain);
    let domain = domain.trim_matches('.');
    if domain.is_empty() || domain.contains(char::is_whitespace) {
        None
    } else {
        Some(domain.to_string())
    }
}

/// Build the ordered rule list for a policy
///
/// Order: custom domains, country TLD, country IP ranges, catch-all to the
/// proxy. Country rules are only emitted for a country the geo data knows.
pub fn build_rules(descriptor: &ConnectionDescriptor, policy: &RoutingPolicy) -> Vec<RoutingRule> {
    if policy.is_inert() {
        debug!(
            "Routing policy inert for {}, no rules",
            descriptor.display_name()
        );
        return Vec::new();
    }

    let mut rules: Vec<RoutingRule> = policy
        .domains()
        .into_iter()
        .map(|domain| RoutingRule::domain_suffix(domain, DIRECT_TAG))
        .collect();

    if let Some(country) = policy.known_country() {
        if policy.bypass_tld {
            rules.push(RoutingRule::domain_suffix(country.tld(), DIRECT_TAG));
        }
        if policy.wants_ip_bypass() {
            rules.push(RoutingRule::ip_range(country.geoip_selector(), DIRECT_TAG));
        }
    } else if let Some(code) = &policy.country_code {
        debug!("Country code {:?} not in geo data, skipping country rules", code);
    }

    rules.push(RoutingRule::catch_all(PROXY_TAG));

    debug!(
        "Built {} routing rules for {}",
        rules.len(),
        descriptor.display_name()
    );
    rules
}
