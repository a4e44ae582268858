//! Routing policy resolver
//!
//! Turns a [`RoutingPolicy`] into the ordered rule list placed in the engine
//! document. Rules are matched first-to-last by the engine.

pub mod geo;
mod policy;

pub use crate::config::document::{RoutingRule, RuleMatch};
pub use geo::{strip_geoip, Country};
pub use policy::{build_rules, RoutingPolicy};
