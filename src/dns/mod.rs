//! DNS resolver module

mod resolver;

pub use resolver::SystemResolver;
