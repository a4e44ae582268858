//! Error types for the tunnel core

use std::io;
use thiserror::Error;

/// Crate error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing host")]
    MissingHost,

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Malformed query: {0}")]
    MalformedQuery(String),

    #[error("No proxy link found")]
    NotFound,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("Network settings error: {0}")]
    Settings(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid_scheme<S: Into<String>>(scheme: S) -> Self {
        Error::InvalidScheme(scheme.into())
    }

    pub fn invalid_port<S: Into<String>>(msg: S) -> Self {
        Error::InvalidPort(msg.into())
    }

    pub fn malformed_query<S: Into<String>>(msg: S) -> Self {
        Error::MalformedQuery(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn dns<S: Into<String>>(msg: S) -> Self {
        Error::Dns(msg.into())
    }

    pub fn settings<S: Into<String>>(msg: S) -> Self {
        Error::Settings(msg.into())
    }

    pub fn engine<S: Into<String>>(msg: S) -> Self {
        Error::Engine(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// True for the errors produced while decoding a single proxy link.
    pub fn is_link_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidScheme(_)
                | Error::MissingHost
                | Error::InvalidPort(_)
                | Error::MalformedQuery(_)
        )
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;
