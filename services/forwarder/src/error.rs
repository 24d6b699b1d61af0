//! Error types for the forwarder.

use std::path::PathBuf;

use thiserror::Error;

/// Rules-file failures.
///
/// Both variants are fatal to the process: a forwarder running on a
/// snapshot it cannot read or parse would silently diverge from the
/// declared configuration.
#[derive(Debug, Error)]
pub enum RulesError {
    /// Rules file missing or unreadable.
    #[error("failed to read rules file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Rules content is not a valid rules document.
    #[error("failed to parse rules file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Service-registry lookup failures.
///
/// Never fatal: callers log these and retain the previously resolved
/// endpoint set.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Transport-level failure talking to the registry.
    #[error("registry request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Registry answered with a non-success status.
    #[error("registry returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// Resolver has no entry for the requested service.
    #[error("no endpoints known for {service}.{namespace}")]
    UnknownService { service: String, namespace: String },

    /// Registry token could not be turned into a request header.
    #[error("invalid registry token: {0}")]
    InvalidToken(String),
}
