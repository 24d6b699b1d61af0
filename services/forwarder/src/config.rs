//! Process configuration and rules-file loading.
//!
//! The rules file is a TOML document mapping rule name to rule body:
//!
//! ```toml
//! [web]
//! source = "0.0.0.0:8000"
//! sink = "10.0.0.5:80"
//!
//! [api]
//! source = "0.0.0.0:8100"
//! enable-discovery = true
//! service = "api"
//! namespace = "default"
//! mode = "service-lookup"
//! ```
//!
//! It is loaded and parsed once per reconciliation trigger. Unparsable
//! content is fatal to the process, deliberately: the forwarder never
//! keeps serving a configuration it can no longer re-read.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::error::RulesError;
use crate::rules::Definition;

/// Read the rules file into text.
pub fn load(path: &Path) -> Result<String, RulesError> {
    std::fs::read_to_string(path).map_err(|source| RulesError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse rules text into a name-keyed Definition map.
///
/// Each Definition's `name` is filled from its map key. Unknown fields
/// in a rule body are rejected so a typo'd rules file fails loudly.
pub fn parse(path: &Path, text: &str) -> Result<BTreeMap<String, Definition>, RulesError> {
    let raw: BTreeMap<String, Definition> =
        toml::from_str(text).map_err(|source| RulesError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(raw
        .into_iter()
        .map(|(name, mut definition)| {
            definition.name = name.clone();
            (name, definition)
        })
        .collect())
}

/// Load and parse the rules file in one step.
pub fn load_rules(path: &Path) -> Result<BTreeMap<String, Definition>, RulesError> {
    let text = load(path)?;
    parse(path, &text)
}

/// Forwarder configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the rules file. Required; a missing file is fatal.
    pub rules_file: PathBuf,

    /// Service registry base URL (example: http://localhost:8080).
    /// Without it, discovery-enabled rules fall back to their sinks.
    pub registry_url: Option<String>,

    /// Optional bearer token for the registry.
    pub registry_token: Option<String>,

    /// Fallback reconciliation interval covering missed file events.
    pub reload_fallback: Duration,

    /// Telemetry queue depth before snapshots are dropped.
    pub telemetry_depth: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Default fallback reconciliation interval.
pub const DEFAULT_RELOAD_FALLBACK: Duration = Duration::from_secs(600);

/// Default telemetry queue depth.
pub const DEFAULT_TELEMETRY_DEPTH: usize = 64;

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let rules_file = std::env::var("FLOWGATE_RULES_FILE")
            .map(PathBuf::from)
            .context("Missing rules file. Set FLOWGATE_RULES_FILE.")?;

        let registry_url = std::env::var("FLOWGATE_REGISTRY_URL").ok();
        let registry_token = std::env::var("FLOWGATE_REGISTRY_TOKEN").ok();

        let reload_fallback_secs: u64 = std::env::var("FLOWGATE_RELOAD_FALLBACK_SECS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("FLOWGATE_RELOAD_FALLBACK_SECS must be an integer (seconds).")?
            .unwrap_or(DEFAULT_RELOAD_FALLBACK.as_secs());
        let reload_fallback = Duration::from_secs(reload_fallback_secs.max(1));

        let telemetry_depth: usize = std::env::var("FLOWGATE_TELEMETRY_DEPTH")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("FLOWGATE_TELEMETRY_DEPTH must be an integer.")?
            .unwrap_or(DEFAULT_TELEMETRY_DEPTH)
            .clamp(1, 4096);

        let log_level = std::env::var("FLOWGATE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            rules_file,
            registry_url,
            registry_token,
            reload_fallback,
            telemetry_depth,
            log_level,
        })
    }
}
