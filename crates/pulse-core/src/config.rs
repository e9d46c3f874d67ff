//! Telemetry configuration.
//!
//! The host application loads its settings file and hands the telemetry
//! section to this crate as a plain `TelemetryConfig`. Every field is
//! optional; defaults are applied here so the host never has to know them.

use crate::session::{DataLevel, Environment};
use serde::Deserialize;
use std::time::Duration;

/// Default remote collection endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://telemetry.pulse.dev";

/// Default number of buffered turns that triggers a flush.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Default interval after which buffered turns are flushed regardless of
/// batch size.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Telemetry settings consumed from the host's configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetryConfig {
    /// Explicit enable/disable override. `Some(false)` wins over everything,
    /// including the consent service.
    pub enabled: Option<bool>,

    /// Data level override applied on top of the consent answer.
    pub data_level: Option<DataLevel>,

    /// Custom collection endpoint.
    pub endpoint: Option<String>,

    /// Turns buffered before a size-triggered flush.
    pub batch_size: Option<usize>,

    /// Seconds before a time-triggered flush.
    pub flush_interval_secs: Option<u64>,

    /// Additional glob patterns for paths whose content must never be
    /// collected, on top of the built-in sensitive-file patterns.
    pub exclude_patterns: Vec<String>,

    /// Environment override; detected from the process environment when
    /// absent.
    pub environment: Option<Environment>,
}

impl TelemetryConfig {
    pub fn endpoint(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT)
    }

    pub fn batch_size(&self) -> usize {
        // A zero batch size would flush on every turn; clamp to 1 so the
        // arithmetic downstream stays sane.
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1)
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_FLUSH_INTERVAL)
    }

    pub fn environment(&self) -> Environment {
        self.environment.unwrap_or_else(Environment::detect)
    }
}
