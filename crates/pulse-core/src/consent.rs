//! Consent resolution.
//!
//! Decides whether telemetry is enabled and at what data level, combining
//! local configuration, a cached remote answer, and tier-based defaults.
//! Resolution never fails: any network or service problem falls through to
//! conservative defaults, so the caller always gets a usable status.

use crate::config::TelemetryConfig;
use crate::session::{DataLevel, Tier};
use crate::transport::{TelemetryTransport, TransportError};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How long a remote consent answer stays valid.
pub const CONSENT_TTL: Duration = Duration::from_secs(300);

/// Resolved telemetry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    pub tier: Tier,

    pub telemetry_enabled: bool,

    pub data_level: DataLevel,
}

/// Shape of `GET /api/v1/consent`. The tier comes back as a free-form
/// string so new server-side tiers don't break old clients.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsentWire {
    #[serde(default)]
    user_id: Option<String>,
    tier: String,
    telemetry_enabled: bool,
    data_level: DataLevel,
}

struct CacheEntry {
    status: ConsentStatus,
    fetched_at: Instant,
}

/// Resolves and caches the effective consent policy.
///
/// The resolver is the sole owner and mutator of the cache entry. Callers
/// must invalidate it via [`clear_cache`](Self::clear_cache) whenever
/// consent-relevant configuration changes.
pub struct ConsentResolver {
    config: TelemetryConfig,
    transport: Arc<dyn TelemetryTransport>,
    cache: Mutex<Option<CacheEntry>>,
}

impl ConsentResolver {
    pub fn new(config: TelemetryConfig, transport: Arc<dyn TelemetryTransport>) -> Self {
        Self {
            config,
            transport,
            cache: Mutex::new(None),
        }
    }

    /// Resolve the consent status. Each step short-circuits:
    ///
    /// 1. Local configuration explicitly disables telemetry.
    /// 2. A non-expired cached answer exists (authenticated only).
    /// 3. The consent endpoint answers; local overrides apply on top.
    /// 4. Tier-based defaults.
    ///
    /// Blocking (network); call from `spawn_blocking` in async contexts.
    pub fn resolve(&self, authenticated: bool) -> ConsentStatus {
        if self.config.enabled == Some(false) {
            return ConsentStatus {
                user_id: None,
                tier: Tier::Free,
                telemetry_enabled: false,
                data_level: DataLevel::MetricsOnly,
            };
        }

        if authenticated {
            if let Some(cached) = self.cached() {
                return cached;
            }

            match self.fetch_remote() {
                Ok(mut status) => {
                    if let Some(enabled) = self.config.enabled {
                        status.telemetry_enabled = enabled;
                    }
                    if let Some(level) = self.config.data_level {
                        status.data_level = level;
                    }
                    *self.cache.lock().unwrap() = Some(CacheEntry {
                        status: status.clone(),
                        fetched_at: Instant::now(),
                    });
                    return status;
                }
                Err(e) => {
                    log::debug!("Consent lookup failed, falling back to defaults: {}", e);
                }
            }
        }

        self.default_status(authenticated)
    }

    /// Drop the cached answer. Must be called whenever the user changes
    /// consent-relevant configuration.
    pub fn clear_cache(&self) {
        *self.cache.lock().unwrap() = None;
    }

    fn cached(&self) -> Option<ConsentStatus> {
        let cache = self.cache.lock().unwrap();
        cache
            .as_ref()
            .filter(|entry| entry.fetched_at.elapsed() < CONSENT_TTL)
            .map(|entry| entry.status.clone())
    }

    fn fetch_remote(&self) -> Result<ConsentStatus, TransportError> {
        let value = self.transport.get("/api/v1/consent")?;
        let wire: ConsentWire = serde_json::from_value(value)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        Ok(ConsentStatus {
            user_id: wire.user_id,
            tier: Tier::parse(&wire.tier),
            telemetry_enabled: wire.telemetry_enabled,
            data_level: wire.data_level,
        })
    }

    /// Defaults when no service answer is available. Telemetry is on by
    /// default only for the free tier; configuration can override either
    /// way.
    fn default_status(&self, authenticated: bool) -> ConsentStatus {
        let tier = if authenticated {
            Tier::Standard
        } else {
            Tier::Free
        };
        ConsentStatus {
            user_id: None,
            tier,
            telemetry_enabled: self.config.enabled.unwrap_or(tier == Tier::Free),
            data_level: self.config.data_level.unwrap_or(DataLevel::Full),
        }
    }

    /// Backdate the cache entry so TTL expiry is testable.
    #[cfg(test)]
    fn age_cache(&self, age: Duration) {
        if let Some(entry) = self.cache.lock().unwrap().as_mut() {
            entry.fetched_at = Instant::now() - age;
        }
    }
}
