//! Service catalog and resilience types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_BURST_MULTIPLIER: f64 = 1.2;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_COOLDOWN_SECONDS: u64 = 60;
pub const DEFAULT_MINIMUM_SAMPLES: usize = 5;

/// What a provider offers. Anything outside this set is dropped on register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Tools,
    Files,
    Secrets,
    Events,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Tools,
        Capability::Files,
        Capability::Secrets,
        Capability::Events,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Tools => "tools",
            Capability::Files => "files",
            Capability::Secrets => "secrets",
            Capability::Events => "events",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown capability: {s}"))
    }
}

/// Catalog record for one reachable tool provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Empty means visible to every role.
    #[serde(default)]
    pub allowed_roles: Vec<String>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl ServiceDescriptor {
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Unsanitized registration input, as received from an operator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub allowed_roles: Option<Vec<String>>,
}

impl From<&ServiceDescriptor> for ServiceRegistration {
    fn from(d: &ServiceDescriptor) -> Self {
        Self {
            name: d.name.clone(),
            base_url: d.base_url.clone(),
            description: d.description.clone(),
            capabilities: d.capabilities.iter().map(|c| c.to_string()).collect(),
            auth_token: d.auth_token.clone(),
            timeout_ms: Some(d.timeout_ms),
            allowed_roles: Some(d.allowed_roles.clone()),
        }
    }
}

// ─── Policy ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuotaPolicy {
    /// `None` means no ceiling.
    pub limit_per_minute: Option<u32>,
    pub burst_multiplier: f64,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            limit_per_minute: None,
            burst_multiplier: DEFAULT_BURST_MULTIPLIER,
        }
    }
}

impl QuotaPolicy {
    /// Calls admitted per trailing minute: `ceil(limit * burst)`.
    ///
    /// The product is rounded to micro-units first so that `100 * 1.1`
    /// yields 110 rather than 111.
    pub fn ceiling(&self) -> Option<usize> {
        self.limit_per_minute.map(|limit| {
            let raw = f64::from(limit) * self.burst_multiplier.max(0.0);
            ((raw * 1e6).round() / 1e6).ceil() as usize
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerPolicy {
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
    pub minimum_samples: usize,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown_seconds: DEFAULT_COOLDOWN_SECONDS,
            minimum_samples: DEFAULT_MINIMUM_SAMPLES,
        }
    }
}

/// Per-service resilience configuration. Every field falls back to its own
/// default when absent, so persisted partial documents merge over defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServicePolicy {
    pub quota: QuotaPolicy,
    pub circuit_breaker: CircuitBreakerPolicy,
}

/// Policy update where every omitted field resets to its default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyPatch {
    pub limit_per_minute: Option<u32>,
    pub burst_multiplier: Option<f64>,
    pub failure_threshold: Option<u32>,
    pub cooldown_seconds: Option<u64>,
    pub minimum_samples: Option<usize>,
}

impl PolicyPatch {
    pub fn into_policy(self) -> ServicePolicy {
        let defaults = ServicePolicy::default();
        ServicePolicy {
            quota: QuotaPolicy {
                limit_per_minute: self.limit_per_minute,
                burst_multiplier: self
                    .burst_multiplier
                    .unwrap_or(defaults.quota.burst_multiplier),
            },
            circuit_breaker: CircuitBreakerPolicy {
                failure_threshold: self
                    .failure_threshold
                    .unwrap_or(defaults.circuit_breaker.failure_threshold),
                cooldown_seconds: self
                    .cooldown_seconds
                    .unwrap_or(defaults.circuit_breaker.cooldown_seconds),
                minimum_samples: self
                    .minimum_samples
                    .unwrap_or(defaults.circuit_breaker.minimum_samples),
            },
        }
    }
}

// ─── Runtime observations ───────────────────────────────────────────────────

/// One observed call outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallSample {
    pub timestamp: u64,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl CallSample {
    pub fn success(timestamp: u64, duration_ms: u64) -> Self {
        Self {
            timestamp,
            duration_ms,
            success: true,
            error_message: None,
        }
    }

    pub fn failure(timestamp: u64, duration_ms: u64, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            duration_ms,
            success: false,
            error_message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLabel {
    Healthy,
    Degraded,
    Unreachable,
}

/// Result of an explicit probe, or the synthetic record left by a circuit trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManualCheck {
    pub status: HealthLabel,
    pub checked_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuotaUsage {
    pub used: usize,
    pub ceiling: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitState {
    pub open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_until: Option<u64>,
}

/// Aggregate view of one monitored service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceStatus {
    pub name: String,
    pub health: HealthLabel,
    pub success_count: usize,
    pub failure_count: usize,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub quota: QuotaUsage,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    pub last_success_at: Option<u64>,
    pub last_error_at: Option<u64>,
    pub last_error_message: Option<String>,
    pub last_manual_check: Option<ManualCheck>,
    pub policy: ServicePolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_parse_is_case_insensitive() {
        assert_eq!("Files".parse::<Capability>(), Ok(Capability::Files));
        assert!("shell".parse::<Capability>().is_err());
    }

    #[test]
    fn quota_ceiling_rounds_up() {
        let quota = QuotaPolicy {
            limit_per_minute: Some(10),
            burst_multiplier: 1.2,
        };
        assert_eq!(quota.ceiling(), Some(12));

        let quota = QuotaPolicy {
            limit_per_minute: Some(100),
            burst_multiplier: 1.1,
        };
        assert_eq!(quota.ceiling(), Some(110));

        let quota = QuotaPolicy {
            limit_per_minute: Some(3),
            burst_multiplier: 1.1,
        };
        assert_eq!(quota.ceiling(), Some(4));

        assert_eq!(QuotaPolicy::default().ceiling(), None);
    }

    #[test]
    fn partial_policy_document_merges_over_defaults() {
        let policy: ServicePolicy =
            serde_json::from_str(r#"{"circuit_breaker": {"failure_threshold": 7}}"#).unwrap();
        assert_eq!(policy.circuit_breaker.failure_threshold, 7);
        assert_eq!(policy.circuit_breaker.cooldown_seconds, 60);
        assert_eq!(policy.circuit_breaker.minimum_samples, 5);
        assert_eq!(policy.quota.burst_multiplier, 1.2);
        assert_eq!(policy.quota.limit_per_minute, None);
    }

    #[test]
    fn patch_fills_unspecified_fields_with_defaults() {
        let policy = PolicyPatch {
            limit_per_minute: Some(30),
            cooldown_seconds: Some(5),
            ..Default::default()
        }
        .into_policy();
        assert_eq!(policy.quota.limit_per_minute, Some(30));
        assert_eq!(policy.quota.burst_multiplier, 1.2);
        assert_eq!(policy.circuit_breaker.failure_threshold, 3);
        assert_eq!(policy.circuit_breaker.cooldown_seconds, 5);
    }

    #[test]
    fn descriptor_defaults_timeout_when_absent() {
        let d: ServiceDescriptor =
            serde_json::from_str(r#"{"name": "a", "base_url": "http://a"}"#).unwrap();
        assert_eq!(d.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert!(d.allowed_roles.is_empty());
    }
}
