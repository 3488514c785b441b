//! # switchyard-shared
//!
//! Types shared between the host runtime and anything that talks to it:
//! the service catalog, per-service resilience policy and status, sandbox
//! script records, and the error taxonomy.

pub mod sandbox;
pub mod service;

pub use sandbox::*;
pub use service::*;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SwitchyardError {
    #[error("Unknown service: {name}")]
    ServiceNotFound { name: String },

    #[error("Unknown script: {id}")]
    ScriptNotFound { id: String },

    #[error("Unknown environment: {id}")]
    EnvironmentNotFound { id: String },

    #[error("Environment {id} is still referenced by scripts: {}", .scripts.join(", "))]
    EnvironmentInUse { id: String, scripts: Vec<String> },

    #[error("Invalid definition: {0}")]
    Invalid(String),

    #[error("Role '{role}' may not access {resource}")]
    Forbidden { role: String, resource: String },

    #[error("Quota exceeded for {service}: {used}/{ceiling} calls in the last minute")]
    QuotaExceeded {
        service: String,
        used: usize,
        ceiling: usize,
    },

    #[error("Circuit open for {service} until {open_until_ms}")]
    CircuitOpen { service: String, open_until_ms: u64 },

    #[error("Call to {service}/{tool} timed out after {duration_ms}ms")]
    Timeout {
        service: String,
        tool: String,
        duration_ms: u64,
    },

    #[error("Call to {service}/{tool} failed after {duration_ms}ms: {message}")]
    Transport {
        service: String,
        tool: String,
        duration_ms: u64,
        message: String,
    },

    #[error("{service}/{tool} responded {status} after {duration_ms}ms: {body}")]
    Upstream {
        service: String,
        tool: String,
        status: u16,
        duration_ms: u64,
        body: String,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwitchyardError {
    /// Stable machine-readable code for callers mapping errors onto their own
    /// surface (HTTP status, CLI exit code, UI badge).
    pub fn code(&self) -> &'static str {
        match self {
            Self::ServiceNotFound { .. }
            | Self::ScriptNotFound { .. }
            | Self::EnvironmentNotFound { .. } => "not_found",
            Self::EnvironmentInUse { .. } => "conflict",
            Self::Invalid(_) => "invalid",
            Self::Forbidden { .. } => "forbidden",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Timeout { .. } => "timeout",
            Self::Transport { .. } => "transport_error",
            Self::Upstream { .. } => "upstream_error",
            Self::Persistence(_) => "persistence_error",
            Self::Internal(_) => "internal",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::ServiceNotFound { .. }
            | Self::ScriptNotFound { .. }
            | Self::EnvironmentNotFound { .. } => 404,
            Self::EnvironmentInUse { .. } => 409,
            Self::Invalid(_) => 400,
            Self::Forbidden { .. } => 403,
            Self::QuotaExceeded { .. } => 429,
            Self::CircuitOpen { .. } => 503,
            Self::Timeout { .. } => 504,
            Self::Transport { .. } | Self::Upstream { .. } => 502,
            Self::Persistence(_) | Self::Internal(_) => 500,
        }
    }

    /// Rejected before any network or execution attempt.
    pub fn is_admission(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. } | Self::CircuitOpen { .. })
    }

    /// Observed duration for failures that actually reached the provider.
    pub fn duration_ms(&self) -> Option<u64> {
        match self {
            Self::Timeout { duration_ms, .. }
            | Self::Transport { duration_ms, .. }
            | Self::Upstream { duration_ms, .. } => Some(*duration_ms),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SwitchyardError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<std::io::Error> for SwitchyardError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SwitchyardError>;

/// Identity presented at the role boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub role: String,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
        }
    }
}

/// Wall clock in Unix epoch milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_errors_are_distinguishable_from_call_failures() {
        let quota = SwitchyardError::QuotaExceeded {
            service: "files".into(),
            used: 12,
            ceiling: 12,
        };
        let upstream = SwitchyardError::Upstream {
            service: "files".into(),
            tool: "list".into(),
            status: 500,
            duration_ms: 42,
            body: "oops".into(),
        };
        assert!(quota.is_admission());
        assert_eq!(quota.code(), "quota_exceeded");
        assert_eq!(quota.http_status(), 429);
        assert_eq!(quota.duration_ms(), None);

        assert!(!upstream.is_admission());
        assert_eq!(upstream.code(), "upstream_error");
        assert_eq!(upstream.duration_ms(), Some(42));
    }

    #[test]
    fn environment_in_use_lists_scripts() {
        let err = SwitchyardError::EnvironmentInUse {
            id: "prod".into(),
            scripts: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.code(), "conflict");
        assert!(err.to_string().contains("a, b"));
    }
}
