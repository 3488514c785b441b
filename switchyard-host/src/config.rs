//! # switchyard-host — Configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use switchyard_shared::SwitchyardError;

use crate::sandbox::OverlapPolicy;

/// Top-level configuration for the Switchyard host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchyardConfig {
    /// Outbound provider calls.
    pub gateway: GatewayConfig,
    /// Health probing.
    pub monitor: MonitorConfig,
    /// Script engine limits and scheduling.
    pub sandbox: SandboxConfig,
    /// Where catalog state and the audit trail live.
    pub storage: StorageConfig,
    /// Role boundary.
    pub access: AccessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// User-Agent sent with provider calls.
    pub user_agent: String,
    /// Connect timeout applied by the HTTP client, independent of per-call deadlines.
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Hard cap on the manual health probe timeout.
    pub health_check_cap_ms: u64,
}

/// Resource limits for the Wasmtime-backed script sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Scripts must live under this directory.
    pub workspace_root: PathBuf,
    /// Wall-clock budget per run (default: 15 s).
    pub execution_budget_ms: u64,
    /// Maximum linear memory in bytes (default: 64 MiB).
    pub max_memory_bytes: usize,
    /// Fuel limit for execution metering (None = unlimited).
    pub fuel_limit: Option<u64>,
    /// Captured stdout/stderr ceiling per stream.
    pub max_output_bytes: usize,
    /// Seed the script environment with the host process variables.
    pub inherit_process_env: bool,
    /// What to do when a scheduled tick fires while the previous run is still going.
    pub overlap: OverlapPolicy,
    /// Run results kept in memory per script.
    pub history_limit: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON state document; in-memory only when absent.
    pub state_file: Option<PathBuf>,
    /// Append-only JSON lines audit trail; tracing-only when absent.
    pub audit_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Roles that pass every visibility and mutation check.
    pub privileged_roles: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("switchyard/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_ms: 10_000,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            health_check_cap_ms: 5_000,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::current_dir().unwrap_or_default(),
            execution_budget_ms: 15_000,
            max_memory_bytes: 64 * 1024 * 1024, // 64 MiB
            fuel_limit: None,
            max_output_bytes: 1024 * 1024,
            inherit_process_env: true,
            overlap: OverlapPolicy::Skip,
            history_limit: 20,
        }
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            privileged_roles: vec!["owner".into(), "admin".into()],
        }
    }
}

impl SwitchyardConfig {
    /// Load a JSON config file. Missing sections and fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, SwitchyardError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SwitchyardError::Invalid(format!("cannot read config {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            SwitchyardError::Invalid(format!("cannot parse config {}: {e}", path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: SwitchyardConfig = serde_json::from_str(
            r#"{"sandbox": {"execution_budget_ms": 500, "overlap": "serialize"}}"#,
        )
        .unwrap();
        assert_eq!(config.sandbox.execution_budget_ms, 500);
        assert_eq!(config.sandbox.overlap, OverlapPolicy::Serialize);
        assert!(config.sandbox.inherit_process_env);
        assert_eq!(SandboxConfig::default().overlap, OverlapPolicy::Skip);
        assert_eq!(config.monitor.health_check_cap_ms, 5_000);
        assert_eq!(config.access.privileged_roles, vec!["owner", "admin"]);
    }

    #[test]
    fn load_reports_unreadable_file() {
        let err = SwitchyardConfig::load(Path::new("/definitely/not/here.json")).unwrap_err();
        assert_eq!(err.code(), "invalid");
    }
}
