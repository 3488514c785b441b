//! Sandbox script, environment and run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxScriptDefinition {
    pub id: String,
    pub name: String,
    /// Absolute path; must resolve inside the configured workspace root.
    pub entry_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Values greater than zero enable periodic execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_ms: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
}

impl SandboxScriptDefinition {
    pub fn schedule_period_ms(&self) -> Option<u64> {
        self.schedule_ms.filter(|ms| *ms > 0)
    }
}

/// Named, reusable variable bundle referenced by scripts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxEnvironmentDefinition {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Manual,
    Schedule,
}

/// Immutable record of one script execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxRunResult {
    pub run_id: String,
    pub script_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: RunStatus,
    pub output: String,
    /// Present iff `status` is `Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub trigger: RunTrigger,
    /// Requesting identity for manual runs; absent for scheduled runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl SandboxRunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// One registry, policy or sandbox mutation, as handed to the audit sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub resource: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl AuditEvent {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            at: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            resource: resource.into(),
            detail,
        }
    }
}
