//! # switchyard-host — Audit and run log sinks
//!
//! Callers treat these as fire-and-forget: a failed append is logged and
//! never undoes the action it describes.

use async_trait::async_trait;
use std::path::PathBuf;
use switchyard_shared::{AuditEvent, SandboxRunResult, SwitchyardError};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append_run_result(&self, result: &SandboxRunResult) -> Result<(), SwitchyardError>;
    async fn append_audit_event(&self, event: &AuditEvent) -> Result<(), SwitchyardError>;
}

/// Record an audit event, logging instead of failing.
pub async fn record(audit: &dyn AuditLog, event: AuditEvent) {
    if let Err(e) = audit.append_audit_event(&event).await {
        warn!(
            action = %event.action,
            resource = %event.resource,
            error = %e,
            "Audit event could not be written"
        );
    }
}

/// Emits every record as a structured tracing event under `switchyard::audit`.
#[derive(Debug, Default)]
pub struct TracingAuditLog;

#[async_trait]
impl AuditLog for TracingAuditLog {
    async fn append_run_result(&self, result: &SandboxRunResult) -> Result<(), SwitchyardError> {
        info!(
            target: "switchyard::audit",
            run_id = %result.run_id,
            script_id = %result.script_id,
            status = ?result.status,
            trigger = ?result.trigger,
            duration_ms = result.duration_ms,
            error = result.error.as_deref().unwrap_or(""),
            "sandbox run"
        );
        Ok(())
    }

    async fn append_audit_event(&self, event: &AuditEvent) -> Result<(), SwitchyardError> {
        info!(
            target: "switchyard::audit",
            actor = %event.actor,
            action = %event.action,
            resource = %event.resource,
            detail = %event.detail,
            "audit"
        );
        Ok(())
    }
}

/// Append-only JSON lines file. Each line is `{"kind": ..., "record": ...}`.
#[derive(Debug)]
pub struct JsonlAuditLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn append(&self, kind: &str, record: serde_json::Value) -> Result<(), SwitchyardError> {
        let mut line = serde_json::to_vec(&serde_json::json!({ "kind": kind, "record": record }))?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl AuditLog for JsonlAuditLog {
    async fn append_run_result(&self, result: &SandboxRunResult) -> Result<(), SwitchyardError> {
        self.append("run", serde_json::to_value(result)?).await
    }

    async fn append_audit_event(&self, event: &AuditEvent) -> Result<(), SwitchyardError> {
        self.append("audit", serde_json::to_value(event)?).await
    }
}

/// In-process sink that keeps everything it receives.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    runs: parking_lot::Mutex<Vec<SandboxRunResult>>,
    events: parking_lot::Mutex<Vec<AuditEvent>>,
    fail_runs: std::sync::atomic::AtomicBool,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> Vec<SandboxRunResult> {
        self.runs.lock().clone()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Make every subsequent run append fail, to exercise the swallow path.
    pub fn fail_run_appends(&self, fail: bool) {
        self.fail_runs
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn append_run_result(&self, result: &SandboxRunResult) -> Result<(), SwitchyardError> {
        if self.fail_runs.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SwitchyardError::Persistence("run log unavailable".into()));
        }
        self.runs.lock().push(result.clone());
        Ok(())
    }

    async fn append_audit_event(&self, event: &AuditEvent) -> Result<(), SwitchyardError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jsonl_log_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("trail.jsonl");
        let log = JsonlAuditLog::new(&path);

        log.append_audit_event(&AuditEvent::new(
            "ops",
            "service.register",
            "service:files",
            serde_json::json!({"base_url": "http://files"}),
        ))
        .await
        .unwrap();
        log.append_audit_event(&AuditEvent::new(
            "ops",
            "service.unregister",
            "service:files",
            serde_json::Value::Null,
        ))
        .await
        .unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "audit");
        assert_eq!(lines[1]["record"]["action"], "service.unregister");
    }
}
