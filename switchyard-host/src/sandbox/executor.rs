//! # switchyard-host — Sandbox Executor
//!
//! Owns the script and environment catalogs, runs scripts on demand or on
//! their schedule, and keeps a short in-memory history of run results.
//! Every definition change is written to the [`CatalogStore`] before the
//! in-memory catalog is touched, and every run result goes to the
//! [`AuditLog`].

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use switchyard_shared::{
    Actor, AuditEvent, RunStatus, RunTrigger, SandboxEnvironmentDefinition, SandboxRunResult,
    SandboxScriptDefinition, SwitchyardError,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::engine::{ExecutionOutcome, ScriptEngine};
use super::environment::{ambient_environment, compose_environment};
use super::scheduler::{ScheduleState, Scheduler, Tick, TickFuture};
use crate::audit::{self, AuditLog};
use crate::config::SandboxConfig;
use crate::store::CatalogStore;

/// How long a run waits on its run-log append before returning anyway.
const RUN_LOG_GRACE: Duration = Duration::from_secs(1);

/// How a run was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub trigger: RunTrigger,
    pub actor: Option<String>,
}

impl RunOptions {
    pub fn manual(actor: impl Into<String>) -> Self {
        Self {
            trigger: RunTrigger::Manual,
            actor: Some(actor.into()),
        }
    }

    pub fn scheduled() -> Self {
        Self {
            trigger: RunTrigger::Schedule,
            actor: None,
        }
    }
}

/// Cheap to clone; clones share one catalog, engine and scheduler.
#[derive(Clone)]
pub struct SandboxExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    workspace_root: PathBuf,
    inherit_process_env: bool,
    history_limit: usize,
    engine: ScriptEngine,
    scheduler: Scheduler,
    scripts: RwLock<HashMap<String, SandboxScriptDefinition>>,
    environments: RwLock<HashMap<String, SandboxEnvironmentDefinition>>,
    history: Mutex<HashMap<String, VecDeque<SandboxRunResult>>>,
    store: Arc<dyn CatalogStore>,
    audit: Arc<dyn AuditLog>,
}

impl SandboxExecutor {
    pub fn new(
        config: &SandboxConfig,
        store: Arc<dyn CatalogStore>,
        audit: Arc<dyn AuditLog>,
    ) -> anyhow::Result<Self> {
        let workspace_root = config
            .workspace_root
            .canonicalize()
            .unwrap_or_else(|_| normalize(&config.workspace_root));

        Ok(Self {
            inner: Arc::new(ExecutorInner {
                workspace_root,
                inherit_process_env: config.inherit_process_env,
                history_limit: config.history_limit.max(1),
                engine: ScriptEngine::new(config)?,
                scheduler: Scheduler::new(config.overlap),
                scripts: RwLock::new(HashMap::new()),
                environments: RwLock::new(HashMap::new()),
                history: Mutex::new(HashMap::new()),
                store,
                audit,
            }),
        })
    }

    pub fn workspace_root(&self) -> &Path {
        &self.inner.workspace_root
    }

    /// Replace the in-memory catalogs with the stored ones and start a timer
    /// for every scheduled script. Returns the number of scripts loaded.
    pub async fn hydrate(&self) -> Result<usize, SwitchyardError> {
        let environments = self.inner.store.load_environments().await?;
        let scripts = self.inner.store.load_scripts().await?;

        *self.inner.environments.write().await = environments
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();

        self.inner.scheduler.cancel_all();
        let count = scripts.len();
        for script in &scripts {
            self.reschedule(script);
        }
        *self.inner.scripts.write().await =
            scripts.into_iter().map(|s| (s.id.clone(), s)).collect();

        info!(scripts = count, "Sandbox catalog hydrated");
        Ok(count)
    }

    /// Stop every timer. Runs already in flight finish on their own.
    pub fn shutdown(&self) {
        self.inner.scheduler.cancel_all();
    }

    // ── Scripts ─────────────────────────────────────────────────────────

    /// Create or replace a script. Replacing restarts its timer from now.
    pub async fn register_script(
        &self,
        actor: &Actor,
        definition: SandboxScriptDefinition,
    ) -> Result<SandboxScriptDefinition, SwitchyardError> {
        let mut definition = definition;
        definition.id = required("script id", &definition.id)?;
        definition.name = required("script name", &definition.name)?;
        definition.entry_file = resolve_entry_file(&self.inner.workspace_root, &definition.entry_file)?;
        if let Some(key) = definition
            .env
            .keys()
            .find(|k| k.is_empty() || k.contains('=') || k.contains('\0'))
        {
            return Err(SwitchyardError::Invalid(format!(
                "invalid environment variable name: {key:?}"
            )));
        }
        definition.environment_id = definition
            .environment_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        if let Some(env_id) = &definition.environment_id {
            if !self.inner.environments.read().await.contains_key(env_id) {
                return Err(SwitchyardError::EnvironmentNotFound { id: env_id.clone() });
            }
        }

        self.inner.store.save_script(&definition).await?;
        self.inner
            .scripts
            .write()
            .await
            .insert(definition.id.clone(), definition.clone());
        self.reschedule(&definition);

        info!(script = %definition.id, entry = %definition.entry_file.display(), "Script registered");
        self.audit(
            actor,
            "script.register",
            format!("script:{}", definition.id),
            json!({
                "entry_file": definition.entry_file,
                "schedule_ms": definition.schedule_ms,
                "environment_id": definition.environment_id,
            }),
        )
        .await;
        Ok(definition)
    }

    /// Returns whether the script existed.
    pub async fn remove_script(&self, actor: &Actor, id: &str) -> Result<bool, SwitchyardError> {
        self.inner.store.delete_script(id).await?;
        self.inner.scheduler.cancel(id);
        let existed = self.inner.scripts.write().await.remove(id).is_some();
        self.inner.history.lock().remove(id);

        if existed {
            info!(script = %id, "Script removed");
        }
        self.audit(
            actor,
            "script.remove",
            format!("script:{id}"),
            json!({ "existed": existed }),
        )
        .await;
        Ok(existed)
    }

    pub async fn get_script(&self, id: &str) -> Option<SandboxScriptDefinition> {
        self.inner.scripts.read().await.get(id).cloned()
    }

    /// All scripts, sorted by id.
    pub async fn list_scripts(&self) -> Vec<SandboxScriptDefinition> {
        let mut scripts: Vec<_> = self.inner.scripts.read().await.values().cloned().collect();
        scripts.sort_by(|a, b| a.id.cmp(&b.id));
        scripts
    }

    pub fn schedule_state(&self, id: &str) -> ScheduleState {
        self.inner.scheduler.state(id)
    }

    // ── Environments ────────────────────────────────────────────────────

    pub async fn register_environment(
        &self,
        actor: &Actor,
        environment: SandboxEnvironmentDefinition,
    ) -> Result<SandboxEnvironmentDefinition, SwitchyardError> {
        let mut environment = environment;
        environment.id = required("environment id", &environment.id)?;
        environment.name = required("environment name", &environment.name)?;

        self.inner.store.save_environment(&environment).await?;
        self.inner
            .environments
            .write()
            .await
            .insert(environment.id.clone(), environment.clone());

        info!(environment = %environment.id, variables = environment.variables.len(), "Environment registered");
        // Variable values may be secrets; only the keys are audited.
        self.audit(
            actor,
            "environment.register",
            format!("environment:{}", environment.id),
            json!({ "variables": environment.variables.keys().collect::<Vec<_>>() }),
        )
        .await;
        Ok(environment)
    }

    /// Delete an environment. While scripts still reference it the call fails
    /// with a conflict, unless `force` is set, in which case those scripts are
    /// detached from it first.
    pub async fn remove_environment(
        &self,
        actor: &Actor,
        id: &str,
        force: bool,
    ) -> Result<bool, SwitchyardError> {
        let mut dependents: Vec<SandboxScriptDefinition> = self
            .inner
            .scripts
            .read()
            .await
            .values()
            .filter(|s| s.environment_id.as_deref() == Some(id))
            .cloned()
            .collect();
        dependents.sort_by(|a, b| a.id.cmp(&b.id));
        let detached: Vec<String> = dependents.iter().map(|s| s.id.clone()).collect();

        if !detached.is_empty() && !force {
            return Err(SwitchyardError::EnvironmentInUse {
                id: id.to_string(),
                scripts: detached,
            });
        }

        for mut script in dependents {
            script.environment_id = None;
            self.inner.store.save_script(&script).await?;
            self.inner
                .scripts
                .write()
                .await
                .insert(script.id.clone(), script);
        }

        self.inner.store.delete_environment(id).await?;
        let existed = self.inner.environments.write().await.remove(id).is_some();

        if !detached.is_empty() {
            warn!(environment = %id, scripts = ?detached, "Environment removed; scripts detached");
        }
        self.audit(
            actor,
            "environment.remove",
            format!("environment:{id}"),
            json!({ "existed": existed, "force": force, "detached": detached }),
        )
        .await;
        Ok(existed)
    }

    pub async fn get_environment(&self, id: &str) -> Option<SandboxEnvironmentDefinition> {
        self.inner.environments.read().await.get(id).cloned()
    }

    /// All environments, sorted by id.
    pub async fn list_environments(&self) -> Vec<SandboxEnvironmentDefinition> {
        let mut environments: Vec<_> = self
            .inner
            .environments
            .read()
            .await
            .values()
            .cloned()
            .collect();
        environments.sort_by(|a, b| a.id.cmp(&b.id));
        environments
    }

    // ── Runs ────────────────────────────────────────────────────────────

    /// Run a script once. Only an unknown id is an `Err`; everything that
    /// goes wrong inside the run is reported in the result.
    pub async fn run(
        &self,
        id: &str,
        options: RunOptions,
    ) -> Result<SandboxRunResult, SwitchyardError> {
        self.inner.run(id, options).await
    }

    /// Most recent results first.
    pub fn recent_runs(&self, id: &str) -> Vec<SandboxRunResult> {
        self.inner
            .history
            .lock()
            .get(id)
            .map(|runs| runs.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    fn reschedule(&self, script: &SandboxScriptDefinition) {
        let Some(period_ms) = script.schedule_period_ms() else {
            self.inner.scheduler.cancel(&script.id);
            return;
        };
        let weak: Weak<ExecutorInner> = Arc::downgrade(&self.inner);
        let id = script.id.clone();
        let tick: Tick = Arc::new(move || -> TickFuture {
            let weak = weak.clone();
            let id = id.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = inner.run(&id, RunOptions::scheduled()).await {
                    warn!(script = %id, error = %e, "Scheduled run could not start");
                }
            })
        });
        self.inner
            .scheduler
            .schedule(&script.id, Duration::from_millis(period_ms), tick);
    }

    async fn audit(&self, actor: &Actor, action: &str, resource: String, detail: serde_json::Value) {
        audit::record(
            self.inner.audit.as_ref(),
            AuditEvent::new(&actor.id, action, resource, detail),
        )
        .await;
    }
}

impl ExecutorInner {
    async fn run(
        &self,
        id: &str,
        options: RunOptions,
    ) -> Result<SandboxRunResult, SwitchyardError> {
        let script = self
            .scripts
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SwitchyardError::ScriptNotFound { id: id.to_string() })?;

        let started_at = Utc::now();
        let clock = Instant::now();
        let outcome = self.execute(&script).await;
        let duration_ms = clock.elapsed().as_millis() as u64;

        let result = SandboxRunResult {
            run_id: generate_run_id(),
            script_id: script.id.clone(),
            started_at,
            finished_at: Utc::now(),
            duration_ms,
            status: if outcome.error.is_some() {
                RunStatus::Error
            } else {
                RunStatus::Success
            },
            output: outcome.output,
            error: outcome.error,
            trigger: options.trigger,
            actor: match options.trigger {
                RunTrigger::Manual => options.actor,
                RunTrigger::Schedule => None,
            },
        };

        match &result.error {
            None => info!(script = %id, run = %result.run_id, duration_ms, "Script run succeeded"),
            Some(error) => {
                warn!(script = %id, run = %result.run_id, duration_ms, error = %error, "Script run failed")
            }
        }

        self.remember(&result);
        // The append keeps going in the background if the sink is slower than the grace period.
        let audit = self.audit.clone();
        let record = result.clone();
        let append = tokio::spawn(async move {
            if let Err(e) = audit.append_run_result(&record).await {
                warn!(script = %record.script_id, run = %record.run_id, error = %e, "Run result could not be logged");
            }
        });
        if tokio::time::timeout(RUN_LOG_GRACE, append).await.is_err() {
            warn!(script = %id, run = %result.run_id, "Run log still pending; result returned without it");
        }
        Ok(result)
    }

    async fn execute(&self, script: &SandboxScriptDefinition) -> ExecutionOutcome {
        // Links may have been swapped in since registration.
        let entry_file = match tokio::fs::canonicalize(&script.entry_file).await {
            Ok(path) => path,
            Err(e) => {
                return ExecutionOutcome::failed(format!(
                    "cannot read {}: {e}",
                    script.entry_file.display()
                ))
            }
        };
        if !entry_file.starts_with(&self.workspace_root) {
            warn!(
                script = %script.id,
                path = %entry_file.display(),
                root = %self.workspace_root.display(),
                "Entry file resolves outside workspace; run refused"
            );
            return ExecutionOutcome::failed(format!(
                "entry file {} resolves outside the workspace root {}",
                script.entry_file.display(),
                self.workspace_root.display()
            ));
        }
        let source = match tokio::fs::read(&entry_file).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return ExecutionOutcome::failed(format!(
                    "cannot read {}: {e}",
                    script.entry_file.display()
                ))
            }
        };

        let environment = match &script.environment_id {
            Some(env_id) => match self.environments.read().await.get(env_id) {
                Some(environment) => Some(environment.clone()),
                None => {
                    return ExecutionOutcome::failed(format!("environment {env_id} not found"))
                }
            },
            None => None,
        };

        let env = compose_environment(
            ambient_environment(self.inherit_process_env),
            environment.as_ref(),
            &script.env,
        );
        debug!(script = %script.id, variables = env.len(), "Starting script");
        self.engine.execute(&source, &script.id, &env).await
    }

    fn remember(&self, result: &SandboxRunResult) {
        let mut history = self.history.lock();
        let runs = history.entry(result.script_id.clone()).or_default();
        runs.push_back(result.clone());
        while runs.len() > self.history_limit {
            runs.pop_front();
        }
    }
}

fn required(field: &str, value: &str) -> Result<String, SwitchyardError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SwitchyardError::Invalid(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

/// Resolve a script path and make sure it stays inside the workspace root.
/// Symlinks are followed when the file exists; otherwise `..` segments are
/// folded lexically.
fn resolve_entry_file(root: &Path, requested: &Path) -> Result<PathBuf, SwitchyardError> {
    if !requested.is_absolute() {
        return Err(SwitchyardError::Invalid(format!(
            "entry file must be an absolute path: {}",
            requested.display()
        )));
    }
    let lexical = normalize(requested);
    let resolved = lexical.canonicalize().unwrap_or(lexical);

    if !resolved.starts_with(root) {
        warn!(
            path = %requested.display(),
            root = %root.display(),
            "Entry file outside workspace rejected"
        );
        return Err(SwitchyardError::Invalid(format!(
            "entry file {} is outside the workspace root {}",
            requested.display(),
            root.display()
        )));
    }
    Ok(resolved)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn generate_run_id() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
