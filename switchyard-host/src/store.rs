//! # switchyard-host — Catalog persistence
//!
//! `CatalogStore` is the durable backing for the service registry, service
//! policies, sandbox scripts and sandbox environments. Every write is an
//! upsert keyed by a stable identifier. Two backends ship with the host:
//! - [`MemoryStore`]: process-local maps, for tests and ephemeral runs.
//! - [`JsonFileStore`]: one JSON document on disk, rewritten atomically.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use switchyard_shared::{
    SandboxEnvironmentDefinition, SandboxScriptDefinition, ServiceDescriptor, ServicePolicy,
    SwitchyardError,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

type StoreResult<T> = Result<T, SwitchyardError>;

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn load_services(&self) -> StoreResult<Vec<ServiceDescriptor>>;
    async fn save_service(&self, descriptor: &ServiceDescriptor) -> StoreResult<()>;
    async fn delete_service(&self, name: &str) -> StoreResult<()>;

    async fn load_policies(&self) -> StoreResult<Vec<(String, ServicePolicy)>>;
    async fn save_policy(&self, name: &str, policy: &ServicePolicy) -> StoreResult<()>;
    async fn delete_policy(&self, name: &str) -> StoreResult<()>;

    async fn load_scripts(&self) -> StoreResult<Vec<SandboxScriptDefinition>>;
    async fn save_script(&self, script: &SandboxScriptDefinition) -> StoreResult<()>;
    async fn delete_script(&self, id: &str) -> StoreResult<()>;

    async fn load_environments(&self) -> StoreResult<Vec<SandboxEnvironmentDefinition>>;
    async fn save_environment(&self, environment: &SandboxEnvironmentDefinition)
        -> StoreResult<()>;
    async fn delete_environment(&self, id: &str) -> StoreResult<()>;
}

/// Everything the store holds, keyed for deterministic output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogDocument {
    pub services: BTreeMap<String, ServiceDescriptor>,
    pub policies: BTreeMap<String, ServicePolicy>,
    pub scripts: BTreeMap<String, SandboxScriptDefinition>,
    pub environments: BTreeMap<String, SandboxEnvironmentDefinition>,
}

impl CatalogDocument {
    fn apply(&mut self, write: Write<'_>) {
        match write {
            Write::Service(d) => {
                self.services.insert(d.name.clone(), d.clone());
            }
            Write::DeleteService(name) => {
                self.services.remove(name);
            }
            Write::Policy(name, policy) => {
                self.policies.insert(name.to_string(), policy.clone());
            }
            Write::DeletePolicy(name) => {
                self.policies.remove(name);
            }
            Write::Script(s) => {
                self.scripts.insert(s.id.clone(), s.clone());
            }
            Write::DeleteScript(id) => {
                self.scripts.remove(id);
            }
            Write::Environment(e) => {
                self.environments.insert(e.id.clone(), e.clone());
            }
            Write::DeleteEnvironment(id) => {
                self.environments.remove(id);
            }
        }
    }
}

enum Write<'a> {
    Service(&'a ServiceDescriptor),
    DeleteService(&'a str),
    Policy(&'a str, &'a ServicePolicy),
    DeletePolicy(&'a str),
    Script(&'a SandboxScriptDefinition),
    DeleteScript(&'a str),
    Environment(&'a SandboxEnvironmentDefinition),
    DeleteEnvironment(&'a str),
}

// ─── MemoryStore ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryStore {
    doc: Mutex<CatalogDocument>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. to exercise hydrate paths.
    pub fn with_document(doc: CatalogDocument) -> Self {
        Self {
            doc: Mutex::new(doc),
        }
    }

    pub async fn snapshot(&self) -> CatalogDocument {
        self.doc.lock().await.clone()
    }

    async fn write(&self, write: Write<'_>) -> StoreResult<()> {
        self.doc.lock().await.apply(write);
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn load_services(&self) -> StoreResult<Vec<ServiceDescriptor>> {
        Ok(self.doc.lock().await.services.values().cloned().collect())
    }

    async fn save_service(&self, descriptor: &ServiceDescriptor) -> StoreResult<()> {
        self.write(Write::Service(descriptor)).await
    }

    async fn delete_service(&self, name: &str) -> StoreResult<()> {
        self.write(Write::DeleteService(name)).await
    }

    async fn load_policies(&self) -> StoreResult<Vec<(String, ServicePolicy)>> {
        Ok(self
            .doc
            .lock()
            .await
            .policies
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn save_policy(&self, name: &str, policy: &ServicePolicy) -> StoreResult<()> {
        self.write(Write::Policy(name, policy)).await
    }

    async fn delete_policy(&self, name: &str) -> StoreResult<()> {
        self.write(Write::DeletePolicy(name)).await
    }

    async fn load_scripts(&self) -> StoreResult<Vec<SandboxScriptDefinition>> {
        Ok(self.doc.lock().await.scripts.values().cloned().collect())
    }

    async fn save_script(&self, script: &SandboxScriptDefinition) -> StoreResult<()> {
        self.write(Write::Script(script)).await
    }

    async fn delete_script(&self, id: &str) -> StoreResult<()> {
        self.write(Write::DeleteScript(id)).await
    }

    async fn load_environments(&self) -> StoreResult<Vec<SandboxEnvironmentDefinition>> {
        Ok(self.doc.lock().await.environments.values().cloned().collect())
    }

    async fn save_environment(
        &self,
        environment: &SandboxEnvironmentDefinition,
    ) -> StoreResult<()> {
        self.write(Write::Environment(environment)).await
    }

    async fn delete_environment(&self, id: &str) -> StoreResult<()> {
        self.write(Write::DeleteEnvironment(id)).await
    }
}

// ─── JsonFileStore ──────────────────────────────────────────────────────────

/// Single-document JSON store. Writes go to a sibling temp file and are
/// renamed over the target so a crash never leaves a torn document.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    doc: Mutex<CatalogDocument>,
}

impl JsonFileStore {
    /// Open (or lazily create) the document at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let doc = match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => CatalogDocument::default(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                SwitchyardError::Persistence(format!("corrupt state file {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "State file absent; starting empty");
                CatalogDocument::default()
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            path = %path.display(),
            services = doc.services.len(),
            scripts = doc.scripts.len(),
            "Catalog state loaded"
        );
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, write: Write<'_>) -> StoreResult<()> {
        let mut doc = self.doc.lock().await;
        let mut next = doc.clone();
        next.apply(write);
        persist_document(&self.path, &next).await?;
        *doc = next;
        Ok(())
    }
}

async fn persist_document(path: &Path, doc: &CatalogDocument) -> StoreResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let payload = serde_json::to_vec_pretty(doc)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, payload).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl CatalogStore for JsonFileStore {
    async fn load_services(&self) -> StoreResult<Vec<ServiceDescriptor>> {
        Ok(self.doc.lock().await.services.values().cloned().collect())
    }

    async fn save_service(&self, descriptor: &ServiceDescriptor) -> StoreResult<()> {
        self.write(Write::Service(descriptor)).await
    }

    async fn delete_service(&self, name: &str) -> StoreResult<()> {
        self.write(Write::DeleteService(name)).await
    }

    async fn load_policies(&self) -> StoreResult<Vec<(String, ServicePolicy)>> {
        Ok(self
            .doc
            .lock()
            .await
            .policies
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn save_policy(&self, name: &str, policy: &ServicePolicy) -> StoreResult<()> {
        self.write(Write::Policy(name, policy)).await
    }

    async fn delete_policy(&self, name: &str) -> StoreResult<()> {
        self.write(Write::DeletePolicy(name)).await
    }

    async fn load_scripts(&self) -> StoreResult<Vec<SandboxScriptDefinition>> {
        Ok(self.doc.lock().await.scripts.values().cloned().collect())
    }

    async fn save_script(&self, script: &SandboxScriptDefinition) -> StoreResult<()> {
        self.write(Write::Script(script)).await
    }

    async fn delete_script(&self, id: &str) -> StoreResult<()> {
        self.write(Write::DeleteScript(id)).await
    }

    async fn load_environments(&self) -> StoreResult<Vec<SandboxEnvironmentDefinition>> {
        Ok(self.doc.lock().await.environments.values().cloned().collect())
    }

    async fn save_environment(
        &self,
        environment: &SandboxEnvironmentDefinition,
    ) -> StoreResult<()> {
        self.write(Write::Environment(environment)).await
    }

    async fn delete_environment(&self, id: &str) -> StoreResult<()> {
        self.write(Write::DeleteEnvironment(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.into(),
            base_url: format!("http://{name}.local"),
            description: String::new(),
            capabilities: vec![],
            auth_token: None,
            timeout_ms: 30_000,
            allowed_roles: vec![],
        }
    }

    #[tokio::test]
    async fn json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("catalog.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        store.save_service(&descriptor("alpha")).await.unwrap();
        store.save_service(&descriptor("beta")).await.unwrap();
        store.delete_service("alpha").await.unwrap();
        store
            .save_policy("beta", &ServicePolicy::default())
            .await
            .unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let services = reopened.load_services().await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "beta");
        assert_eq!(reopened.load_policies().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn corrupt_document_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = JsonFileStore::open(&path).await.unwrap_err();
        assert_eq!(err.code(), "persistence_error");
    }

    #[tokio::test]
    async fn memory_store_upserts_by_key() {
        let store = MemoryStore::new();
        let mut d = descriptor("alpha");
        store.save_service(&d).await.unwrap();
        d.description = "second".into();
        store.save_service(&d).await.unwrap();
        let services = store.load_services().await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].description, "second");
    }
}
