//! # switchyard-host — Service Registry
//!
//! In-memory catalog of tool providers, hydrated from the store at startup
//! and written through to it on every change.

use std::collections::HashMap;
use std::sync::Arc;
use switchyard_shared::{
    Capability, ServiceDescriptor, ServiceRegistration, SwitchyardError, DEFAULT_TIMEOUT_MS,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::store::CatalogStore;

pub struct Registry {
    services: RwLock<HashMap<String, ServiceDescriptor>>,
    store: Arc<dyn CatalogStore>,
}

impl Registry {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Replace in-memory state with whatever the store holds.
    pub async fn hydrate(&self) -> Result<usize, SwitchyardError> {
        let loaded = self.store.load_services().await?;
        let mut services = self.services.write().await;
        services.clear();
        for descriptor in loaded {
            services.insert(descriptor.name.clone(), descriptor);
        }
        info!(count = services.len(), "Registry hydrated");
        Ok(services.len())
    }

    /// All descriptors, ordered by name.
    pub async fn list(&self) -> Vec<ServiceDescriptor> {
        let mut all: Vec<_> = self.services.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub async fn get(&self, name: &str) -> Option<ServiceDescriptor> {
        self.services.read().await.get(name).cloned()
    }

    /// Like [`get`](Self::get) but an absent service is a resolution error.
    pub async fn resolve(&self, name: &str) -> Result<ServiceDescriptor, SwitchyardError> {
        self.get(name)
            .await
            .ok_or_else(|| SwitchyardError::ServiceNotFound {
                name: name.to_string(),
            })
    }

    /// Sanitize, persist and upsert. Returns the stored descriptor.
    pub async fn register(
        &self,
        registration: ServiceRegistration,
    ) -> Result<ServiceDescriptor, SwitchyardError> {
        let descriptor = sanitize(registration)?;
        self.store.save_service(&descriptor).await?;
        let previous = self
            .services
            .write()
            .await
            .insert(descriptor.name.clone(), descriptor.clone());
        info!(
            service = %descriptor.name,
            base_url = %descriptor.base_url,
            replaced = previous.is_some(),
            "Service registered"
        );
        Ok(descriptor)
    }

    /// Remove a service. Returns whether it existed.
    pub async fn unregister(&self, name: &str) -> Result<bool, SwitchyardError> {
        self.store.delete_service(name).await?;
        let existed = self.services.write().await.remove(name).is_some();
        if existed {
            info!(service = %name, "Service unregistered");
        } else {
            debug!(service = %name, "Unregister of unknown service");
        }
        Ok(existed)
    }
}

/// Normalize operator input into a descriptor.
pub fn sanitize(registration: ServiceRegistration) -> Result<ServiceDescriptor, SwitchyardError> {
    let name = registration.name.trim().to_string();
    if name.is_empty() {
        return Err(SwitchyardError::Invalid("service name is required".into()));
    }
    let base_url = registration.base_url.trim().trim_end_matches('/').to_string();
    if base_url.is_empty() {
        return Err(SwitchyardError::Invalid(format!(
            "service {name} has no base URL"
        )));
    }

    let mut capabilities: Vec<Capability> = Vec::new();
    for raw in &registration.capabilities {
        match raw.parse::<Capability>() {
            Ok(c) if !capabilities.contains(&c) => capabilities.push(c),
            Ok(_) => {}
            Err(_) => warn!(service = %name, capability = %raw, "Dropping unknown capability"),
        }
    }
    capabilities.sort();

    let mut allowed_roles: Vec<String> = Vec::new();
    for role in registration.allowed_roles.unwrap_or_default() {
        let role = role.trim();
        if !role.is_empty() && !allowed_roles.iter().any(|r| r == role) {
            allowed_roles.push(role.to_string());
        }
    }

    Ok(ServiceDescriptor {
        name,
        base_url,
        description: registration.description.trim().to_string(),
        capabilities,
        auth_token: registration
            .auth_token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()),
        timeout_ms: registration
            .timeout_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_TIMEOUT_MS),
        allowed_roles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CatalogDocument, MemoryStore};

    fn registration(name: &str) -> ServiceRegistration {
        ServiceRegistration {
            name: name.into(),
            base_url: "http://provider.local/".into(),
            capabilities: vec!["tools".into(), "shell".into(), "Files".into(), "tools".into()],
            allowed_roles: Some(vec!["ops".into(), " ops ".into(), "".into(), "dev".into()]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn register_then_get_returns_sanitized_descriptor() {
        let registry = Registry::new(Arc::new(MemoryStore::new()));
        let stored = registry.register(registration("files")).await.unwrap();
        let fetched = registry.get("files").await.unwrap();

        assert_eq!(stored, fetched);
        assert_eq!(
            fetched.capabilities,
            vec![Capability::Tools, Capability::Files]
        );
        assert_eq!(fetched.timeout_ms, 30_000);
        assert_eq!(fetched.allowed_roles, vec!["ops", "dev"]);
        assert_eq!(fetched.base_url, "http://provider.local");
    }

    #[tokio::test]
    async fn register_persists_and_hydrate_restores() {
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::new(store.clone());
        registry.register(registration("files")).await.unwrap();
        assert_eq!(store.snapshot().await.services.len(), 1);

        let fresh = Registry::new(store);
        assert!(fresh.get("files").await.is_none());
        assert_eq!(fresh.hydrate().await.unwrap(), 1);
        assert!(fresh.get("files").await.is_some());
    }

    #[tokio::test]
    async fn hydrate_replaces_in_memory_state() {
        let mut doc = CatalogDocument::default();
        let seeded = sanitize(registration("seeded")).unwrap();
        doc.services.insert(seeded.name.clone(), seeded);
        let registry = Registry::new(Arc::new(MemoryStore::with_document(doc)));

        registry.hydrate().await.unwrap();
        let names: Vec<_> = registry.list().await.into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["seeded"]);
    }

    #[tokio::test]
    async fn unregister_reports_existence() {
        let registry = Registry::new(Arc::new(MemoryStore::new()));
        registry.register(registration("files")).await.unwrap();
        assert!(registry.unregister("files").await.unwrap());
        assert!(!registry.unregister("files").await.unwrap());
        assert!(registry.get("files").await.is_none());
    }

    #[test]
    fn blank_name_is_rejected() {
        let err = sanitize(ServiceRegistration {
            name: "  ".into(),
            base_url: "http://x".into(),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.code(), "invalid");
    }

    #[test]
    fn explicit_timeout_is_kept() {
        let d = sanitize(ServiceRegistration {
            name: "slow".into(),
            base_url: "http://x".into(),
            timeout_ms: Some(120_000),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(d.timeout_ms, 120_000);
    }
}
