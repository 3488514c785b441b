//! # switchyard-host — Tool Broker
//!
//! The control flow around a provider call: resolve, check the caller's
//! role, ask the monitor for admission, call through the gateway, and
//! report the outcome back to the monitor whether it succeeded or not.
//! Catalog and policy mutations go through here too so they are
//! role-checked and audited in one place.

use serde_json::json;
use std::sync::Arc;
use switchyard_shared::{
    now_ms, Actor, AuditEvent, CallSample, ManualCheck, PolicyPatch, ServiceDescriptor,
    ServicePolicy, ServiceRegistration, ServiceStatus, SwitchyardError,
};
use tracing::{info, warn};

use crate::access::{ensure_mutable, ensure_visible, AccessPolicy};
use crate::audit::{self, AuditLog};
use crate::gateway::{Gateway, GatewayRequest, GatewayResponse};
use crate::monitor::ServiceMonitor;
use crate::registry::Registry;

pub struct ToolBroker {
    registry: Arc<Registry>,
    monitor: Arc<ServiceMonitor>,
    gateway: Arc<Gateway>,
    access: Arc<dyn AccessPolicy>,
    audit: Arc<dyn AuditLog>,
}

impl ToolBroker {
    pub fn new(
        registry: Arc<Registry>,
        monitor: Arc<ServiceMonitor>,
        gateway: Arc<Gateway>,
        access: Arc<dyn AccessPolicy>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            registry,
            monitor,
            gateway,
            access,
            audit,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<ServiceMonitor> {
        &self.monitor
    }

    /// Load the catalog and policies from the store.
    pub async fn hydrate(&self) -> Result<(), SwitchyardError> {
        self.registry.hydrate().await?;
        let services = self.registry.list().await;
        self.monitor.hydrate(&services).await
    }

    // ── Calls ───────────────────────────────────────────────────────────

    pub async fn invoke(
        &self,
        actor: &Actor,
        request: GatewayRequest,
    ) -> Result<GatewayResponse, SwitchyardError> {
        let descriptor = self.registry.resolve(&request.server).await?;
        ensure_visible(self.access.as_ref(), &actor.role, &descriptor)?;

        if let Err(rejection) = self.monitor.before_call(&descriptor.name) {
            info!(
                service = %descriptor.name,
                tool = %request.tool,
                actor = %actor.id,
                code = rejection.code(),
                "Call rejected by admission control"
            );
            return Err(rejection);
        }

        let outcome = self.gateway.call_descriptor(&descriptor, &request).await;
        match &outcome {
            Ok(response) => {
                self.monitor.observe_call(
                    &descriptor.name,
                    CallSample::success(now_ms(), response.duration_ms),
                );
            }
            // Failures that never left the host (bad tool path) are not provider samples.
            Err(e) => {
                if let Some(duration_ms) = e.duration_ms() {
                    self.monitor.observe_call(
                        &descriptor.name,
                        CallSample::failure(now_ms(), duration_ms, e.to_string()),
                    );
                }
            }
        }
        outcome
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Services the actor's role may see.
    pub async fn list_services(&self, actor: &Actor) -> Vec<ServiceDescriptor> {
        self.registry
            .list()
            .await
            .into_iter()
            .filter(|d| self.access.is_visible(&actor.role, d))
            .collect()
    }

    pub async fn status(&self, actor: &Actor, name: &str) -> Result<ServiceStatus, SwitchyardError> {
        let descriptor = self.registry.resolve(name).await?;
        ensure_visible(self.access.as_ref(), &actor.role, &descriptor)?;
        Ok(self.monitor.status(&descriptor.name))
    }

    pub async fn statuses(&self, actor: &Actor) -> Vec<ServiceStatus> {
        let mut out = Vec::new();
        for descriptor in self.list_services(actor).await {
            out.push(self.monitor.status(&descriptor.name));
        }
        out
    }

    pub async fn check_health(
        &self,
        actor: &Actor,
        name: &str,
    ) -> Result<ManualCheck, SwitchyardError> {
        let descriptor = self.registry.resolve(name).await?;
        ensure_visible(self.access.as_ref(), &actor.role, &descriptor)?;
        Ok(self.monitor.check_health(&descriptor).await)
    }

    // ── Mutations ───────────────────────────────────────────────────────

    pub async fn register_service(
        &self,
        actor: &Actor,
        registration: ServiceRegistration,
    ) -> Result<ServiceDescriptor, SwitchyardError> {
        let name = registration.name.trim().to_string();
        match self.registry.get(&name).await {
            Some(existing) => ensure_mutable(self.access.as_ref(), &actor.role, &existing)?,
            None => self.ensure_privileged(actor, &name)?,
        }

        let descriptor = self.registry.register(registration).await?;
        self.audit(
            actor,
            "service.register",
            &descriptor.name,
            json!({
                "base_url": descriptor.base_url,
                "capabilities": descriptor.capabilities,
                "timeout_ms": descriptor.timeout_ms,
                "allowed_roles": descriptor.allowed_roles,
            }),
        )
        .await;
        Ok(descriptor)
    }

    pub async fn unregister_service(
        &self,
        actor: &Actor,
        name: &str,
    ) -> Result<bool, SwitchyardError> {
        match self.registry.get(name).await {
            Some(existing) => ensure_mutable(self.access.as_ref(), &actor.role, &existing)?,
            None => self.ensure_privileged(actor, name)?,
        }

        let existed = self.registry.unregister(name).await?;
        self.monitor.discard(name).await?;
        self.audit(
            actor,
            "service.unregister",
            name,
            json!({ "existed": existed }),
        )
        .await;
        Ok(existed)
    }

    /// Replace and persist the policy of a registered service.
    pub async fn update_policy(
        &self,
        actor: &Actor,
        name: &str,
        patch: PolicyPatch,
    ) -> Result<ServicePolicy, SwitchyardError> {
        let descriptor = self.registry.resolve(name).await?;
        ensure_mutable(self.access.as_ref(), &actor.role, &descriptor)?;

        self.monitor.set_policy(&descriptor.name, patch);
        let policy = self.monitor.persist_policy(&descriptor.name).await?;
        self.audit(
            actor,
            "policy.update",
            &descriptor.name,
            serde_json::to_value(&policy).unwrap_or_default(),
        )
        .await;
        Ok(policy)
    }

    fn ensure_privileged(&self, actor: &Actor, name: &str) -> Result<(), SwitchyardError> {
        if self.access.is_privileged(&actor.role) {
            Ok(())
        } else {
            warn!(actor = %actor.id, role = %actor.role, service = %name, "Catalog change denied");
            Err(SwitchyardError::Forbidden {
                role: actor.role.clone(),
                resource: format!("service:{name}"),
            })
        }
    }

    async fn audit(&self, actor: &Actor, action: &str, service: &str, detail: serde_json::Value) {
        audit::record(
            self.audit.as_ref(),
            AuditEvent::new(&actor.id, action, format!("service:{service}"), detail),
        )
        .await;
    }
}
