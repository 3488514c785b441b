//! # switchyard-host — Role boundary
//!
//! The identity system lives elsewhere; this module only answers two
//! questions for a role and a descriptor: may it see the service, and may
//! it change it. Privileged roles always pass.

use switchyard_shared::{ServiceDescriptor, SwitchyardError};

use crate::config::AccessConfig;

pub trait AccessPolicy: Send + Sync {
    fn is_visible(&self, role: &str, descriptor: &ServiceDescriptor) -> bool;
    fn can_mutate(&self, role: &str, descriptor: &ServiceDescriptor) -> bool;
    fn is_privileged(&self, role: &str) -> bool;
}

/// `allowed_roles`-based access with a set of always-allowed roles.
#[derive(Debug, Clone)]
pub struct RoleAccess {
    privileged: Vec<String>,
}

impl RoleAccess {
    pub fn new(config: &AccessConfig) -> Self {
        Self {
            privileged: config
                .privileged_roles
                .iter()
                .map(|r| r.trim().to_ascii_lowercase())
                .filter(|r| !r.is_empty())
                .collect(),
        }
    }
}

impl Default for RoleAccess {
    fn default() -> Self {
        Self::new(&AccessConfig::default())
    }
}

impl AccessPolicy for RoleAccess {
    fn is_visible(&self, role: &str, descriptor: &ServiceDescriptor) -> bool {
        self.is_privileged(role)
            || descriptor.allowed_roles.is_empty()
            || role_listed(role, &descriptor.allowed_roles)
    }

    fn can_mutate(&self, role: &str, descriptor: &ServiceDescriptor) -> bool {
        // Unrestricted services have nobody to delegate to but privileged roles.
        self.is_privileged(role)
            || (!descriptor.allowed_roles.is_empty()
                && role_listed(role, &descriptor.allowed_roles))
    }

    fn is_privileged(&self, role: &str) -> bool {
        let role = role.trim().to_ascii_lowercase();
        self.privileged.iter().any(|p| *p == role)
    }
}

fn role_listed(role: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|r| r.eq_ignore_ascii_case(role.trim()))
}

pub(crate) fn ensure_visible(
    access: &dyn AccessPolicy,
    role: &str,
    descriptor: &ServiceDescriptor,
) -> Result<(), SwitchyardError> {
    if access.is_visible(role, descriptor) {
        Ok(())
    } else {
        Err(forbidden(role, descriptor))
    }
}

pub(crate) fn ensure_mutable(
    access: &dyn AccessPolicy,
    role: &str,
    descriptor: &ServiceDescriptor,
) -> Result<(), SwitchyardError> {
    if access.can_mutate(role, descriptor) {
        Ok(())
    } else {
        Err(forbidden(role, descriptor))
    }
}

fn forbidden(role: &str, descriptor: &ServiceDescriptor) -> SwitchyardError {
    SwitchyardError::Forbidden {
        role: role.to_string(),
        resource: format!("service:{}", descriptor.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(roles: &[&str]) -> ServiceDescriptor {
        ServiceDescriptor {
            name: "vault".into(),
            base_url: "http://vault".into(),
            description: String::new(),
            capabilities: vec![],
            auth_token: None,
            timeout_ms: 30_000,
            allowed_roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn unrestricted_service_is_visible_to_everyone() {
        let access = RoleAccess::default();
        assert!(access.is_visible("viewer", &service(&[])));
        assert!(!access.can_mutate("viewer", &service(&[])));
        assert!(access.can_mutate("admin", &service(&[])));
    }

    #[test]
    fn restricted_service_requires_membership() {
        let access = RoleAccess::default();
        let d = service(&["ops"]);
        assert!(access.is_visible("ops", &d));
        assert!(access.is_visible("OPS", &d));
        assert!(!access.is_visible("viewer", &d));
        assert!(access.can_mutate("ops", &d));
        assert!(access.is_visible("owner", &d));
    }

    #[test]
    fn ensure_helpers_map_to_forbidden() {
        let access = RoleAccess::default();
        let err = ensure_visible(&access, "viewer", &service(&["ops"])).unwrap_err();
        assert_eq!(err.code(), "forbidden");
        assert!(ensure_mutable(&access, "ops", &service(&["ops"])).is_ok());
    }
}
