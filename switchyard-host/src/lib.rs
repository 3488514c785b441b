//! # switchyard-host — Library Entry Point
//!
//! Registry, gateway, service monitor and script sandbox, plus the storage
//! and audit seams they share. The `switchyard` binary wires these together.

pub mod access;
pub mod audit;
pub mod broker;
pub mod config;
pub mod gateway;
pub mod monitor;
pub mod registry;
pub mod sandbox;
pub mod store;

pub use access::{AccessPolicy, RoleAccess};
pub use audit::{AuditLog, JsonlAuditLog, MemoryAuditLog, TracingAuditLog};
pub use broker::ToolBroker;
pub use config::SwitchyardConfig;
pub use gateway::{Gateway, GatewayRequest, GatewayResponse};
pub use monitor::ServiceMonitor;
pub use registry::Registry;
pub use sandbox::{OverlapPolicy, RunOptions, SandboxExecutor};
pub use store::{CatalogStore, JsonFileStore, MemoryStore};
