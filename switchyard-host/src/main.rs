//! Switchyard — CLI Entry Point
//!
//! Wires the registry, monitor, gateway and sandbox to a store and an audit
//! sink, then runs one command. `daemon` keeps script schedules alive until
//! Ctrl-C.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use switchyard_host::{
    AuditLog, CatalogStore, Gateway, GatewayRequest, JsonFileStore, JsonlAuditLog, MemoryStore,
    Registry, RoleAccess, RunOptions, SandboxExecutor, ServiceMonitor, SwitchyardConfig,
    ToolBroker, TracingAuditLog,
};
use switchyard_shared::{
    Actor, PolicyPatch, SandboxEnvironmentDefinition, SandboxScriptDefinition,
    ServiceRegistration,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON config file.
    #[arg(long, env = "SWITCHYARD_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// Overrides `storage.state_file`.
    #[arg(long, env = "SWITCHYARD_STATE", global = true)]
    state_file: Option<PathBuf>,
    /// Overrides `sandbox.workspace_root`.
    #[arg(long, env = "SWITCHYARD_WORKSPACE", global = true)]
    workspace: Option<PathBuf>,
    /// Identity recorded in audit events and manual runs.
    #[arg(long, env = "SWITCHYARD_ACTOR", default_value = "cli", global = true)]
    actor: String,
    #[arg(long, env = "SWITCHYARD_ROLE", default_value = "owner", global = true)]
    role: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List visible services.
    Services,
    /// Register or replace a service.
    Register(RegisterArgs),
    /// Remove a service and its policy.
    Unregister { name: String },
    /// Call a tool through the broker.
    Call {
        server: String,
        tool: String,
        /// JSON arguments.
        #[arg(long)]
        args: Option<String>,
        #[arg(long)]
        capability: Option<String>,
    },
    /// Health and usage; all visible services when no name is given.
    Status { name: Option<String> },
    /// Probe a service with a HEAD request.
    Check { name: String },
    /// Show a service policy, or replace it when any field is given.
    Policy(PolicyArgs),
    /// Manage sandbox scripts and environments.
    #[command(subcommand)]
    Scripts(ScriptsCommand),
    /// Run a script once.
    Run { id: String },
    /// Keep scheduled scripts running until Ctrl-C.
    Daemon,
}

#[derive(Args)]
struct RegisterArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    url: String,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long = "capability")]
    capabilities: Vec<String>,
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Restrict visibility to these roles.
    #[arg(long = "allow-role")]
    allowed_roles: Vec<String>,
}

#[derive(Args)]
struct PolicyArgs {
    name: String,
    #[arg(long)]
    limit_per_minute: Option<u32>,
    #[arg(long)]
    burst_multiplier: Option<f64>,
    #[arg(long)]
    failure_threshold: Option<u32>,
    #[arg(long)]
    cooldown_seconds: Option<u64>,
    #[arg(long)]
    minimum_samples: Option<usize>,
}

#[derive(Subcommand)]
enum ScriptsCommand {
    /// List scripts.
    List,
    /// Register or replace a script.
    Add {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        entry: PathBuf,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        schedule_ms: Option<u64>,
        /// KEY=VALUE, repeatable.
        #[arg(long = "env", value_parser = parse_key_value)]
        env: Vec<(String, String)>,
        #[arg(long)]
        environment: Option<String>,
    },
    /// Remove a script.
    Remove { id: String },
    /// Recent run results of a script.
    History { id: String },
    /// List environments.
    Envs,
    /// Register or replace an environment.
    EnvSet {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// KEY=VALUE, repeatable.
        #[arg(long = "var", value_parser = parse_key_value)]
        variables: Vec<(String, String)>,
    },
    /// Remove an environment.
    EnvRemove {
        id: String,
        /// Detach referencing scripts instead of refusing.
        #[arg(long)]
        force: bool,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SwitchyardConfig::load(path)?,
        None => SwitchyardConfig::default(),
    };
    if let Some(state_file) = cli.state_file.clone() {
        config.storage.state_file = Some(state_file);
    }
    if let Some(workspace) = cli.workspace.clone() {
        config.sandbox.workspace_root = workspace;
    }

    let store: Arc<dyn CatalogStore> = match &config.storage.state_file {
        Some(path) => Arc::new(JsonFileStore::open(path).await?),
        None => {
            warn!("No state file configured; catalog changes last only for this process");
            Arc::new(MemoryStore::new())
        }
    };
    let audit: Arc<dyn AuditLog> = match &config.storage.audit_log {
        Some(path) => Arc::new(JsonlAuditLog::new(path)),
        None => Arc::new(TracingAuditLog),
    };

    let registry = Arc::new(Registry::new(store.clone()));
    let monitor = Arc::new(ServiceMonitor::new(store.clone(), &config.monitor));
    let gateway = Arc::new(Gateway::new(registry.clone(), &config.gateway)?);
    let broker = ToolBroker::new(
        registry,
        monitor,
        gateway,
        Arc::new(RoleAccess::new(&config.access)),
        audit.clone(),
    );
    let sandbox = SandboxExecutor::new(&config.sandbox, store, audit)
        .context("failed to start script sandbox")?;

    broker.hydrate().await?;
    sandbox.hydrate().await?;

    let actor = Actor::new(cli.actor, cli.role);
    let outcome = dispatch(cli.command, &actor, &broker, &sandbox).await;
    sandbox.shutdown();
    outcome
}

async fn dispatch(
    command: Command,
    actor: &Actor,
    broker: &ToolBroker,
    sandbox: &SandboxExecutor,
) -> Result<()> {
    match command {
        Command::Services => print_json(&broker.list_services(actor).await),
        Command::Register(args) => {
            let registration = ServiceRegistration {
                name: args.name,
                base_url: args.url,
                description: args.description,
                capabilities: args.capabilities,
                auth_token: args.token,
                timeout_ms: args.timeout_ms,
                allowed_roles: Some(args.allowed_roles),
            };
            print_json(&broker.register_service(actor, registration).await?)
        }
        Command::Unregister { name } => {
            let existed = broker.unregister_service(actor, &name).await?;
            print_json(&serde_json::json!({ "name": name, "removed": existed }))
        }
        Command::Call {
            server,
            tool,
            args,
            capability,
        } => {
            let mut request = GatewayRequest::new(server, tool);
            if let Some(raw) = args {
                request = request.with_args(
                    serde_json::from_str(&raw).context("--args must be valid JSON")?,
                );
            }
            if let Some(capability) = capability {
                request = request.with_capability(capability);
            }
            print_json(&broker.invoke(actor, request).await?)
        }
        Command::Status { name: Some(name) } => print_json(&broker.status(actor, &name).await?),
        Command::Status { name: None } => print_json(&broker.statuses(actor).await),
        Command::Check { name } => print_json(&broker.check_health(actor, &name).await?),
        Command::Policy(args) => {
            let patch = PolicyPatch {
                limit_per_minute: args.limit_per_minute,
                burst_multiplier: args.burst_multiplier,
                failure_threshold: args.failure_threshold,
                cooldown_seconds: args.cooldown_seconds,
                minimum_samples: args.minimum_samples,
            };
            if patch == PolicyPatch::default() {
                print_json(&broker.status(actor, &args.name).await?.policy)
            } else {
                print_json(&broker.update_policy(actor, &args.name, patch).await?)
            }
        }
        Command::Scripts(command) => scripts(command, actor, sandbox).await,
        Command::Run { id } => {
            let result = sandbox.run(&id, RunOptions::manual(&actor.id)).await?;
            print_json(&result)
        }
        Command::Daemon => {
            let scheduled = sandbox
                .list_scripts()
                .await
                .iter()
                .filter(|s| s.schedule_period_ms().is_some())
                .count();
            info!(scheduled, "Switchyard daemon running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            Ok(())
        }
    }
}

async fn scripts(command: ScriptsCommand, actor: &Actor, sandbox: &SandboxExecutor) -> Result<()> {
    match command {
        ScriptsCommand::List => print_json(&sandbox.list_scripts().await),
        ScriptsCommand::Add {
            id,
            name,
            entry,
            description,
            schedule_ms,
            env,
            environment,
        } => {
            let definition = SandboxScriptDefinition {
                id,
                name,
                entry_file: entry,
                description,
                schedule_ms,
                env: env.into_iter().collect::<BTreeMap<_, _>>(),
                environment_id: environment,
            };
            print_json(&sandbox.register_script(actor, definition).await?)
        }
        ScriptsCommand::Remove { id } => {
            let existed = sandbox.remove_script(actor, &id).await?;
            print_json(&serde_json::json!({ "id": id, "removed": existed }))
        }
        ScriptsCommand::History { id } => print_json(&sandbox.recent_runs(&id)),
        ScriptsCommand::Envs => print_json(&sandbox.list_environments().await),
        ScriptsCommand::EnvSet {
            id,
            name,
            description,
            variables,
        } => {
            let environment = SandboxEnvironmentDefinition {
                id,
                name,
                description,
                variables: variables.into_iter().collect(),
            };
            print_json(&sandbox.register_environment(actor, environment).await?)
        }
        ScriptsCommand::EnvRemove { id, force } => {
            let existed = sandbox.remove_environment(actor, &id, force).await?;
            print_json(&serde_json::json!({ "id": id, "removed": existed }))
        }
    }
}
