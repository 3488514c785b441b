//! # switchyard-host — Script sandbox
//!
//! WebAssembly scripts run under Wasmtime with a wall-clock budget, an
//! explicit environment, and optional periodic scheduling.

mod engine;
mod environment;
mod executor;
mod scheduler;

pub use engine::{ExecutionOutcome, ScriptEngine};
pub use environment::{ambient_environment, compose_environment};
pub use executor::{RunOptions, SandboxExecutor};
pub use scheduler::{OverlapPolicy, ScheduleState, Scheduler, Tick, TickFuture};
