//! Wasmtime runtime for sandboxed scripts.
//!
//! Scripts are core WebAssembly modules (binary or text format) targeting
//! WASI preview1. The entry point is an exported `run` function, falling
//! back to the WASI command export `_start`. Standard output becomes the
//! run's output; the last non-empty line of standard error becomes the
//! error message when the run fails.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use wasmtime::{Config, Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap, Val};
use wasmtime_wasi::pipe::MemoryOutputPipe;
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{I32Exit, WasiCtxBuilder};

use crate::config::SandboxConfig;

/// How often the epoch advances; guest code yields to the runtime at most
/// this long after an epoch tick.
const EPOCH_TICK: Duration = Duration::from_millis(10);

pub struct SandboxState {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
}

/// What a finished script left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub output: String,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            error: Some(error.into()),
        }
    }
}

pub struct ScriptEngine {
    engine: Engine,
    linker: Linker<SandboxState>,
    budget: Duration,
    max_memory_bytes: usize,
    max_output_bytes: usize,
    fuel_limit: Option<u64>,
    ticker: JoinHandle<()>,
}

impl ScriptEngine {
    /// Must be called from within a Tokio runtime; the epoch ticker is a task.
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        let mut wasm_config = Config::new();
        wasm_config.async_support(true);
        wasm_config.epoch_interruption(true);
        if config.fuel_limit.is_some() {
            wasm_config.consume_fuel(true);
        }

        let engine = Engine::new(&wasm_config)?;
        let mut linker = Linker::new(&engine);
        preview1::add_to_linker_async(&mut linker, |state: &mut SandboxState| &mut state.wasi)?;

        let runtime = tokio::runtime::Handle::try_current()
            .context("script engine requires a Tokio runtime")?;
        let ticker_engine = engine.clone();
        let ticker = runtime.spawn(async move {
            let mut tick = tokio::time::interval(EPOCH_TICK);
            loop {
                tick.tick().await;
                ticker_engine.increment_epoch();
            }
        });

        Ok(Self {
            engine,
            linker,
            budget: Duration::from_millis(config.execution_budget_ms),
            max_memory_bytes: config.max_memory_bytes,
            max_output_bytes: config.max_output_bytes,
            fuel_limit: config.fuel_limit,
            ticker,
        })
    }

    /// Compile and run one script to completion or until the budget runs out.
    /// Never fails; every problem is folded into the outcome.
    pub async fn execute(
        &self,
        source: &[u8],
        program: &str,
        env: &BTreeMap<String, String>,
    ) -> ExecutionOutcome {
        let stdout = MemoryOutputPipe::new(self.max_output_bytes);
        let stderr = MemoryOutputPipe::new(self.max_output_bytes);

        let run = self.run_module(source, program, env, stdout.clone(), stderr.clone());
        let result = tokio::time::timeout(self.budget, run).await;

        let output = String::from_utf8_lossy(&stdout.contents()).into_owned();
        let diagnostics = String::from_utf8_lossy(&stderr.contents()).into_owned();
        let error = match result {
            Err(_) => Some(format!(
                "script exceeded its execution budget of {}ms",
                self.budget.as_millis()
            )),
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(last_line(&diagnostics).unwrap_or_else(|| describe(&e))),
        };
        ExecutionOutcome { output, error }
    }

    async fn run_module(
        &self,
        source: &[u8],
        program: &str,
        env: &BTreeMap<String, String>,
        stdout: MemoryOutputPipe,
        stderr: MemoryOutputPipe,
    ) -> Result<()> {
        let module = Module::new(&self.engine, source).context("failed to compile script")?;

        let mut builder = WasiCtxBuilder::new();
        builder.stdout(stdout).stderr(stderr).arg(program);
        for (key, value) in env {
            builder.env(key, value);
        }
        let state = SandboxState {
            wasi: builder.build_p1(),
            limits: StoreLimitsBuilder::new()
                .memory_size(self.max_memory_bytes)
                .build(),
        };

        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);
        store.set_epoch_deadline(1);
        store.epoch_deadline_async_yield_and_update(1);
        if let Some(fuel) = self.fuel_limit {
            store.set_fuel(fuel)?;
        }

        let instance = self.linker.instantiate_async(&mut store, &module).await?;
        let entry = instance
            .get_func(&mut store, "run")
            .or_else(|| instance.get_func(&mut store, "_start"))
            .ok_or_else(|| anyhow!("script exports neither `run` nor `_start`"))?;

        let ty = entry.ty(&store);
        if ty.params().len() != 0 {
            bail!("entry point must not take parameters");
        }
        let mut results = vec![Val::I32(0); ty.results().len()];

        match entry.call_async(&mut store, &[], &mut results).await {
            Ok(()) => {}
            Err(e) => match e.downcast_ref::<I32Exit>() {
                Some(I32Exit(0)) => return Ok(()),
                Some(I32Exit(code)) => bail!("script exited with status {code}"),
                None => return Err(e),
            },
        }

        if let Some(Val::I32(code)) = results.first() {
            if *code != 0 {
                bail!("script returned status {code}");
            }
        }
        Ok(())
    }
}

impl Drop for ScriptEngine {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

fn last_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(str::to_string)
}

fn describe(error: &anyhow::Error) -> String {
    match error.downcast_ref::<Trap>() {
        Some(trap) => trap.to_string(),
        None => format!("{error:#}"),
    }
}
