//! Per-execution store state.
//!
//! This module provides:
//! - [`AgentContext`]: state reachable from host interface functions
//! - [`ExecutionMetrics`]: fuel and timing for the calls made so far

use std::time::{Duration, Instant};

use wasmtime::Store;
use wasmtime::component::ResourceTable;
use wasmtime_wasi::{WasiCtx, WasiCtxBuilder, WasiView};

use quest_sandbox_common::{EngineError, ExecutionConfig};
use quest_sandbox_core::HostCapabilities;

use crate::WasmEngine;

/// State owned by one agent's store.
///
/// Host interface functions reach the bridge through `capabilities`, so
/// every call they make is tagged with this agent's instance id.
pub struct AgentContext {
    wasi: WasiCtx,
    table: ResourceTable,

    /// The capability object this agent was loaded with.
    pub capabilities: HostCapabilities,

    pub metrics: ExecutionMetrics,

    start_time: Instant,
}

/// Execution metrics across export calls.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetrics {
    /// Fuel consumed by all calls.
    pub fuel_consumed: u64,

    /// Number of export calls made.
    pub calls: u32,

    /// Time spent inside export calls.
    pub busy: Duration,
}

impl AgentContext {
    pub fn new(capabilities: HostCapabilities) -> Self {
        // Guests get no filesystem, environment or network; stderr is kept
        // so panics in guest toolchains stay visible.
        let wasi = WasiCtxBuilder::new().inherit_stderr().build();

        Self {
            wasi,
            table: ResourceTable::new(),
            capabilities,
            metrics: ExecutionMetrics::default(),
            start_time: Instant::now(),
        }
    }

    pub fn instance_id(&self) -> &str {
        self.capabilities.instance_id()
    }

    /// Time since the store was created.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Account for one finished export call.
    pub fn record_call(&mut self, fuel: u64, busy: Duration) {
        self.metrics.calls += 1;
        self.metrics.fuel_consumed = self.metrics.fuel_consumed.saturating_add(fuel);
        self.metrics.busy += busy;
    }
}

impl WasiView for AgentContext {
    fn table(&mut self) -> &mut ResourceTable {
        &mut self.table
    }

    fn ctx(&mut self) -> &mut WasiCtx {
        &mut self.wasi
    }
}

/// Create a store for one agent.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(
    engine: &WasmEngine,
    config: &ExecutionConfig,
    capabilities: HostCapabilities,
) -> Result<Store<AgentContext>, EngineError> {
    let mut store = Store::new(engine.inner(), AgentContext::new(capabilities));
    arm_limits(&mut store, engine, config)?;
    Ok(store)
}

/// Reset the fuel budget and epoch deadline before an export call.
///
/// Every lifecycle call (the entry point and each `onVisit`) gets a full
/// budget of its own.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn arm_limits(
    store: &mut Store<AgentContext>,
    engine: &WasmEngine,
    config: &ExecutionConfig,
) -> Result<(), EngineError> {
    // The engine always meters fuel; "off" means an effectively unlimited tank.
    let fuel = if config.fuel_metering {
        config.max_fuel
    } else {
        u64::MAX
    };
    store
        .set_fuel(fuel)
        .map_err(|e| EngineError::invalid_config(format!("Failed to set fuel: {e}")))?;

    // One epoch tick per millisecond, see `WasmEngine::spawn_epoch_ticker`.
    if engine.config().epoch_interruption {
        store.set_epoch_deadline(config.timeout_ms);
    }

    Ok(())
}

/// Get remaining fuel from a store.
pub fn get_remaining_fuel(store: &Store<AgentContext>) -> Option<u64> {
    store.get_fuel().ok()
}

/// Calculate fuel consumed.
pub fn calculate_fuel_consumed(initial_fuel: u64, store: &Store<AgentContext>) -> u64 {
    let remaining = get_remaining_fuel(store).unwrap_or(0);
    initial_fuel.saturating_sub(remaining)
}
