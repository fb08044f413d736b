//! The shared Wasmtime engine.
//!
//! The [`WasmEngine`] is shared by every execution of a sandbox. It is
//! configured for the component model with async host functions, fuel
//! metering and optional epoch interruption.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use quest_sandbox_common::{EngineConfig, EngineError};

/// Interval between epoch ticks; [`ExecutionConfig::timeout_ms`] counts
/// these.
///
/// [`ExecutionConfig::timeout_ms`]: quest_sandbox_common::ExecutionConfig::timeout_ms
pub const EPOCH_TICK: Duration = Duration::from_millis(1);

/// Engine shared by every agent a sandbox runs.
///
/// # Configuration
///
/// - **Component Model**: agents are WebAssembly components
/// - **Async Support**: host interfaces await bridge responses
/// - **Fuel Metering**: deterministic CPU limiting per export call
/// - **Epoch Interruption**: optional wall-clock deadline per export call
/// - **Pooling Allocator**: optional pre-allocated instance slots
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the Wasmtime configuration is invalid or the
    /// pooling allocator cannot be initialized.
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let mut wasmtime_config = Config::new();

        wasmtime_config.wasm_component_model(true);
        wasmtime_config.async_support(true);
        wasmtime_config.consume_fuel(true);

        if config.epoch_interruption {
            wasmtime_config.epoch_interruption(true);
        }

        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);
            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            EngineError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!(
            epoch_interruption = config.epoch_interruption,
            "Component engine ready"
        );

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_component_instances(config.max_instances);
        // A component instantiates several core modules (adapters, shims).
        pooling.total_core_instances(config.max_instances.saturating_mul(8));
        pooling.total_memories(config.max_instances.saturating_mul(2));
        pooling.total_tables(config.max_instances.saturating_mul(4));

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Advance the epoch by one tick.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    /// Spawn a task that increments the epoch every [`EPOCH_TICK`].
    ///
    /// Returns `None` when epoch interruption is disabled. The task runs
    /// until aborted.
    pub fn spawn_epoch_ticker(&self) -> Option<JoinHandle<()>> {
        if !self.config.epoch_interruption {
            return None;
        }

        let engine = self.engine.clone();
        debug!(tick_ms = EPOCH_TICK.as_millis(), "Starting epoch ticker");
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(EPOCH_TICK);
            loop {
                interval.tick().await;
                engine.increment_epoch();
            }
        }))
    }

    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("epoch_interruption", &self.config.epoch_interruption)
            .field("max_instances", &self.config.max_instances)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_on_demand_and_pooled_engines() {
        let on_demand = WasmEngine::new(&EngineConfig::default()).unwrap();
        assert!(!on_demand.is_pooling_enabled());

        let pooled = WasmEngine::new(&EngineConfig {
            pooling_allocator: true,
            max_instances: 2,
            ..Default::default()
        })
        .unwrap();
        assert!(pooled.is_pooling_enabled());
    }

    #[tokio::test]
    async fn test_epoch_ticker_only_when_enabled() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        assert!(engine.spawn_epoch_ticker().is_none());

        let config = EngineConfig {
            epoch_interruption: true,
            ..Default::default()
        };
        let engine = WasmEngine::new(&config).unwrap();
        let ticker = engine.spawn_epoch_ticker().unwrap();
        ticker.abort();
    }

    #[test]
    fn test_engine_clones_share_epoch() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let clone = engine.clone();
        assert!(std::ptr::eq(engine.inner(), clone.inner()));
        assert!(format!("{clone:?}").contains("epoch_interruption"));
    }
}
