//! Configuration structures for quest-sandbox.
//!
//! - [`RuntimeConfig`]: everything a sandbox process needs, grouped below
//! - [`EngineConfig`]: Wasmtime engine settings for the component runtime
//! - [`ExecutionConfig`]: Per-execution limits (fuel, epoch deadline)
//! - [`SandboxConfig`]: Linker and lifecycle controller settings

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sandbox process configuration.
///
/// This structure contains all configuration options for a sandbox.
/// It can be loaded from files (TOML, JSON).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Sandbox (linker and controller) configuration.
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

/// Wasmtime engine configuration.
///
/// These settings affect the engine used by the component runtime.
/// A sandbox runs one agent at a time, so the defaults favour a small
/// on-demand allocator over a large pre-allocated pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for instance creation.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Enable epoch-based interruption.
    ///
    /// When enabled, every export call gets a deadline of
    /// [`ExecutionConfig::timeout_ms`] epoch ticks.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            epoch_interruption: defaults::epoch_interruption(),
        }
    }
}

/// Per-execution configuration for the component runtime.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Maximum fuel (CPU instructions) per export call.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Enable fuel metering.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,

    /// Epoch deadline in milliseconds, used when epoch interruption is on.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_fuel: defaults::max_fuel(),
            fuel_metering: defaults::fuel_metering(),
            timeout_ms: defaults::timeout_ms(),
        }
    }
}

impl ExecutionConfig {
    /// Get the timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Linker and lifecycle controller configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SandboxConfig {
    /// Authority used in minted blob URLs (`blob:<origin>/...`).
    #[serde(default = "defaults::blob_origin")]
    pub blob_origin: String,

    /// Code passed to `run`/`runCode` when the bundle carries no `args.code`.
    #[serde(default = "defaults::default_code")]
    pub default_code: String,

    /// Lines of agent source shown either side of a failing location.
    #[serde(default = "defaults::source_context_lines")]
    pub source_context_lines: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            blob_origin: defaults::blob_origin(),
            default_code: defaults::default_code(),
            source_context_lines: defaults::source_context_lines(),
        }
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        false
    }

    pub const fn max_instances() -> u32 {
        16
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn epoch_interruption() -> bool {
        false
    }

    pub const fn max_fuel() -> u64 {
        1_000_000_000
    }

    pub const fn fuel_metering() -> bool {
        true
    }

    pub const fn timeout_ms() -> u64 {
        5_000
    }

    pub fn blob_origin() -> String {
        "quest-sandbox".to_string()
    }

    pub fn default_code() -> String {
        "void 0;".to_string()
    }

    pub const fn source_context_lines() -> usize {
        10
    }
}
