//! Wasmtime component runtime for quest-sandbox.
//!
//! This crate plugs WebAssembly components into the lifecycle controller:
//! - [`WasmEngine`]: shared engine with fuel metering and optional epochs
//! - [`CompiledComponent`]: validated, compiled agent component
//! - [`AgentContext`]: per-agent store state bound to the bridge
//! - [`ComponentLoader`]: the [`ModuleLoader`](quest_sandbox_core::ModuleLoader)
//!   that instantiates components against the quest host interfaces
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmEngine                          │
//! │  (Shared across executions)                             │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                  CompiledComponent                      │
//! │  (Cached by content hash)                               │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │        Store<AgentContext> + component Instance         │
//! │  (Per agent, lives until teardown)                      │
//! │  - Fuel and epoch limits per export call                │
//! │  - Host interfaces ──▶ HostCapabilities ──▶ Bridge      │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod engine;
pub mod instance;
pub mod linker;
pub mod module;
pub mod store;

pub use engine::WasmEngine;
pub use instance::{ComponentAgent, ComponentLoader};
pub use linker::Status;
pub use module::{CompiledComponent, is_component_binary};
pub use store::{AgentContext, ExecutionMetrics};
