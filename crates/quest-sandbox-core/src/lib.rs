//! Agent execution substrate for quest-sandbox.
//!
//! This crate holds everything that runs on the sandbox side of the
//! channel:
//! - [`Bridge`]: correlated request/response transport to the host
//! - [`ModuleStore`]: in-memory `blob:` URLs with a shared lifetime
//! - [`ModuleLinker`]: import graph rewriting and adapter generation
//! - [`LifecycleController`] and [`Sandbox`]: execution and event delivery
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐ ExecuteAgent ┌─────────────────────────────────────────┐
//! │          │─────────────▶│ Sandbox (one task)                      │
//! │   Host   │              │   LifecycleController                   │
//! │          │◀─────────────│     ├─ ModuleLinker ──▶ ModuleStore     │
//! └──────────┘ requests /   │     ├─ ModuleLoader (runtime seam)      │
//!              completion   │     └─ HostCapabilities ──▶ Bridge      │
//!                           └─────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod blob;
pub mod bridge;
pub mod controller;
pub mod link;

pub use agent::{AgentModule, EntryPoint, GuestError, ImportScope, ModuleLoader};
pub use blob::{ModuleHandle, ModuleKind, ModuleStore};
pub use bridge::{Bridge, HostCapabilities};
pub use controller::{HostEvent, LifecycleController, Sandbox};
pub use link::{AdapterModule, ImportSpecifier, LinkInput, LinkOutput, ModuleLinker};
