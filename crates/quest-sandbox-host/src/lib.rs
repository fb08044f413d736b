//! Host side of quest-sandbox.
//!
//! This crate answers the capability requests a sandboxed agent posts over
//! the channel.
//!
//! # Modules
//!
//! - [`registry`]: Wire type to handler table with permission checks
//! - [`quest`]: Tasks, items and notifications behind `quest.*`
//! - [`logging`]: Guest `console.log` output
//! - [`ask`]: Forwarding of `ai.ask` prompts over HTTP
//! - [`permissions`]: Which capabilities an agent may use
//! - [`host`]: The channel endpoint and the handle that drives executions
//!
//! # Security Model
//!
//! 1. **Permissions**: every dispatch checks the capability against the
//!    host's permission set.
//! 2. **Rate Limiting**: forwarded prompts are counted against a budget.
//! 3. **SSRF Protection**: the AI endpoint may not be a private address.

pub mod ask;
pub mod host;
pub mod logging;
pub mod permissions;
pub mod quest;
pub mod registry;

pub use ask::AiForwarder;
pub use host::{HostError, HostHandle, SandboxHost, new_instance_id};
pub use logging::GuestLog;
pub use permissions::Permissions;
pub use quest::{QuestBook, TaskStatus};
pub use registry::{CapabilityHandler, CapabilityRegistry, DispatchError, FnHandler};
