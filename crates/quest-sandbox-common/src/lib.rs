//! Common types, errors, and utilities for quest-sandbox.
//!
//! This crate provides shared functionality used across the quest-sandbox workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for runtime settings
//! - The wire protocol spoken between the sandbox and its host

pub mod config;
pub mod config_file;
pub mod error;
pub mod protocol;

pub use config::{EngineConfig, ExecutionConfig, RuntimeConfig, SandboxConfig};
pub use error::{CapabilityError, EngineError, ErrorKind, ProtocolError, SandboxError};
pub use protocol::{Capability, HostMessage, SandboxMessage, SourceBundle};
