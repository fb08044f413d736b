//! Error types for quest-sandbox.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`SandboxError`]: Errors surfaced to the host at the controller boundary
//! - [`CapabilityError`]: Failures of host-side capability handlers
//! - [`EngineError`]: Wasmtime engine, compilation and trap failures
//! - [`ProtocolError`]: Malformed or unknown wire messages

use std::fmt;
use std::io;

use thiserror::Error;

/// Kind of a [`SandboxError`], as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A shim referenced a name not present among the shims.
    MissingDep,
    /// Shim realization made no progress.
    CircularShims,
    /// A WIT-style import with no template and no shim.
    UnknownSpecifier,
    /// An import group whose bound names do not parse.
    MalformedImport,
    /// The agent exposes no lifecycle entry point.
    NoEntryPoint,
    /// Importing the agent module failed.
    LoadError,
    /// A lifecycle export failed while running.
    RuntimeError,
    /// The bridge lost its transport.
    ChannelError,
    /// An execution was requested while another was running.
    Busy,
    /// An `ExecuteAgent` message that could not be decoded.
    InvalidMessage,
}

impl ErrorKind {
    /// The kebab-case name used in `Error: <kind>: <detail>` results.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MissingDep => "missing-dep",
            ErrorKind::CircularShims => "circular-shims",
            ErrorKind::UnknownSpecifier => "unknown-specifier",
            ErrorKind::MalformedImport => "malformed-import",
            ErrorKind::NoEntryPoint => "no-entry-point",
            ErrorKind::LoadError => "load-error",
            ErrorKind::RuntimeError => "runtime-error",
            ErrorKind::ChannelError => "channel-error",
            ErrorKind::Busy => "busy",
            ErrorKind::InvalidMessage => "invalid-message",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors captured at the lifecycle controller boundary.
///
/// Every variant renders as `<kind>: <detail>`; the controller reports it
/// to the host as `Error: <kind>: <detail>`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    /// A shim imports names that no shim provides.
    #[error("missing-dep: {shim} requires {}", .missing.join(", "))]
    MissingDep {
        /// The shim whose imports cannot be satisfied.
        shim: String,
        /// The referenced shim names that do not exist.
        missing: Vec<String>,
    },

    /// Shim realization stalled on a cycle.
    #[error("circular-shims: {}", .shims.join(", "))]
    CircularShims {
        /// The unresolved shims, sorted by name.
        shims: Vec<String>,
    },

    /// A WIT-style specifier with no template and no shim.
    #[error("unknown-specifier: {specifier}")]
    UnknownSpecifier {
        /// The specifier (or `specifier#name` for a missing export).
        specifier: String,
    },

    /// An import group that could not be parsed.
    #[error("malformed-import: {detail}")]
    MalformedImport {
        /// What was wrong with the import.
        detail: String,
    },

    /// The agent exposes none of the lifecycle exports.
    #[error("no-entry-point: agent exports none of init, exports.init, run, runCode")]
    NoEntryPoint,

    /// Importing the agent module failed.
    #[error("load-error: {reason}")]
    Load {
        /// Description of the load failure.
        reason: String,
    },

    /// A lifecycle export failed.
    #[error("runtime-error: {message}")]
    Runtime {
        /// The guest's error message.
        message: String,
    },

    /// The message channel to the host is gone.
    #[error("channel-error: {reason}")]
    Channel {
        /// Description of the transport failure.
        reason: String,
    },

    /// Another execution is already running.
    #[error("busy: an agent execution is already running")]
    Busy,

    /// An execution request whose payload could not be decoded.
    #[error("invalid-message: {reason}")]
    InvalidMessage {
        /// Why decoding failed.
        reason: String,
    },

    /// Several link diagnostics reported together.
    #[error("{}", join_diagnostics(.0))]
    Diagnostics(Vec<SandboxError>),
}

fn join_diagnostics(diagnostics: &[SandboxError]) -> String {
    diagnostics
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl SandboxError {
    /// Create a new `UnknownSpecifier` error.
    pub fn unknown_specifier(specifier: impl Into<String>) -> Self {
        Self::UnknownSpecifier {
            specifier: specifier.into(),
        }
    }

    /// Create a new `MalformedImport` error.
    pub fn malformed_import(detail: impl Into<String>) -> Self {
        Self::MalformedImport {
            detail: detail.into(),
        }
    }

    /// Create a new `Load` error.
    pub fn load(reason: impl Into<String>) -> Self {
        Self::Load {
            reason: reason.into(),
        }
    }

    /// Create a new `Runtime` error.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Create a new `Channel` error.
    pub fn channel(reason: impl Into<String>) -> Self {
        Self::Channel {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidMessage` error.
    pub fn invalid_message(reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            reason: reason.into(),
        }
    }

    /// Bundle link diagnostics into one error.
    ///
    /// A single diagnostic is returned as-is.
    ///
    /// # Panics
    ///
    /// Panics if `diagnostics` is empty.
    pub fn from_diagnostics(mut diagnostics: Vec<SandboxError>) -> Self {
        assert!(!diagnostics.is_empty(), "no diagnostics to report");
        if diagnostics.len() == 1 {
            diagnostics.remove(0)
        } else {
            Self::Diagnostics(diagnostics)
        }
    }

    /// The wire kind of this error.
    ///
    /// Bundled diagnostics report the kind of the first one.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingDep { .. } => ErrorKind::MissingDep,
            Self::CircularShims { .. } => ErrorKind::CircularShims,
            Self::UnknownSpecifier { .. } => ErrorKind::UnknownSpecifier,
            Self::MalformedImport { .. } => ErrorKind::MalformedImport,
            Self::NoEntryPoint => ErrorKind::NoEntryPoint,
            Self::Load { .. } => ErrorKind::LoadError,
            Self::Runtime { .. } => ErrorKind::RuntimeError,
            Self::Channel { .. } => ErrorKind::ChannelError,
            Self::Busy => ErrorKind::Busy,
            Self::InvalidMessage { .. } => ErrorKind::InvalidMessage,
            Self::Diagnostics(all) => all
                .first()
                .map_or(ErrorKind::MalformedImport, SandboxError::kind),
        }
    }

    /// Returns `true` if this error was produced by the module linker.
    pub fn is_link_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::MissingDep
                | ErrorKind::CircularShims
                | ErrorKind::UnknownSpecifier
                | ErrorKind::MalformedImport
        )
    }

    /// Render the terminal result reported to the host.
    pub fn to_result(&self) -> String {
        format!("Error: {self}")
    }
}

/// Errors from host-side capability handlers.
///
/// The registry reports these to the guest as the `data` of a failed
/// response, so their display form is meant for humans.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    /// The arguments did not match the capability's schema.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// The instance may not use this capability.
    #[error("not permitted: {0}")]
    NotPermitted(String),

    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The handler failed for another reason.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CapabilityError {
    /// The error kind name (`invalid-args`, `not-permitted`, ...).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgs(_) => "invalid-args",
            Self::NotPermitted(_) => "not-permitted",
            Self::NotFound(_) => "not-found",
            Self::Internal(_) => "internal",
        }
    }
}

/// Errors from the Wasmtime-based component runtime.
///
/// These errors represent failures that can occur while compiling,
/// instantiating and calling a component.
#[derive(Error, Debug)]
pub enum EngineError {
    /// WebAssembly compilation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// Component instantiation (linking) failed.
    #[error("Instantiation failed: {reason}")]
    InstantiationFailed {
        /// Description of the instantiation failure.
        reason: String,
    },

    /// Execution exceeded the configured epoch deadline.
    #[error("Execution timeout after {duration_ms}ms")]
    ExecutionTimeout {
        /// The timeout duration in milliseconds.
        duration_ms: u64,
    },

    /// Execution exhausted the configured fuel limit.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// A WebAssembly trap occurred during execution.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InstantiationFailed` error.
    pub fn instantiation_failed(reason: impl Into<String>) -> Self {
        Self::InstantiationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(self, Self::FuelExhausted | Self::ExecutionTimeout { .. })
    }
}

impl From<EngineError> for SandboxError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::CompilationFailed { .. }
            | EngineError::InstantiationFailed { .. }
            | EngineError::InvalidConfig { .. }
            | EngineError::Io(_) => SandboxError::load(err.to_string()),
            EngineError::ExecutionTimeout { .. }
            | EngineError::FuelExhausted
            | EngineError::Trap { .. } => SandboxError::runtime(err.to_string()),
        }
    }
}

/// Errors decoding wire messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The message has no string `type` field.
    #[error("message has no type")]
    MissingType,

    /// The `type` is not one this endpoint understands.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// The message has a known type but the wrong shape.
    #[error("malformed {kind} message: {reason}")]
    Malformed {
        /// The message type.
        kind: String,
        /// What failed to decode.
        reason: String,
    },
}
