//! The seam between the controller and whatever actually runs the guest.
//!
//! A [`ModuleLoader`] plays the role of dynamic `import()`: given the URL of
//! the linked agent module it produces an [`AgentModule`] whose exports the
//! controller can call. The Wasmtime component runtime is one loader; tests
//! plug in scripted ones.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use url::Url;

use crate::blob::ModuleStore;
use crate::bridge::HostCapabilities;
use crate::link::LinkOutput;

/// Export called for navigation events.
pub const ON_VISIT: &str = "onVisit";

/// An error thrown by guest code or raised while loading it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestError {
    pub message: String,
    /// Stack trace, when the runtime provides one.
    pub stack: Option<String>,
}

impl GuestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// First `line:column` pair found in the stack (1-based).
    pub fn location(&self) -> Option<(usize, usize)> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r":(\d+):(\d+)").expect("location regex"));

        let caps = re.captures(self.stack.as_deref()?)?;
        let line = caps[1].parse().ok()?;
        let column = caps[2].parse().ok()?;
        Some((line, column))
    }
}

impl fmt::Display for GuestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for GuestError {}

/// What a loader may consult while importing the agent module.
#[derive(Debug, Clone, Copy)]
pub struct ImportScope<'a> {
    /// Resolves every URL minted for this execution.
    pub store: &'a ModuleStore,
    /// The capability object adapters are bound to.
    pub capabilities: &'a HostCapabilities,
    pub link: &'a LinkOutput,
}

/// Imports a linked agent module.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    /// Import the module at `url`.
    ///
    /// Failures become `load-error`.
    async fn import(
        &self,
        url: &Url,
        scope: ImportScope<'_>,
    ) -> Result<Box<dyn AgentModule>, GuestError>;
}

/// An imported agent module.
#[async_trait]
pub trait AgentModule: Send {
    /// Names of the callable exports. Nested exports use dotted names
    /// (`exports.init`).
    fn exports(&self) -> BTreeSet<String>;

    /// Call an export and await its result.
    async fn call(&mut self, export: &str, args: Vec<Value>) -> Result<Value, GuestError>;
}

/// Lifecycle export chosen for an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    Init,
    NestedInit,
    Run,
    RunCode,
}

impl EntryPoint {
    /// Selection order; first match wins.
    pub const ORDER: [EntryPoint; 4] = [
        EntryPoint::Init,
        EntryPoint::NestedInit,
        EntryPoint::Run,
        EntryPoint::RunCode,
    ];

    pub fn select(exports: &BTreeSet<String>) -> Option<Self> {
        Self::ORDER
            .into_iter()
            .find(|entry| exports.contains(entry.export_name()))
    }

    pub fn export_name(self) -> &'static str {
        match self {
            EntryPoint::Init => "init",
            EntryPoint::NestedInit => "exports.init",
            EntryPoint::Run => "run",
            EntryPoint::RunCode => "runCode",
        }
    }

    /// Whether the entry point receives `args.code`.
    pub fn takes_code(self) -> bool {
        matches!(self, EntryPoint::Run | EntryPoint::RunCode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exports(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_entry_point_selection_order() {
        assert_eq!(
            EntryPoint::select(&exports(&["runCode", "run", "init"])),
            Some(EntryPoint::Init)
        );
        assert_eq!(
            EntryPoint::select(&exports(&["runCode", "exports.init"])),
            Some(EntryPoint::NestedInit)
        );
        assert_eq!(
            EntryPoint::select(&exports(&["runCode", "run"])),
            Some(EntryPoint::Run)
        );
        assert_eq!(
            EntryPoint::select(&exports(&["runCode", "onVisit"])),
            Some(EntryPoint::RunCode)
        );
        assert_eq!(EntryPoint::select(&exports(&["onVisit"])), None);
    }

    #[test]
    fn test_guest_error_location() {
        let err = GuestError::new("boom")
            .with_stack("Error: boom\n    at init (blob:quest-sandbox/main/main-0a:12:7)");
        assert_eq!(err.location(), Some((12, 7)));
        assert_eq!(GuestError::new("boom").location(), None);
    }
}
