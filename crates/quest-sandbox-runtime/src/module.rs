//! WebAssembly component compilation.
//!
//! Agents ship their wasm as bundle payloads. Only components can be
//! instantiated against the quest host interfaces; core modules are
//! rejected with a readable error before Wasmtime sees them.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Instant;

use tracing::{debug, info, instrument};
use wasmtime::component::Component;

use quest_sandbox_common::EngineError;

use crate::WasmEngine;

const WASM_MAGIC: [u8; 4] = *b"\0asm";

/// Version and layer bytes of a component binary.
const COMPONENT_LAYER: [u8; 4] = [0x0d, 0x00, 0x01, 0x00];

/// Whether `bytes` start with the component binary header.
pub fn is_component_binary(bytes: &[u8]) -> bool {
    bytes.len() >= 8 && bytes[..4] == WASM_MAGIC && bytes[4..8] == COMPONENT_LAYER
}

/// A compiled agent component.
///
/// Cheap to clone; the compiled code is shared.
#[derive(Clone)]
pub struct CompiledComponent {
    component: Component,

    /// Hash of the original bytes, used as the cache key.
    content_hash: String,

    compiled_at: Instant,
}

impl CompiledComponent {
    /// Compile a component from its binary encoding.
    ///
    /// # Errors
    ///
    /// Returns `CompilationFailed` if the bytes are not a component or do
    /// not validate.
    #[instrument(skip(engine, bytes), fields(size = bytes.len()))]
    pub fn from_bytes(engine: &WasmEngine, bytes: &[u8]) -> Result<Self, EngineError> {
        if bytes.len() < 8 || bytes[..4] != WASM_MAGIC {
            return Err(EngineError::compilation_failed(
                "not a WebAssembly binary (bad magic number)",
            ));
        }
        if !is_component_binary(bytes) {
            return Err(EngineError::compilation_failed(
                "core WebAssembly module given where a component is required",
            ));
        }

        let start = Instant::now();
        let component = Component::new(engine.inner(), bytes)
            .map_err(|e| EngineError::compilation_failed(format!("{e:#}")))?;

        let compile_time = start.elapsed();
        let content_hash = compute_hash(bytes);
        info!(
            hash = %content_hash,
            compile_time_ms = compile_time.as_millis(),
            "Component compiled"
        );

        Ok(Self {
            component,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Compile a component from WAT text.
    ///
    /// # Errors
    ///
    /// Returns `CompilationFailed` if the text does not parse or validate.
    pub fn from_wat(engine: &WasmEngine, wat: &str) -> Result<Self, EngineError> {
        let component = Component::new(engine.inner(), wat)
            .map_err(|e| EngineError::compilation_failed(format!("{e:#}")))?;
        let content_hash = compute_hash(wat.as_bytes());
        debug!(hash = %content_hash, "Component compiled from WAT");

        Ok(Self {
            component,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    pub fn component(&self) -> &Component {
        &self.component
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Time since compilation.
    pub fn age(&self) -> std::time::Duration {
        self.compiled_at.elapsed()
    }
}

impl std::fmt::Debug for CompiledComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledComponent")
            .field("content_hash", &self.content_hash)
            .field("age", &self.age())
            .finish_non_exhaustive()
    }
}

/// Content hash used as the compilation cache key.
pub fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quest_sandbox_common::EngineConfig;

    fn engine() -> WasmEngine {
        WasmEngine::new(&EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_component_header_detection() {
        let core = wat::parse_str("(module)").unwrap();
        let component = wat::parse_str("(component)").unwrap();

        assert!(!is_component_binary(&core));
        assert!(is_component_binary(&component));
        assert!(!is_component_binary(b"\0asm"));
        assert!(!is_component_binary(b"export default 1;"));
    }

    #[test]
    fn test_compile_component() {
        let bytes = wat::parse_str("(component)").unwrap();
        let compiled = CompiledComponent::from_bytes(&engine(), &bytes).unwrap();
        assert_eq!(compiled.content_hash(), compute_hash(&bytes));
    }

    #[test]
    fn test_core_module_rejected() {
        let bytes = wat::parse_str("(module)").unwrap();
        let err = CompiledComponent::from_bytes(&engine(), &bytes).unwrap_err();
        assert!(err.to_string().contains("component is required"));
    }

    #[test]
    fn test_garbage_rejected() {
        let err = CompiledComponent::from_bytes(&engine(), b"not wasm at all").unwrap_err();
        assert!(err.to_string().contains("bad magic number"));
    }

    #[test]
    fn test_from_wat() {
        let compiled = CompiledComponent::from_wat(&engine(), "(component)").unwrap();
        assert_eq!(compiled.content_hash().len(), 16);
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(compute_hash(b"abc"), compute_hash(b"abc"));
        assert_ne!(compute_hash(b"abc"), compute_hash(b"abd"));
    }
}
