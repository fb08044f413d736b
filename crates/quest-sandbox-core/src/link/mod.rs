//! Module linker.
//!
//! Turns a bundle's in-memory sources into a graph of minted module URLs:
//!
//! ```text
//!   shims ──realize (topological)──▶ shim URLs ─┐
//!   wasm files ──publish──────────▶ wasm URLs ──┤
//!                                               ▼
//!   main source ──scan imports──▶ adapters ──▶ rewritten main ──▶ main URL
//! ```
//!
//! The linker holds no state of its own; every URL lives in the
//! [`ModuleStore`] passed to [`ModuleLinker::link`].

pub mod adapter;
pub mod scan;
pub mod shims;
pub mod specifier;

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, instrument, warn};

use quest_sandbox_common::{SandboxError, SourceBundle};

pub use adapter::{AdapterBinding, AdapterModule, InterfaceTemplate, TemplateFunction};
pub use specifier::ImportSpecifier;

use crate::blob::{JAVASCRIPT_MIME, ModuleHandle, ModuleKind, ModuleStore, WASM_MIME};

/// Key of the rewritten agent module.
pub const MAIN_KEY: &str = "main";

/// Key of the capability-object module.
pub const BRIDGE_KEY: &str = "bridge";

/// Sources to link.
#[derive(Debug, Clone, Copy)]
pub struct LinkInput<'a> {
    pub main_source: &'a str,
    pub shims: &'a BTreeMap<String, String>,
    pub wasm_files: &'a BTreeMap<String, Vec<u8>>,
}

impl<'a> From<&'a SourceBundle> for LinkInput<'a> {
    fn from(bundle: &'a SourceBundle) -> Self {
        Self {
            main_source: &bundle.main_source,
            shims: &bundle.shims,
            wasm_files: &bundle.wasm_files,
        }
    }
}

/// Everything the linker minted for one execution.
#[derive(Debug, Clone)]
pub struct LinkOutput {
    /// The rewritten agent module.
    pub main: ModuleHandle,
    /// Its source text.
    pub main_source: String,
    pub bridge: ModuleHandle,
    pub shims: BTreeMap<String, ModuleHandle>,
    pub wasm: BTreeMap<String, ModuleHandle>,
    /// Adapters keyed by the import specifier they replace.
    pub adapters: BTreeMap<String, AdapterModule>,
    /// Names the agent module exports.
    pub exports: BTreeSet<String>,
}

impl LinkOutput {
    pub fn adapter(&self, specifier: &str) -> Option<&AdapterModule> {
        self.adapters.get(specifier)
    }

    /// Wasm handles in the order their URLs appear in the main source,
    /// followed by any that do not appear.
    pub fn wasm_by_reference(&self) -> Vec<&ModuleHandle> {
        let mut ordered: Vec<(usize, &ModuleHandle)> = self
            .wasm
            .values()
            .map(|handle| {
                let at = self
                    .main_source
                    .find(handle.url().as_str())
                    .unwrap_or(usize::MAX);
                (at, handle)
            })
            .collect();
        ordered.sort_by_key(|(at, _)| *at);
        ordered.into_iter().map(|(_, handle)| handle).collect()
    }
}

/// Rewrites a bundle's import graph into minted module URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleLinker;

impl ModuleLinker {
    pub fn new() -> Self {
        Self
    }

    /// Link a bundle into `store`.
    ///
    /// # Errors
    ///
    /// Shim realization errors abort immediately. Main-source diagnostics
    /// (unknown specifiers, malformed imports) are all collected and
    /// reported together.
    #[instrument(skip_all, fields(shims = input.shims.len(), wasm = input.wasm_files.len()))]
    pub fn link(
        &self,
        store: &ModuleStore,
        input: LinkInput<'_>,
    ) -> Result<LinkOutput, SandboxError> {
        let shims = shims::realize_shims(store, input.shims)?;
        let wasm = publish_wasm(store, input.wasm_files)?;
        let bridge = store.mint(
            ModuleKind::Bridge,
            BRIDGE_KEY,
            adapter::bridge_module_source(),
            JAVASCRIPT_MIME,
        )?;

        let sites = scan::scan_import_sites(input.main_source);
        let mut diagnostics = sites.diagnostics;
        let mut adapters = BTreeMap::new();

        for (text, requested) in &sites.requested {
            let spec = match ImportSpecifier::parse(text) {
                Ok(Some(spec)) if spec.needs_adapter() => spec,
                Ok(_) => continue,
                Err(e) => {
                    diagnostics.push(e);
                    continue;
                }
            };
            match AdapterModule::generate(text, &spec, requested, &shims, bridge.url()) {
                Ok(adapter) => {
                    adapters.insert(text.clone(), adapter);
                }
                Err(e) => diagnostics.push(e),
            }
        }

        if !diagnostics.is_empty() {
            warn!(count = diagnostics.len(), "Main module failed to link");
            return Err(SandboxError::from_diagnostics(diagnostics));
        }

        for adapter in adapters.values_mut() {
            let handle = store.mint(
                ModuleKind::Adapter,
                &adapter.specifier,
                adapter.source.as_str(),
                JAVASCRIPT_MIME,
            )?;
            debug!(specifier = %adapter.specifier, url = %handle.url(), "Adapter minted");
            adapter.handle = Some(handle);
        }

        let main_source = rewrite_main(input.main_source, &shims, &wasm, &adapters);
        let main = store.mint(ModuleKind::Main, MAIN_KEY, main_source.as_str(), JAVASCRIPT_MIME)?;
        let exports = scan::export_names(&main_source);

        info!(
            url = %main.url(),
            shims = shims.len(),
            adapters = adapters.len(),
            wasm = wasm.len(),
            exports = exports.len(),
            "Agent module linked"
        );

        Ok(LinkOutput {
            main,
            main_source,
            bridge,
            shims,
            wasm,
            adapters,
            exports,
        })
    }
}

/// Rewrite the main source's imports to minted URLs.
///
/// Specifiers without a replacement are left as they are, so rewriting an
/// already-rewritten source changes nothing.
pub fn rewrite_main(
    source: &str,
    shims: &BTreeMap<String, ModuleHandle>,
    wasm: &BTreeMap<String, ModuleHandle>,
    adapters: &BTreeMap<String, AdapterModule>,
) -> String {
    let (source, unresolved) = scan::rewrite_wasm_urls(source, |file| {
        wasm.get(file).map(|handle| handle.url().to_string())
    });
    for file in unresolved {
        warn!(file = %file, "Wasm URL expression names a file not in the bundle");
    }

    let mut source = source;
    for (file, handle) in wasm {
        source = scan::replace_wasm_literals(&source, file, handle.url().as_str());
    }

    scan::rewrite_import_sites(&source, |spec| {
        if let Some(adapter) = adapters.get(spec) {
            return adapter.handle.as_ref().map(|h| h.url().to_string());
        }
        match ImportSpecifier::parse(spec) {
            Ok(Some(ImportSpecifier::RelativeShim { name })) => {
                shims.get(&name).map(|handle| handle.url().to_string())
            }
            _ => None,
        }
    })
}

fn publish_wasm(
    store: &ModuleStore,
    wasm_files: &BTreeMap<String, Vec<u8>>,
) -> Result<BTreeMap<String, ModuleHandle>, SandboxError> {
    wasm_files
        .iter()
        .map(|(name, bytes)| {
            let handle = store.mint(ModuleKind::Wasm, name, bytes.as_slice(), WASM_MIME)?;
            Ok((name.clone(), handle))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quest_sandbox_common::ErrorKind;

    const MAIN: &str = r#"import { log } from 'component:quest-v1/host-console';
import { registerTask, status } from 'component:quest-v1/host-quest-manager';
import { getStderr } from 'wasi:cli/stderr';
const core = fetchCompile(new URL('./agent.core.wasm', import.meta.url));
export function init() { log('hi'); registerTask('q', 't', status.pending); }
"#;

    fn bundle() -> SourceBundle {
        SourceBundle::new(MAIN, "agent-1")
            .with_shim("cli.js", "import { streams } from './io.js';\nexport const stderr = { getStderr() {} };")
            .with_shim("io.js", "export const streams = {};")
            .with_wasm("agent.core.wasm", b"\0asm\x01\0\0\0".to_vec())
    }

    #[test]
    fn test_link_rewrites_every_import() {
        let store = ModuleStore::new("test");
        let bundle = bundle();
        let output = ModuleLinker::new().link(&store, (&bundle).into()).unwrap();

        assert_eq!(output.adapters.len(), 3);
        for adapter in output.adapters.values() {
            let url = adapter.handle.as_ref().unwrap().url().as_str();
            assert!(output.main_source.contains(&format!("from '{url}'")));
            assert!(!output.main_source.contains(&adapter.specifier));
        }
        let wasm_url = output.wasm["agent.core.wasm"].url().as_str();
        assert!(output.main_source.contains(&format!("fetchCompile('{wasm_url}')")));

        let main = store.resolve(output.main.url().as_str()).unwrap();
        assert_eq!(main.text(), Some(output.main_source.as_str()));
        assert_eq!(output.wasm_by_reference()[0].key(), "agent.core.wasm");
        assert_eq!(output.exports, BTreeSet::from(["init".to_string()]));
    }

    #[test]
    fn test_reexported_wasi_members_are_adapted() {
        let store = ModuleStore::new("test");
        let main = "export { getStderr } from 'wasi:cli/stderr';\n\
                    import * as s from 'wasi:cli/stderr';\n\
                    export function init() { s.getStderr(); }\n";
        let bundle = SourceBundle::new(main, "agent-1")
            .with_shim("cli.js", "export const stderr = { getStderr() {} };");

        let output = ModuleLinker::new().link(&store, (&bundle).into()).unwrap();
        let adapter = output.adapter("wasi:cli/stderr").unwrap();

        assert!(adapter.exports.contains("getStderr"));
        assert!(adapter.source.contains("export const getStderr = _stderr.getStderr;"));
        assert!(!output.main_source.contains("'wasi:cli/stderr'"));
        assert_eq!(
            output.exports,
            BTreeSet::from(["getStderr".to_string(), "init".to_string()])
        );
    }

    #[test]
    fn test_specifiers_inside_string_literals_are_not_linked() {
        let store = ModuleStore::new("test");
        let main = r#"import { log } from 'component:quest-v1/host-console';
const help = "copied from 'component:quest-v1/host-console'";
const hint = "pulled from 'acme:tools/hammer'";
export function init() { log(help + hint); }
"#;
        let bundle = SourceBundle::new(main, "agent-1");

        let output = ModuleLinker::new().link(&store, (&bundle).into()).unwrap();

        assert_eq!(output.adapters.len(), 1);
        assert!(output
            .main_source
            .contains(r#"const help = "copied from 'component:quest-v1/host-console'";"#));
        assert!(output.main_source.contains("'acme:tools/hammer'"));
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let store = ModuleStore::new("test");
        let bundle = bundle();
        let output = ModuleLinker::new().link(&store, (&bundle).into()).unwrap();

        let again = rewrite_main(&output.main_source, &output.shims, &output.wasm, &output.adapters);
        assert_eq!(again, output.main_source);
    }

    #[test]
    fn test_all_main_diagnostics_are_reported() {
        let store = ModuleStore::new("test");
        let main = r#"import { teleport } from 'component:quest-v1/host-teleport';
import { x } from 'acme:tools/hammer';
import { log as } from 'component:quest-v1/host-console';"#;
        let bundle = SourceBundle::new(main, "agent-1");

        let err = ModuleLinker::new().link(&store, (&bundle).into()).unwrap_err();
        let SandboxError::Diagnostics(all) = &err else {
            panic!("expected bundled diagnostics, got {err}");
        };
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].kind(), ErrorKind::MalformedImport);
        assert!(err.to_string().contains("; "));
    }

    #[test]
    fn test_main_relative_shim_import_is_rewritten() {
        let store = ModuleStore::new("test");
        let bundle = SourceBundle::new("import { streams } from './io.js';", "agent-1")
            .with_shim("io", "export const streams = {};");

        let output = ModuleLinker::new().link(&store, (&bundle).into()).unwrap();
        let io_url = output.shims["io"].url().as_str();
        assert_eq!(output.main_source, format!("import {{ streams }} from '{io_url}';"));
    }
}
