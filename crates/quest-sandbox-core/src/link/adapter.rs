//! Adapter modules for WIT import specifiers.
//!
//! An adapter stands in for one `component:*` or `wasi:*` specifier and
//! exports exactly the names its import sites request. Component adapters
//! come from a template table and call capabilities through the bridge
//! module; WASI adapters re-export members of the realized shim for the
//! package.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde_json::{Map, Value};
use url::Url;

use quest_sandbox_common::{Capability, SandboxError};

use super::scan::SiteRequest;
use super::specifier::{ImportSpecifier, camel_case};
use crate::agent::GuestError;
use crate::blob::ModuleHandle;
use crate::bridge::HostCapabilities;

/// Binding of the capability object inside adapters.
const BRIDGE_BINDING: &str = "_bridge";

/// One function of an interface template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateFunction {
    /// JavaScript export name.
    pub export: &'static str,
    /// WIT function name.
    pub wit_name: &'static str,
    pub capability: Capability,
}

/// A constant object exported by a template (WIT enums).
#[derive(Debug, Clone, Copy)]
pub struct TemplateConstant {
    pub export: &'static str,
    /// Property name to WIT case name.
    pub entries: &'static [(&'static str, &'static str)],
}

impl TemplateConstant {
    pub fn to_value(&self) -> Value {
        let object: Map<String, Value> = self
            .entries
            .iter()
            .map(|(key, value)| ((*key).to_string(), Value::from(*value)))
            .collect();
        Value::Object(object)
    }
}

/// Adapter template for one `component:PACKAGE/INTERFACE`.
#[derive(Debug)]
pub struct InterfaceTemplate {
    pub package: &'static str,
    pub interface: &'static str,
    pub functions: &'static [TemplateFunction],
    pub constants: &'static [TemplateConstant],
}

impl InterfaceTemplate {
    pub fn function(&self, export: &str) -> Option<&TemplateFunction> {
        self.functions.iter().find(|f| f.export == export)
    }

    pub fn constant(&self, export: &str) -> Option<&TemplateConstant> {
        self.constants.iter().find(|c| c.export == export)
    }

    /// Every export name, functions first.
    pub fn exports(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.functions
            .iter()
            .map(|f| f.export)
            .chain(self.constants.iter().map(|c| c.export))
    }

    fn provides(&self, export: &str) -> bool {
        self.function(export).is_some() || self.constant(export).is_some()
    }
}

const STATUS: TemplateConstant = TemplateConstant {
    export: "status",
    entries: &[
        ("pending", "pending"),
        ("inProgress", "in-progress"),
        ("completed", "completed"),
        ("failed", "failed"),
    ],
};

const LOG: TemplateFunction = TemplateFunction {
    export: "log",
    wit_name: "log",
    capability: Capability::ConsoleLog,
};

/// The template table.
pub static TEMPLATES: &[InterfaceTemplate] = &[
    InterfaceTemplate {
        package: "quest-v1",
        interface: "host-console",
        functions: &[LOG],
        constants: &[],
    },
    InterfaceTemplate {
        package: "quest-v1",
        interface: "host-quest-manager",
        functions: &[
            TemplateFunction {
                export: "registerTask",
                wit_name: "register-task",
                capability: Capability::QuestRegisterTask,
            },
            TemplateFunction {
                export: "updateTask",
                wit_name: "update-task",
                capability: Capability::QuestUpdateTask,
            },
            TemplateFunction {
                export: "notifyPlayer",
                wit_name: "notify-player",
                capability: Capability::QuestNotifyPlayer,
            },
        ],
        constants: &[STATUS],
    },
    InterfaceTemplate {
        package: "quest-v1",
        interface: "host-events",
        functions: &[TemplateFunction {
            export: "getCurrentUrl",
            wit_name: "get-current-url",
            capability: Capability::QuestGetCurrentUrl,
        }],
        constants: &[],
    },
    InterfaceTemplate {
        package: "quest-v1",
        interface: "host-content",
        functions: &[TemplateFunction {
            export: "registerItem",
            wit_name: "register-item",
            capability: Capability::QuestRegisterItem,
        }],
        constants: &[],
    },
    InterfaceTemplate {
        package: "agent",
        interface: "host-capabilities",
        functions: &[TemplateFunction {
            export: "ask",
            wit_name: "ask",
            capability: Capability::AiAsk,
        }],
        constants: &[],
    },
    InterfaceTemplate {
        package: "agent",
        interface: "host-console",
        functions: &[LOG],
        constants: &[],
    },
];

/// Look up the template for `component:PACKAGE/INTERFACE`.
pub fn template(package: &str, interface: &str) -> Option<&'static InterfaceTemplate> {
    TEMPLATES
        .iter()
        .find(|t| t.package == package && t.interface == interface)
}

/// How an adapter implements its exports.
#[derive(Debug, Clone)]
pub enum AdapterBinding {
    /// Template functions routed to the capability object.
    Template(&'static InterfaceTemplate),
    /// Members of a realized WASI shim.
    Wasi { shim: String, shim_url: Url },
}

/// A generated adapter module.
#[derive(Debug, Clone)]
pub struct AdapterModule {
    /// The original import specifier text.
    pub specifier: String,
    pub spec: ImportSpecifier,
    pub binding: AdapterBinding,
    /// Names the adapter exports.
    pub exports: BTreeSet<String>,
    /// Generated module source.
    pub source: String,
    /// Set once the adapter has been minted.
    pub handle: Option<ModuleHandle>,
}

impl AdapterModule {
    /// Generate the adapter for `specifier` given what its sites request.
    ///
    /// Component adapters export the whole template when a site wants the
    /// whole module or names nothing (side-effect import). WASI adapters
    /// re-export exactly the requested shim members.
    ///
    /// # Errors
    ///
    /// `unknown-specifier` when no template or shim provides the
    /// specifier, or when a requested name is missing from the template
    /// (detail `SPEC#NAME`). `malformed-import` when a WASI specifier is
    /// re-exported wholesale or imported dynamically, since its members
    /// cannot be enumerated.
    pub fn generate(
        specifier: &str,
        spec: &ImportSpecifier,
        requested: &SiteRequest,
        shim_urls: &BTreeMap<String, ModuleHandle>,
        bridge_url: &Url,
    ) -> Result<Self, SandboxError> {
        match spec {
            ImportSpecifier::WitComponent { package, interface } => {
                let template = template(package, interface)
                    .ok_or_else(|| SandboxError::unknown_specifier(specifier))?;

                if let Some(missing) = requested
                    .names
                    .iter()
                    .find(|name| !template.provides(name))
                {
                    return Err(SandboxError::unknown_specifier(format!(
                        "{specifier}#{missing}"
                    )));
                }

                let exports: BTreeSet<String> =
                    if requested.whole_module || requested.names.is_empty() {
                        template.exports().map(str::to_string).collect()
                    } else {
                        requested.names.clone()
                    };
                let source = render_template(template, &exports, bridge_url);

                Ok(Self {
                    specifier: specifier.to_string(),
                    spec: spec.clone(),
                    binding: AdapterBinding::Template(template),
                    exports,
                    source,
                    handle: None,
                })
            }
            ImportSpecifier::WasiPreview2 {
                package, interface, ..
            } => {
                let shim = shim_urls
                    .get(package)
                    .ok_or_else(|| SandboxError::unknown_specifier(specifier))?;
                if requested.opaque {
                    return Err(SandboxError::malformed_import(format!(
                        "members of '{specifier}' cannot be enumerated; import them by name"
                    )));
                }
                let source = render_wasi(interface, &requested.names, shim.url());

                Ok(Self {
                    specifier: specifier.to_string(),
                    spec: spec.clone(),
                    binding: AdapterBinding::Wasi {
                        shim: package.clone(),
                        shim_url: shim.url().clone(),
                    },
                    exports: requested.names.clone(),
                    source,
                    handle: None,
                })
            }
            _ => Err(SandboxError::unknown_specifier(specifier)),
        }
    }

    /// Call an adapter export natively.
    ///
    /// Template functions go through the capability object; template
    /// constants are returned as JSON. WASI adapters are implemented by
    /// script shims and cannot be invoked natively.
    pub async fn invoke(
        &self,
        capabilities: &HostCapabilities,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value, GuestError> {
        if !self.exports.contains(name) {
            return Err(GuestError::new(format!(
                "'{}' does not export '{name}'",
                self.specifier
            )));
        }

        match &self.binding {
            AdapterBinding::Template(template) => {
                if let Some(function) = template.function(name) {
                    Ok(capabilities.call(function.capability, &args).await)
                } else if let Some(constant) = template.constant(name) {
                    Ok(constant.to_value())
                } else {
                    Err(GuestError::new(format!(
                        "'{}' has no template entry for '{name}'",
                        self.specifier
                    )))
                }
            }
            AdapterBinding::Wasi { shim, .. } => Err(GuestError::new(format!(
                "'{}' is implemented by the '{shim}' shim and cannot be invoked natively",
                self.specifier
            ))),
        }
    }
}

/// Source of the module exporting the capability object.
///
/// A script runtime installs the capability object as
/// `globalThis.JCO_BRIDGE` before importing the agent module. The
/// component loader does not evaluate scripts and binds capabilities
/// through its wasmtime linker instead.
pub fn bridge_module_source() -> &'static str {
    "export const bridge = globalThis.JCO_BRIDGE;\n"
}

fn render_template(
    template: &InterfaceTemplate,
    exports: &BTreeSet<String>,
    bridge_url: &Url,
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "import {{ bridge as {BRIDGE_BINDING} }} from '{bridge_url}';"
    );

    for function in template.functions.iter().filter(|f| exports.contains(f.export)) {
        let params: Vec<String> = function
            .capability
            .params()
            .iter()
            .copied()
            .map(param_name)
            .collect();
        let params = params.join(", ");
        let _ = writeln!(
            out,
            "export function {}({params}) {{ return {BRIDGE_BINDING}.{}({params}); }}",
            function.export,
            function.capability.bridge_path(),
        );
    }

    for constant in template.constants.iter().filter(|c| exports.contains(c.export)) {
        let entries: Vec<String> = constant
            .entries
            .iter()
            .map(|(key, value)| format!("{key}: '{value}'"))
            .collect();
        let _ = writeln!(
            out,
            "export const {} = Object.freeze({{ {} }});",
            constant.export,
            entries.join(", ")
        );
    }

    out
}

/// `default` is bound to the interface object itself, as is an adapter
/// that names nothing.
fn render_wasi(interface: &str, names: &BTreeSet<String>, shim_url: &Url) -> String {
    let binding = camel_case(interface);
    let alias = format!("_{binding}");
    let mut out = String::new();
    let _ = writeln!(out, "import {{ {binding} as {alias} }} from '{shim_url}';");
    if names.is_empty() || names.contains("default") {
        let _ = writeln!(out, "export default {alias};");
    }
    for name in names.iter().filter(|name| *name != "default") {
        let _ = writeln!(out, "export const {name} = {alias}.{name};");
    }
    out
}

/// Wire keys that are not usable as JavaScript parameter names.
fn param_name(key: &str) -> String {
    match key {
        "type" => "kind".to_string(),
        other => other.to_string(),
    }
}
