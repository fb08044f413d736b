//! Component instantiation and export calls.
//!
//! [`ComponentLoader`] is the [`ModuleLoader`] used outside tests: it finds
//! the component among the wasm payloads the agent module references,
//! instantiates it against the quest host interfaces and hands back a
//! [`ComponentAgent`] whose exports the lifecycle controller calls.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Number, Value};
use tracing::{debug, info, instrument, warn};
use url::Url;
use wasmtime::component::types::{ComponentItem, Type};
use wasmtime::component::{Func, Instance, Linker, Val};
use wasmtime::{Store, Trap};

use quest_sandbox_common::{EngineError, ExecutionConfig};
use quest_sandbox_core::bridge::render_value;
use quest_sandbox_core::link::specifier::camel_case;
use quest_sandbox_core::{AgentModule, GuestError, ImportScope, ModuleLoader};

use crate::linker;
use crate::module::{CompiledComponent, compute_hash, is_component_binary};
use crate::store::{AgentContext, arm_limits, create_store, get_remaining_fuel};
use crate::WasmEngine;

/// Loads agents whose logic lives in a WebAssembly component.
pub struct ComponentLoader {
    engine: WasmEngine,
    linker: Arc<Linker<AgentContext>>,
    config: ExecutionConfig,
    /// Compiled components keyed by content hash.
    cache: DashMap<String, CompiledComponent>,
}

impl ComponentLoader {
    /// Create a loader with every host interface registered.
    ///
    /// # Errors
    ///
    /// Returns an error if host interface registration fails.
    pub fn new(engine: WasmEngine, config: ExecutionConfig) -> Result<Self, EngineError> {
        let mut linker = Linker::new(engine.inner());
        linker::register_host_interfaces(&mut linker)?;

        Ok(Self {
            engine,
            linker: Arc::new(linker),
            config,
            cache: DashMap::new(),
        })
    }

    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    fn compile(&self, bytes: &[u8]) -> Result<CompiledComponent, EngineError> {
        let hash = compute_hash(bytes);
        if let Some(cached) = self.cache.get(&hash) {
            debug!(hash = %hash, "Component cache hit");
            return Ok(cached.clone());
        }

        let compiled = CompiledComponent::from_bytes(&self.engine, bytes)?;
        self.cache.insert(hash.clone(), compiled.clone());
        debug!(hash = %hash, cached = self.cache.len(), "Component cached");
        Ok(compiled)
    }
}

impl std::fmt::Debug for ComponentLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentLoader")
            .field("engine", &self.engine)
            .field("cache_size", &self.cache.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ModuleLoader for ComponentLoader {
    #[instrument(skip_all, fields(url = %url, instance_id = scope.capabilities.instance_id()))]
    async fn import(
        &self,
        url: &Url,
        scope: ImportScope<'_>,
    ) -> Result<Box<dyn AgentModule>, GuestError> {
        if scope.store.resolve(url.as_str()).is_none() {
            return Err(GuestError::new(format!("module not found: {url}")));
        }

        let bytes = scope
            .link
            .wasm_by_reference()
            .into_iter()
            .filter_map(|handle| scope.store.resolve(handle.url().as_str()))
            .find(|blob| is_component_binary(&blob.content))
            .ok_or_else(|| {
                GuestError::new("no WebAssembly component referenced by the agent module")
            })?;

        let compiled = self.compile(&bytes.content).map_err(engine_error)?;

        let mut store = create_store(&self.engine, &self.config, scope.capabilities.clone())
            .map_err(engine_error)?;
        let instance = self
            .linker
            .instantiate_async(&mut store, compiled.component())
            .await
            .map_err(|e| engine_error(EngineError::instantiation_failed(format!("{e:#}"))))?;

        let exports = bind_exports(&scope.link.exports, discover_exports(&self.engine, &compiled))?;
        info!(
            component = %bytes.key,
            exports = ?exports.keys().collect::<Vec<_>>(),
            "Agent component instantiated"
        );

        Ok(Box::new(ComponentAgent {
            engine: self.engine.clone(),
            config: self.config.clone(),
            store,
            instance,
            exports,
        }))
    }
}

/// Where a callable export lives in the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ExportPath {
    /// Exported instance holding the function, if nested.
    instance: Option<String>,
    func: String,
}

/// Map script-style export names to component export paths.
///
/// Top-level functions are camel-cased (`on-visit` becomes `onVisit`);
/// functions inside an exported instance are reached as
/// `<interface>.<function>`, so an `exports` instance yields
/// `exports.init`.
fn discover_exports(engine: &WasmEngine, compiled: &CompiledComponent) -> BTreeMap<String, ExportPath> {
    let engine = engine.inner();
    let mut exports = BTreeMap::new();

    for (name, item) in compiled.component().component_type().exports(engine) {
        match item {
            ComponentItem::ComponentFunc(_) => {
                exports.insert(
                    camel_case(name),
                    ExportPath {
                        instance: None,
                        func: name.to_string(),
                    },
                );
            }
            ComponentItem::ComponentInstance(instance) => {
                let short = interface_name(name);
                for (func, item) in instance.exports(engine) {
                    if let ComponentItem::ComponentFunc(_) = item {
                        exports.insert(
                            format!("{short}.{}", camel_case(func)),
                            ExportPath {
                                instance: Some(name.to_string()),
                                func: func.to_string(),
                            },
                        );
                    }
                }
            }
            _ => {}
        }
    }

    exports
}

/// Match the linked agent module's exports against the component's.
///
/// Every name the module exports must be a component export, or the
/// instance holding nested ones (`exports` for `exports.init`). Component
/// exports the module does not expose are not callable. `$`-prefixed
/// names are toolchain internals and are not checked.
fn bind_exports(
    module: &BTreeSet<String>,
    component: BTreeMap<String, ExportPath>,
) -> Result<BTreeMap<String, ExportPath>, GuestError> {
    let backs = |name: &str, key: &str| {
        key == name || key.strip_prefix(name).is_some_and(|rest| rest.starts_with('.'))
    };

    if let Some(missing) = module
        .iter()
        .filter(|name| !name.starts_with('$'))
        .find(|name| !component.keys().any(|key| backs(name.as_str(), key.as_str())))
    {
        return Err(GuestError::new(format!(
            "agent module exports '{missing}' but the component does not"
        )));
    }

    Ok(component
        .into_iter()
        .filter(|(key, _)| module.iter().any(|name| backs(name.as_str(), key.as_str())))
        .collect())
}

/// `pkg:ns/iface@1.0.0` to `iface`.
fn interface_name(name: &str) -> &str {
    let name = name.rsplit('/').next().unwrap_or(name);
    name.split('@').next().unwrap_or(name)
}

/// An instantiated agent component.
pub struct ComponentAgent {
    engine: WasmEngine,
    config: ExecutionConfig,
    store: Store<AgentContext>,
    instance: Instance,
    exports: BTreeMap<String, ExportPath>,
}

impl ComponentAgent {
    fn func(&mut self, export: &str) -> Result<Func, GuestError> {
        let path = self
            .exports
            .get(export)
            .ok_or_else(|| GuestError::new(format!("{export} is not a function")))?;

        let parent = match &path.instance {
            Some(name) => Some(
                self.instance
                    .get_export(&mut self.store, None, name)
                    .ok_or_else(|| GuestError::new(format!("export {name} not found")))?,
            ),
            None => None,
        };
        let index = self
            .instance
            .get_export(&mut self.store, parent.as_ref(), &path.func)
            .ok_or_else(|| GuestError::new(format!("export {export} not found")))?;

        self.instance
            .get_func(&mut self.store, index)
            .ok_or_else(|| GuestError::new(format!("{export} is not a function")))
    }
}

#[async_trait]
impl AgentModule for ComponentAgent {
    fn exports(&self) -> BTreeSet<String> {
        self.exports.keys().cloned().collect()
    }

    #[instrument(skip(self, args), fields(instance_id = self.store.data().instance_id()))]
    async fn call(&mut self, export: &str, args: Vec<Value>) -> Result<Value, GuestError> {
        let func = self.func(export)?;

        let params = func
            .params(&self.store)
            .iter()
            .enumerate()
            .map(|(i, (_, ty))| json_to_val(args.get(i).unwrap_or(&Value::Null), ty))
            .collect::<Result<Vec<_>, _>>()?;
        let mut results = vec![Val::Bool(false); func.results(&self.store).len()];

        arm_limits(&mut self.store, &self.engine, &self.config).map_err(engine_error)?;
        let fuel_before = get_remaining_fuel(&self.store).unwrap_or(0);
        let start = Instant::now();

        let outcome = func
            .call_async(&mut self.store, &params, &mut results)
            .await;

        let fuel_used = fuel_before.saturating_sub(get_remaining_fuel(&self.store).unwrap_or(0));
        self.store.data_mut().record_call(fuel_used, start.elapsed());

        if let Err(e) = outcome {
            warn!(export, error = %e, fuel_used, "Export call trapped");
            return Err(trap_error(&e, &self.config));
        }

        func.post_return_async(&mut self.store)
            .await
            .map_err(|e| trap_error(&e, &self.config))?;

        let context = self.store.data();
        debug!(
            export,
            fuel_used,
            calls = context.metrics.calls,
            total_fuel = context.metrics.fuel_consumed,
            busy_ms = context.metrics.busy.as_millis() as u64,
            age_ms = context.elapsed().as_millis() as u64,
            "Export call complete"
        );

        match results.as_slice() {
            [] => Ok(Value::Null),
            [Val::Result(Err(err))] => Err(GuestError::new(
                err.as_deref().map_or_else(|| "error".to_string(), |v| render_value(&val_to_json(v))),
            )),
            [single] => Ok(val_to_json(single)),
            many => Ok(Value::Array(many.iter().map(val_to_json).collect())),
        }
    }
}

impl std::fmt::Debug for ComponentAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentAgent")
            .field("exports", &self.exports.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn engine_error(e: EngineError) -> GuestError {
    GuestError::new(e.to_string())
}

fn trap_error(e: &wasmtime::Error, config: &ExecutionConfig) -> GuestError {
    let err = match e.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => EngineError::FuelExhausted,
        Some(Trap::Interrupt) => EngineError::ExecutionTimeout {
            duration_ms: config.timeout_ms,
        },
        _ => EngineError::trap(format!("{e:#}")),
    };
    GuestError::new(err.to_string()).with_stack(format!("{e:?}"))
}

fn json_to_val(value: &Value, ty: &Type) -> Result<Val, GuestError> {
    let mismatch = || GuestError::new(format!("cannot pass {value} as {ty:?}"));

    Ok(match ty {
        Type::String => Val::String(render_value(value)),
        Type::Bool => Val::Bool(value.as_bool().ok_or_else(mismatch)?),
        Type::S32 => Val::S32(
            value
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .ok_or_else(mismatch)?,
        ),
        Type::U32 => Val::U32(
            value
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(mismatch)?,
        ),
        Type::S64 => Val::S64(value.as_i64().ok_or_else(mismatch)?),
        Type::U64 => Val::U64(value.as_u64().ok_or_else(mismatch)?),
        Type::Float64 => Val::Float64(value.as_f64().ok_or_else(mismatch)?),
        Type::Option(inner) => match value {
            Value::Null => Val::Option(None),
            v => Val::Option(Some(Box::new(json_to_val(v, &inner.ty())?))),
        },
        _ => return Err(mismatch()),
    })
}

fn val_to_json(val: &Val) -> Value {
    match val {
        Val::Bool(b) => Value::Bool(*b),
        Val::S8(n) => Value::from(*n),
        Val::U8(n) => Value::from(*n),
        Val::S16(n) => Value::from(*n),
        Val::U16(n) => Value::from(*n),
        Val::S32(n) => Value::from(*n),
        Val::U32(n) => Value::from(*n),
        Val::S64(n) => Value::from(*n),
        Val::U64(n) => Value::from(*n),
        Val::Float32(n) => Number::from_f64(f64::from(*n)).map_or(Value::Null, Value::Number),
        Val::Float64(n) => Number::from_f64(*n).map_or(Value::Null, Value::Number),
        Val::Char(c) => Value::String(c.to_string()),
        Val::String(s) | Val::Enum(s) => Value::String(s.clone()),
        Val::List(items) | Val::Tuple(items) => Value::Array(items.iter().map(val_to_json).collect()),
        Val::Record(fields) => Value::Object(
            fields
                .iter()
                .map(|(name, v)| (camel_case(name), val_to_json(v)))
                .collect::<Map<_, _>>(),
        ),
        Val::Variant(case, payload) => {
            let mut map = Map::new();
            map.insert("tag".into(), Value::String(case.clone()));
            if let Some(payload) = payload {
                map.insert("val".into(), val_to_json(payload));
            }
            Value::Object(map)
        }
        Val::Option(inner) => inner.as_deref().map_or(Value::Null, val_to_json),
        Val::Result(Ok(inner)) => inner.as_deref().map_or(Value::Null, val_to_json),
        Val::Result(Err(inner)) => {
            let mut map = Map::new();
            map.insert(
                "error".into(),
                inner.as_deref().map_or(Value::Null, val_to_json),
            );
            Value::Object(map)
        }
        Val::Flags(flags) => Value::Array(flags.iter().cloned().map(Value::String).collect()),
        _ => Value::Null,
    }
}
