//! Capability registry: wire type to handler.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use quest_sandbox_common::{Capability, CapabilityError};

use crate::ask::AiForwarder;
use crate::logging::GuestLog;
use crate::quest::{QuestBook, TaskStatus};
use crate::Permissions;

/// Handles one capability.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// Handle a call.
    ///
    /// `args` is the wire `data` object without `instanceId`.
    async fn handle(&self, args: Value, instance_id: &str) -> Result<Value, CapabilityError>;
}

/// A [`CapabilityHandler`] backed by an async closure.
pub struct FnHandler<F>(F);

impl<F, Fut> FnHandler<F>
where
    F: Fn(Value, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, CapabilityError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> CapabilityHandler for FnHandler<F>
where
    F: Fn(Value, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, CapabilityError>> + Send,
{
    async fn handle(&self, args: Value, instance_id: &str) -> Result<Value, CapabilityError> {
        (self.0)(args, instance_id.to_string()).await
    }
}

/// Why a dispatch produced a failed response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No handler is registered for the wire type.
    #[error("unknown capability")]
    UnknownCapability(String),

    /// The handler failed.
    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

/// Table from capability wire type to handler.
pub struct CapabilityRegistry {
    handlers: DashMap<String, Arc<dyn CapabilityHandler>>,
    permissions: Permissions,
}

impl CapabilityRegistry {
    /// Create an empty registry.
    pub fn new(permissions: Permissions) -> Self {
        Self {
            handlers: DashMap::new(),
            permissions,
        }
    }

    /// Create a registry with the quest book, the guest log and, when
    /// given, the AI forwarder installed.
    pub fn with_defaults(
        permissions: Permissions,
        book: Arc<QuestBook>,
        log: Arc<GuestLog>,
        ai: Option<Arc<AiForwarder>>,
    ) -> Self {
        let registry = Self::new(permissions);
        registry.install_console(log);
        registry.install_quest(&book);
        if let Some(ai) = ai {
            registry.install_ai(ai);
        }
        registry
    }

    /// Register `handler` for `capability`, replacing any previous one.
    pub fn register(&self, capability: Capability, handler: impl CapabilityHandler + 'static) {
        self.register_wire_type(capability.wire_type(), Arc::new(handler));
    }

    /// Register a handler under an arbitrary wire type.
    pub fn register_wire_type(&self, wire_type: impl Into<String>, handler: Arc<dyn CapabilityHandler>) {
        let wire_type = wire_type.into();
        debug!(wire_type = %wire_type, "Capability registered");
        self.handlers.insert(wire_type, handler);
    }

    pub fn contains(&self, wire_type: &str) -> bool {
        self.handlers.contains_key(wire_type)
    }

    /// Registered wire types, sorted.
    pub fn wire_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.iter().map(|h| h.key().clone()).collect();
        types.sort();
        types
    }

    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    /// Dispatch one guest call.
    ///
    /// `data` is the wire `data` object; its `instanceId` is split off and
    /// passed to the handler separately.
    pub async fn dispatch(&self, wire_type: &str, data: Value) -> Result<Value, DispatchError> {
        let handler = self
            .handlers
            .get(wire_type)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| DispatchError::UnknownCapability(wire_type.to_string()))?;

        if let Some(capability) = Capability::from_wire_type(wire_type) {
            if !self.permissions.is_capability_allowed(capability) {
                warn!(capability = %capability, "Capability not permitted");
                return Err(CapabilityError::NotPermitted(capability.name().to_string()).into());
            }
        }

        let (args, instance_id) = split_instance_id(data);
        Ok(handler.handle(args, &instance_id).await?)
    }

    fn install_console(&self, log: Arc<GuestLog>) {
        self.register(
            Capability::ConsoleLog,
            FnHandler::new(move |args: Value, instance_id: String| {
                let log = log.clone();
                async move {
                    let message = match args.get("message") {
                        Some(Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => String::new(),
                    };
                    log.record(&instance_id, &message);
                    Ok(Value::Null)
                }
            }),
        );
    }

    fn install_quest(&self, book: &Arc<QuestBook>) {
        let b = book.clone();
        self.register(
            Capability::QuestRegisterTask,
            FnHandler::new(move |args: Value, instance_id: String| {
                let book = b.clone();
                async move {
                    book.register_task(
                        &instance_id,
                        string_arg(&args, "questId")?,
                        string_arg(&args, "taskId")?,
                        string_arg(&args, "description")?,
                    );
                    Ok(Value::Null)
                }
            }),
        );

        let b = book.clone();
        self.register(
            Capability::QuestUpdateTask,
            FnHandler::new(move |args: Value, _instance_id: String| {
                let book = b.clone();
                async move {
                    let status: TaskStatus = string_arg(&args, "status")?.parse()?;
                    book.update_task(
                        string_arg(&args, "questId")?,
                        string_arg(&args, "taskId")?,
                        status,
                    )?;
                    Ok(Value::Null)
                }
            }),
        );

        let b = book.clone();
        self.register(
            Capability::QuestNotifyPlayer,
            FnHandler::new(move |args: Value, instance_id: String| {
                let book = b.clone();
                async move {
                    book.notify(&instance_id, string_arg(&args, "message")?);
                    Ok(Value::Null)
                }
            }),
        );

        let b = book.clone();
        self.register(
            Capability::QuestGetCurrentUrl,
            FnHandler::new(move |_args: Value, _instance_id: String| {
                let book = b.clone();
                async move { Ok(Value::String(book.current_url())) }
            }),
        );

        let b = book.clone();
        self.register(
            Capability::QuestRegisterItem,
            FnHandler::new(move |args: Value, instance_id: String| {
                let book = b.clone();
                async move {
                    book.register_item(
                        &instance_id,
                        string_arg(&args, "id")?,
                        string_arg(&args, "url")?,
                        string_arg(&args, "title")?,
                        string_arg(&args, "type")?,
                    );
                    Ok(Value::Null)
                }
            }),
        );
    }

    fn install_ai(&self, ai: Arc<AiForwarder>) {
        self.register(
            Capability::AiAsk,
            FnHandler::new(move |args: Value, instance_id: String| {
                let ai = ai.clone();
                async move {
                    let prompt = string_arg(&args, "prompt")?;
                    ai.ask(prompt, &instance_id).await.map(Value::String)
                }
            }),
        );
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("wire_types", &self.wire_types())
            .field("permissions", &self.permissions)
            .finish()
    }
}

/// Read a required string argument.
///
/// # Errors
///
/// `invalid-args` if `key` is missing or not a string.
pub fn string_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, CapabilityError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| CapabilityError::InvalidArgs(format!("expected string '{key}'")))
}

fn split_instance_id(data: Value) -> (Value, String) {
    match data {
        Value::Object(mut map) => {
            let instance_id = match map.remove("instanceId") {
                Some(Value::String(id)) => id,
                _ => String::new(),
            };
            (Value::Object(map), instance_id)
        }
        Value::Null => (Value::Object(Map::new()), String::new()),
        other => (other, String::new()),
    }
}
