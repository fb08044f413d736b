//! Wire protocol between a sandbox and its host.
//!
//! Messages are JSON objects with a required `type` field, carried over an
//! ordered channel (one unbounded `tokio` channel per direction):
//!
//! ```text
//!   Host ──ExecuteAgent / Navigate / HostResponse──▶ Sandbox
//!   Host ◀──SandboxReady / AgentExecutionComplete / requests / events── Sandbox
//! ```
//!
//! Guest requests use the capability's wire type as `type` and carry a
//! `requestId`; events (such as `console_log`) carry no id and get no reply.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;

use crate::ProtocolError;

pub const EXECUTE_AGENT: &str = "ExecuteAgent";
pub const NAVIGATE: &str = "Navigate";
pub const HOST_RESPONSE: &str = "HostResponse";
pub const SANDBOX_READY: &str = "SandboxReady";
pub const AGENT_EXECUTION_COMPLETE: &str = "AgentExecutionComplete";

/// Everything one execution needs: the agent's main module, its shims and
/// its wasm payloads.
///
/// A bundle is consumed by exactly one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBundle {
    /// Source of the agent's main module (the JCO shell).
    pub main_source: String,

    /// Shim name to shim source. Names may carry a `.js` suffix.
    #[serde(default)]
    pub shims: BTreeMap<String, String>,

    /// Wasm file name to bytes.
    #[serde(default)]
    pub wasm_files: BTreeMap<String, Vec<u8>>,

    /// Invocation arguments (`code` is passed to `run`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,

    /// Opaque id of the agent instance, echoed in every capability call.
    pub instance_id: String,
}

impl SourceBundle {
    /// Create a bundle with only a main source.
    pub fn new(main_source: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            main_source: main_source.into(),
            instance_id: instance_id.into(),
            ..Self::default()
        }
    }

    /// Add a shim module.
    #[must_use]
    pub fn with_shim(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.shims.insert(name.into(), source.into());
        self
    }

    /// Add a wasm payload.
    #[must_use]
    pub fn with_wasm(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.wasm_files.insert(name.into(), bytes.into());
        self
    }

    /// Set one invocation argument.
    #[must_use]
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// The `args.code` string, if any.
    pub fn code_arg(&self) -> Option<&str> {
        self.args.as_ref()?.get("code")?.as_str()
    }
}

/// A named host operation callable by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// `ai.ask(prompt) -> string`
    AiAsk,
    /// `console.log(msg)`, fire-and-forget.
    ConsoleLog,
    /// `quest.registerTask(qid, tid, desc)`
    QuestRegisterTask,
    /// `quest.updateTask(qid, tid, status)`
    QuestUpdateTask,
    /// `quest.notifyPlayer(msg)`
    QuestNotifyPlayer,
    /// `quest.getCurrentUrl() -> string`
    QuestGetCurrentUrl,
    /// `quest.registerItem(id, url, title, type)`
    QuestRegisterItem,
}

impl Capability {
    /// Every capability, in a stable order.
    pub const ALL: [Capability; 7] = [
        Capability::AiAsk,
        Capability::ConsoleLog,
        Capability::QuestRegisterTask,
        Capability::QuestUpdateTask,
        Capability::QuestNotifyPlayer,
        Capability::QuestGetCurrentUrl,
        Capability::QuestRegisterItem,
    ];

    /// Stable dotted name (`quest.registerTask`).
    pub fn name(self) -> &'static str {
        match self {
            Capability::AiAsk => "ai.ask",
            Capability::ConsoleLog => "console.log",
            Capability::QuestRegisterTask => "quest.registerTask",
            Capability::QuestUpdateTask => "quest.updateTask",
            Capability::QuestNotifyPlayer => "quest.notifyPlayer",
            Capability::QuestGetCurrentUrl => "quest.getCurrentUrl",
            Capability::QuestRegisterItem => "quest.registerItem",
        }
    }

    /// Message `type` used on the wire.
    pub fn wire_type(self) -> &'static str {
        match self {
            Capability::AiAsk => "BRIDGE_AI_REQUEST",
            Capability::ConsoleLog => "console_log",
            Capability::QuestRegisterTask => "quest_register_task",
            Capability::QuestUpdateTask => "quest_update_task",
            Capability::QuestNotifyPlayer => "quest_notify",
            Capability::QuestGetCurrentUrl => "quest_get_url",
            Capability::QuestRegisterItem => "quest_register_item",
        }
    }

    /// Keys of the positional guest arguments in the wire `data` object.
    pub fn params(self) -> &'static [&'static str] {
        match self {
            Capability::AiAsk => &["prompt"],
            Capability::ConsoleLog | Capability::QuestNotifyPlayer => &["message"],
            Capability::QuestRegisterTask => &["questId", "taskId", "description"],
            Capability::QuestUpdateTask => &["questId", "taskId", "status"],
            Capability::QuestGetCurrentUrl => &[],
            Capability::QuestRegisterItem => &["id", "url", "title", "type"],
        }
    }

    /// Property path on the script-side capability object
    /// (`globalThis.JCO_BRIDGE`).
    pub fn bridge_path(self) -> &'static str {
        match self {
            Capability::AiAsk => "ask",
            Capability::ConsoleLog => "log",
            Capability::QuestRegisterTask => "quest.registerTask",
            Capability::QuestUpdateTask => "quest.updateTask",
            Capability::QuestNotifyPlayer => "quest.notifyPlayer",
            Capability::QuestGetCurrentUrl => "quest.getCurrentUrl",
            Capability::QuestRegisterItem => "quest.registerItem",
        }
    }

    /// Whether the call is fire-and-forget (no response expected).
    pub fn is_event(self) -> bool {
        matches!(self, Capability::ConsoleLog)
    }

    /// Look a capability up by its wire type.
    pub fn from_wire_type(wire_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.wire_type() == wire_type)
    }

    /// Build the wire `data` object from positional arguments.
    ///
    /// Missing arguments are sent as `null`; extra ones are dropped.
    pub fn payload(self, args: &[Value], instance_id: &str) -> Value {
        let mut data = Map::new();
        for (i, key) in self.params().iter().enumerate() {
            data.insert(
                (*key).to_string(),
                args.get(i).cloned().unwrap_or(Value::Null),
            );
        }
        data.insert("instanceId".to_string(), Value::String(instance_id.to_string()));
        Value::Object(data)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Messages sent from the host to the sandbox.
#[derive(Debug, Clone, PartialEq)]
pub enum HostMessage {
    /// Run a bundle.
    ExecuteAgent(Box<SourceBundle>),
    /// The player navigated; delivered to the guest's `onVisit`.
    Navigate {
        /// The new URL.
        url: String,
    },
    /// Reply to a guest request.
    HostResponse {
        /// Id of the request being answered.
        request_id: u64,
        /// Whether the capability succeeded.
        success: bool,
        /// Result value, or the error description when `success` is false.
        data: Value,
    },
}

impl HostMessage {
    /// Encode as a wire message.
    pub fn to_value(&self) -> Value {
        match self {
            HostMessage::ExecuteAgent(bundle) => json!({
                "type": EXECUTE_AGENT,
                "payload": bundle,
            }),
            HostMessage::Navigate { url } => json!({
                "type": NAVIGATE,
                "payload": { "url": url },
            }),
            HostMessage::HostResponse {
                request_id,
                success,
                data,
            } => json!({
                "type": HOST_RESPONSE,
                "requestId": request_id,
                "success": success,
                "data": data,
            }),
        }
    }

    /// Decode a wire message.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownType`] for types the sandbox does not
    /// handle, so callers can drop them with a warning.
    pub fn from_value(mut value: Value) -> Result<Self, ProtocolError> {
        let kind = message_type(&value)?;
        match kind.as_str() {
            EXECUTE_AGENT => {
                let payload = value
                    .get_mut("payload")
                    .map(Value::take)
                    .ok_or_else(|| malformed(&kind, "missing payload"))?;
                let bundle: SourceBundle = serde_json::from_value(payload)
                    .map_err(|e| malformed(&kind, &e.to_string()))?;
                Ok(HostMessage::ExecuteAgent(Box::new(bundle)))
            }
            NAVIGATE => {
                let url = value
                    .pointer("/payload/url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed(&kind, "missing payload.url"))?;
                Ok(HostMessage::Navigate {
                    url: url.to_string(),
                })
            }
            HOST_RESPONSE => {
                let request_id = value
                    .get("requestId")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| malformed(&kind, "missing requestId"))?;
                let success = value
                    .get("success")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| malformed(&kind, "missing success"))?;
                let data = value.get_mut("data").map(Value::take).unwrap_or_default();
                Ok(HostMessage::HostResponse {
                    request_id,
                    success,
                    data,
                })
            }
            _ => Err(ProtocolError::UnknownType(kind)),
        }
    }
}

/// Messages sent from the sandbox to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxMessage {
    /// Posted once, when the sandbox starts listening.
    SandboxReady,
    /// Terminal message of one execution.
    AgentExecutionComplete {
        /// The lifecycle result or `Error: <kind>: <detail>`.
        result: String,
    },
    /// A guest capability call awaiting a `HostResponse`.
    Request {
        /// The capability wire type.
        kind: String,
        /// Correlation id.
        request_id: u64,
        /// Arguments plus `instanceId`.
        data: Value,
    },
    /// A fire-and-forget guest call.
    Event {
        /// The capability wire type.
        kind: String,
        /// Arguments plus `instanceId`.
        data: Value,
    },
}

impl SandboxMessage {
    /// Encode as a wire message.
    pub fn to_value(&self) -> Value {
        match self {
            SandboxMessage::SandboxReady => json!({ "type": SANDBOX_READY }),
            SandboxMessage::AgentExecutionComplete { result } => json!({
                "type": AGENT_EXECUTION_COMPLETE,
                "result": result,
            }),
            SandboxMessage::Request {
                kind,
                request_id,
                data,
            } => json!({
                "type": kind,
                "requestId": request_id,
                "data": data,
            }),
            SandboxMessage::Event { kind, data } => json!({
                "type": kind,
                "data": data,
            }),
        }
    }

    /// Decode a wire message.
    ///
    /// Any `type` other than the two lifecycle messages is a guest call: a
    /// request when it carries `requestId`, an event otherwise.
    pub fn from_value(mut value: Value) -> Result<Self, ProtocolError> {
        let kind = message_type(&value)?;
        match kind.as_str() {
            SANDBOX_READY => Ok(SandboxMessage::SandboxReady),
            AGENT_EXECUTION_COMPLETE => {
                let result = value
                    .get("result")
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed(&kind, "missing result"))?;
                Ok(SandboxMessage::AgentExecutionComplete {
                    result: result.to_string(),
                })
            }
            _ => {
                let data = value.get_mut("data").map(Value::take).unwrap_or_default();
                match value.get("requestId") {
                    Some(id) => {
                        let request_id = id
                            .as_u64()
                            .ok_or_else(|| malformed(&kind, "requestId is not an integer"))?;
                        Ok(SandboxMessage::Request {
                            kind,
                            request_id,
                            data,
                        })
                    }
                    None => Ok(SandboxMessage::Event { kind, data }),
                }
            }
        }
    }
}

fn message_type(value: &Value) -> Result<String, ProtocolError> {
    value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(ProtocolError::MissingType)
}

fn malformed(kind: &str, reason: &str) -> ProtocolError {
    ProtocolError::Malformed {
        kind: kind.to_string(),
        reason: reason.to_string(),
    }
}

/// Sending half of one channel direction.
pub type MessageSender = mpsc::UnboundedSender<Value>;

/// Receiving half of one channel direction.
pub type MessageReceiver = mpsc::UnboundedReceiver<Value>;

/// One end of the host/sandbox channel.
#[derive(Debug)]
pub struct Endpoint {
    /// Messages to the other end.
    pub tx: MessageSender,
    /// Messages from the other end.
    pub rx: MessageReceiver,
}

/// Create a connected `(host, sandbox)` endpoint pair.
pub fn channel() -> (Endpoint, Endpoint) {
    let (to_sandbox, from_host) = mpsc::unbounded_channel();
    let (to_host, from_sandbox) = mpsc::unbounded_channel();
    (
        Endpoint {
            tx: to_sandbox,
            rx: from_sandbox,
        },
        Endpoint {
            tx: to_host,
            rx: from_host,
        },
    )
}
