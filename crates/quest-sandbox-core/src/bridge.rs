//! Correlated request/response transport to the host.
//!
//! The [`Bridge`] owns the sandbox's sending half of the channel. Every
//! outgoing request gets a fresh id and parks a oneshot resolver until the
//! host answers with a `HostResponse` carrying the same id:
//!
//! ```text
//!   guest call ──▶ send_request ──{type, requestId, data}──▶ host
//!        ▲                                                    │
//!        └──── resolver ◀── handle_incoming ◀──HostResponse───┘
//! ```
//!
//! Failures are delivered in-band as `Error: <message>` strings because the
//! generated call sites on the guest side expect a plain value back.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use quest_sandbox_common::protocol::{EXECUTE_AGENT, MessageSender};
use quest_sandbox_common::{
    Capability, HostMessage, ProtocolError, SandboxError, SandboxMessage, SourceBundle,
};

/// Resolution of a request still pending when the sandbox tears down.
pub const TORN_DOWN: &str = "Error: sandbox torn down";

/// Correlated message transport between the sandbox and its host.
pub struct Bridge {
    outgoing: MessageSender,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    channel_lost: AtomicBool,
}

/// What the sandbox loop must do with an incoming message.
#[derive(Debug)]
pub enum Incoming {
    /// Start an execution.
    Execute(Box<SourceBundle>),
    /// Deliver a navigation to the active guest.
    Navigate(String),
    /// An `ExecuteAgent` that could not be decoded; the execution fails.
    InvalidExecute(SandboxError),
    /// A response, routed to its pending request (or dropped as stale).
    Response,
    /// Unknown or malformed; already logged.
    Ignored,
}

impl Bridge {
    /// Create a bridge that posts to `outgoing`.
    pub fn new(outgoing: MessageSender) -> Self {
        Self {
            outgoing,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            channel_lost: AtomicBool::new(false),
        }
    }

    /// Post a message to the host.
    ///
    /// Returns `false` and records the loss if the host end is gone.
    pub fn post(&self, message: &SandboxMessage) -> bool {
        if self.outgoing.send(message.to_value()).is_ok() {
            true
        } else {
            if !self.channel_lost.swap(true, Ordering::SeqCst) {
                warn!("Host channel closed");
            }
            false
        }
    }

    /// Send a request and wait for the host's answer.
    ///
    /// Never fails: transport failures and host-side errors resolve to an
    /// `Error: ...` string.
    pub async fn send_request(&self, kind: &str, data: Value) -> Value {
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        trace!(request_id, kind, "Posting request");
        let posted = self.post(&SandboxMessage::Request {
            kind: kind.to_string(),
            request_id,
            data,
        });
        if !posted {
            self.pending.lock().remove(&request_id);
            return Value::String(
                SandboxError::channel("host channel closed").to_result(),
            );
        }

        rx.await
            .unwrap_or_else(|_| Value::String(TORN_DOWN.to_string()))
    }

    /// Post a fire-and-forget event.
    pub fn send_event(&self, kind: &str, data: Value) {
        trace!(kind, "Posting event");
        self.post(&SandboxMessage::Event {
            kind: kind.to_string(),
            data,
        });
    }

    /// Resolve a pending request.
    ///
    /// Returns `false` if no request with that id is pending (stale ids are
    /// dropped silently).
    pub fn resolve(&self, request_id: u64, success: bool, data: Value) -> bool {
        let Some(resolver) = self.pending.lock().remove(&request_id) else {
            debug!(request_id, "Dropping response for unknown request");
            return false;
        };

        let value = if success {
            data
        } else {
            Value::String(format!("Error: {}", render_value(&data)))
        };

        // The caller may have been dropped; nothing to do then.
        let _ = resolver.send(value);
        true
    }

    /// Decode and route one incoming message.
    pub fn handle_incoming(&self, value: Value) -> Incoming {
        match HostMessage::from_value(value) {
            Ok(HostMessage::ExecuteAgent(bundle)) => Incoming::Execute(bundle),
            Ok(HostMessage::Navigate { url }) => Incoming::Navigate(url),
            Ok(HostMessage::HostResponse {
                request_id,
                success,
                data,
            }) => {
                self.resolve(request_id, success, data);
                Incoming::Response
            }
            Err(ProtocolError::UnknownType(kind)) => {
                warn!(kind = %kind, "Ignoring message of unknown type");
                Incoming::Ignored
            }
            Err(ProtocolError::Malformed { kind, reason }) if kind == EXECUTE_AGENT => {
                warn!(reason = %reason, "Rejecting malformed execution request");
                Incoming::InvalidExecute(SandboxError::invalid_message(reason))
            }
            Err(e) => {
                warn!(error = %e, "Ignoring malformed message");
                Incoming::Ignored
            }
        }
    }

    /// Reject every pending request with [`TORN_DOWN`].
    ///
    /// Returns the number of requests rejected.
    pub fn teardown(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (_, resolver) in drained {
            let _ = resolver.send(Value::String(TORN_DOWN.to_string()));
        }
        if count > 0 {
            debug!(count, "Rejected pending requests on teardown");
        }
        count
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether the host channel has been found closed.
    pub fn is_channel_lost(&self) -> bool {
        self.channel_lost.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("pending", &self.pending_count())
            .field("channel_lost", &self.is_channel_lost())
            .finish_non_exhaustive()
    }
}

/// Render a JSON value the way guests see results.
///
/// Strings verbatim, `null` as the empty string, everything else as
/// compact JSON.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// The capability object handed to a guest.
///
/// Mirrors the shape of `globalThis.JCO_BRIDGE`: `log`, `ask` and a `quest`
/// subtree. Every call is tagged with the execution's instance id.
#[derive(Clone)]
pub struct HostCapabilities {
    bridge: Arc<Bridge>,
    instance_id: Arc<str>,
}

impl HostCapabilities {
    /// Bind a capability object to a bridge and an agent instance.
    pub fn new(bridge: Arc<Bridge>, instance_id: &str) -> Self {
        Self {
            bridge,
            instance_id: Arc::from(instance_id),
        }
    }

    /// The agent instance these capabilities act for.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Call a capability with positional arguments.
    ///
    /// Events return `null` immediately; requests return the host's value.
    pub async fn call(&self, capability: Capability, args: &[Value]) -> Value {
        let data = capability.payload(args, &self.instance_id);
        if capability.is_event() {
            self.bridge.send_event(capability.wire_type(), data);
            Value::Null
        } else {
            self.bridge.send_request(capability.wire_type(), data).await
        }
    }

    /// `console.log`
    pub fn log(&self, message: &str) {
        let data = Capability::ConsoleLog.payload(&[Value::from(message)], &self.instance_id);
        self.bridge
            .send_event(Capability::ConsoleLog.wire_type(), data);
    }

    /// `ai.ask`
    pub async fn ask(&self, prompt: &str) -> String {
        render_value(&self.call(Capability::AiAsk, &[Value::from(prompt)]).await)
    }

    /// The `quest.*` subtree.
    pub fn quest(&self) -> QuestCapabilities<'_> {
        QuestCapabilities { caps: self }
    }
}

impl std::fmt::Debug for HostCapabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCapabilities")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

/// `quest.*` capabilities.
#[derive(Debug, Clone, Copy)]
pub struct QuestCapabilities<'a> {
    caps: &'a HostCapabilities,
}

impl QuestCapabilities<'_> {
    pub async fn register_task(&self, quest_id: &str, task_id: &str, description: &str) -> Value {
        self.caps
            .call(
                Capability::QuestRegisterTask,
                &[quest_id.into(), task_id.into(), description.into()],
            )
            .await
    }

    pub async fn update_task(&self, quest_id: &str, task_id: &str, status: &str) -> Value {
        self.caps
            .call(
                Capability::QuestUpdateTask,
                &[quest_id.into(), task_id.into(), status.into()],
            )
            .await
    }

    pub async fn notify_player(&self, message: &str) -> Value {
        self.caps
            .call(Capability::QuestNotifyPlayer, &[message.into()])
            .await
    }

    pub async fn get_current_url(&self) -> String {
        render_value(&self.caps.call(Capability::QuestGetCurrentUrl, &[]).await)
    }

    pub async fn register_item(&self, id: &str, url: &str, title: &str, kind: &str) -> Value {
        self.caps
            .call(
                Capability::QuestRegisterItem,
                &[id.into(), url.into(), title.into(), kind.into()],
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quest_sandbox_common::ErrorKind;
    use quest_sandbox_common::protocol::channel;
    use serde_json::json;

    #[tokio::test]
    async fn test_request_is_resolved_by_matching_response() {
        let (mut host, sandbox) = channel();
        let bridge = Arc::new(Bridge::new(sandbox.tx));

        let caller = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.send_request("quest_get_url", json!({})).await }
        });

        let request = host.rx.recv().await.unwrap();
        assert_eq!(request["type"], "quest_get_url");
        let id = request["requestId"].as_u64().unwrap();

        assert!(bridge.resolve(id, true, json!("https://example.com")));
        assert_eq!(caller.await.unwrap(), json!("https://example.com"));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_stringified() {
        let (mut host, sandbox) = channel();
        let bridge = Arc::new(Bridge::new(sandbox.tx));

        let caller = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.send_request("BRIDGE_AI_REQUEST", json!({})).await }
        });
        let id = host.rx.recv().await.unwrap()["requestId"].as_u64().unwrap();
        bridge.resolve(id, false, json!({"code": 429}));

        assert_eq!(caller.await.unwrap(), json!(r#"Error: {"code":429}"#));
    }

    #[test]
    fn test_stale_response_is_dropped() {
        let (_host, sandbox) = channel();
        let bridge = Bridge::new(sandbox.tx);

        assert!(!bridge.resolve(42, true, json!(null)));
        assert!(matches!(
            bridge.handle_incoming(json!({
                "type": "HostResponse", "requestId": 42, "success": true, "data": null
            })),
            Incoming::Response
        ));
    }

    #[test]
    fn test_unknown_incoming_is_ignored() {
        let (_host, sandbox) = channel();
        let bridge = Bridge::new(sandbox.tx);

        assert!(matches!(
            bridge.handle_incoming(json!({"type": "Reload"})),
            Incoming::Ignored
        ));
        assert!(matches!(
            bridge.handle_incoming(json!({"type": "Navigate", "payload": {"url": "u"}})),
            Incoming::Navigate(url) if url == "u"
        ));
    }

    #[test]
    fn test_malformed_execute_is_invalid() {
        let (_host, sandbox) = channel();
        let bridge = Bridge::new(sandbox.tx);

        let incoming = bridge.handle_incoming(json!({
            "type": "ExecuteAgent", "mainSource": "export function init() {}"
        }));
        let Incoming::InvalidExecute(err) = incoming else {
            panic!("expected an invalid execution, got {incoming:?}");
        };
        assert_eq!(err.kind(), ErrorKind::InvalidMessage);
        assert_eq!(err.to_result(), "Error: invalid-message: missing payload");

        assert!(matches!(
            bridge.handle_incoming(json!({"type": "Navigate", "payload": {}})),
            Incoming::Ignored
        ));
    }

    #[tokio::test]
    async fn test_teardown_rejects_pending() {
        let (mut host, sandbox) = channel();
        let bridge = Arc::new(Bridge::new(sandbox.tx));

        let caller = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.send_request("quest_notify", json!({})).await }
        });
        host.rx.recv().await.unwrap();

        assert_eq!(bridge.teardown(), 1);
        assert_eq!(caller.await.unwrap(), json!(TORN_DOWN));
    }

    #[tokio::test]
    async fn test_closed_channel_resolves_with_channel_error() {
        let (host, sandbox) = channel();
        drop(host);
        let bridge = Bridge::new(sandbox.tx);

        let value = bridge.send_request("quest_notify", json!({})).await;
        assert_eq!(value, json!("Error: channel-error: host channel closed"));
        assert!(bridge.is_channel_lost());
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_capabilities_tag_instance_id() {
        let (mut host, sandbox) = channel();
        let bridge = Arc::new(Bridge::new(sandbox.tx));
        let caps = HostCapabilities::new(bridge, "agent-7");

        caps.log("hello");
        let event = host.rx.recv().await.unwrap();
        assert_eq!(
            event,
            json!({
                "type": "console_log",
                "data": {"message": "hello", "instanceId": "agent-7"}
            })
        );
        assert!(event.get("requestId").is_none());
    }

    #[test]
    fn test_render_value() {
        assert_eq!(render_value(&json!("ok")), "ok");
        assert_eq!(render_value(&Value::Null), "");
        assert_eq!(render_value(&json!(3)), "3");
        assert_eq!(render_value(&json!({"a": [1, 2]})), r#"{"a":[1,2]}"#);
    }
}
