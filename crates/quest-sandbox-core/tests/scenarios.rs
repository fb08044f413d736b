//! End-to-end scenarios for the sandbox, driven through the wire protocol
//! with a scripted module loader standing in for a script runtime.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use url::Url;

use quest_sandbox_common::protocol::{Endpoint, channel};
use quest_sandbox_common::{HostMessage, SandboxConfig, SourceBundle};
use quest_sandbox_core::blob::ModuleStore;
use quest_sandbox_core::bridge::TORN_DOWN;
use quest_sandbox_core::link::shims::realize_shims;
use quest_sandbox_core::{
    AdapterModule, AgentModule, Bridge, GuestError, HostCapabilities, ImportScope, ModuleHandle,
    ModuleLinker, ModuleLoader, Sandbox,
};

const CONSOLE: &str = "component:quest-v1/host-console";
const MANAGER: &str = "component:quest-v1/host-quest-manager";
const EVENTS: &str = "component:quest-v1/host-events";
const CONTENT: &str = "component:quest-v1/host-content";
const AGENT: &str = "component:agent/host-capabilities";

const QUEST_MAIN: &str = r#"import { log } from 'component:quest-v1/host-console';
import { registerTask, updateTask, notifyPlayer, status } from 'component:quest-v1/host-quest-manager';
import { getCurrentUrl } from 'component:quest-v1/host-events';
import { registerItem } from 'component:quest-v1/host-content';
import { ask } from 'component:agent/host-capabilities';
export function init() {}
"#;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type Export = Arc<dyn Fn(Guest, Vec<Value>) -> BoxFuture<Result<Value, GuestError>> + Send + Sync>;

/// What a scripted guest can reach: the adapters its main module imports.
#[derive(Clone)]
struct Guest {
    adapters: Arc<BTreeMap<String, AdapterModule>>,
    capabilities: HostCapabilities,
}

impl Guest {
    async fn call(&self, specifier: &str, name: &str, args: Vec<Value>) -> Result<Value, GuestError> {
        let adapter = self
            .adapters
            .get(specifier)
            .ok_or_else(|| GuestError::new(format!("'{specifier}' is not imported")))?;
        adapter.invoke(&self.capabilities, name, args).await
    }
}

/// What the loader saw when the agent module was imported.
#[derive(Debug, Clone)]
struct Imported {
    main_source: String,
    handles: Vec<ModuleHandle>,
}

#[derive(Clone, Default)]
struct ScriptedLoader {
    exports: BTreeMap<String, Export>,
    failure: Option<GuestError>,
    imported: Arc<Mutex<Vec<Imported>>>,
}

impl ScriptedLoader {
    fn new() -> Self {
        Self::default()
    }

    fn export<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Guest, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, GuestError>> + Send + 'static,
    {
        self.exports
            .insert(name.to_string(), Arc::new(move |guest, args| Box::pin(f(guest, args))));
        self
    }

    fn failing(mut self, error: GuestError) -> Self {
        self.failure = Some(error);
        self
    }
}

#[async_trait]
impl ModuleLoader for ScriptedLoader {
    async fn import(
        &self,
        url: &Url,
        scope: ImportScope<'_>,
    ) -> Result<Box<dyn AgentModule>, GuestError> {
        let main = scope
            .store
            .resolve(url.as_str())
            .ok_or_else(|| GuestError::new(format!("cannot fetch {url}")))?;
        self.imported.lock().push(Imported {
            main_source: main.text().unwrap_or_default().to_string(),
            handles: scope.store.handles(),
        });

        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }

        Ok(Box::new(ScriptedAgent {
            guest: Guest {
                adapters: Arc::new(scope.link.adapters.clone()),
                capabilities: scope.capabilities.clone(),
            },
            exports: self.exports.clone(),
        }))
    }
}

struct ScriptedAgent {
    guest: Guest,
    exports: BTreeMap<String, Export>,
}

#[async_trait]
impl AgentModule for ScriptedAgent {
    fn exports(&self) -> BTreeSet<String> {
        self.exports.keys().cloned().collect()
    }

    async fn call(&mut self, export: &str, args: Vec<Value>) -> Result<Value, GuestError> {
        let handler = self
            .exports
            .get(export)
            .ok_or_else(|| GuestError::new(format!("{export} is not a function")))?;
        handler(self.guest.clone(), args).await
    }
}

/// The host end of a running sandbox.
struct TestHost {
    endpoint: Endpoint,
    bridge: Arc<Bridge>,
    task: tokio::task::JoinHandle<()>,
}

impl TestHost {
    async fn start(loader: ScriptedLoader) -> Self {
        let (host, sandbox) = channel();
        let sandbox = Sandbox::new(SandboxConfig::default(), sandbox, Arc::new(loader));
        let bridge = sandbox.bridge().clone();
        let task = tokio::spawn(sandbox.run());

        let mut host = Self {
            endpoint: host,
            bridge,
            task,
        };
        assert_eq!(host.next().await["type"], "SandboxReady");
        host
    }

    async fn next(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(5), self.endpoint.rx.recv())
            .await
            .expect("timed out waiting for the sandbox")
            .expect("sandbox channel closed")
    }

    fn send(&self, message: &HostMessage) {
        self.endpoint.tx.send(message.to_value()).unwrap();
    }

    fn execute(&self, bundle: SourceBundle) {
        self.send(&HostMessage::ExecuteAgent(Box::new(bundle)));
    }

    fn navigate(&self, url: &str) {
        self.send(&HostMessage::Navigate { url: url.into() });
    }

    fn respond(&self, request: &Value, success: bool, data: Value) {
        self.send(&HostMessage::HostResponse {
            request_id: request["requestId"].as_u64().unwrap(),
            success,
            data,
        });
    }

    /// Answer requests with `answer` until the execution completes.
    ///
    /// Returns the result and every guest message seen on the way.
    async fn serve(&mut self, mut answer: impl FnMut(&Value) -> (bool, Value)) -> (String, Vec<Value>) {
        let mut traffic = Vec::new();
        loop {
            let message = self.next().await;
            if message["type"] == "AgentExecutionComplete" {
                return (message["result"].as_str().unwrap().to_string(), traffic);
            }
            if message.get("requestId").is_some() {
                let (success, data) = answer(&message);
                self.respond(&message, success, data);
            }
            traffic.push(message);
        }
    }
}

fn ok(_: &Value) -> (bool, Value) {
    (true, Value::Null)
}

/// S1: a guest that only uses host capabilities.
#[tokio::test]
async fn test_pure_capability_guest_initializes() {
    let loader = ScriptedLoader::new().export("init", |guest, _| async move {
        guest.call(CONSOLE, "log", vec![json!("starting")]).await?;
        guest
            .call(
                CONTENT,
                "registerItem",
                vec![
                    json!("google-item"),
                    json!("https://google.com"),
                    json!("Visit Google"),
                    json!("webpage"),
                ],
            )
            .await?;
        guest
            .call(
                MANAGER,
                "registerTask",
                vec![json!("quest-1"), json!("task-1"), json!("Visit https://google.com")],
            )
            .await?;
        guest
            .call(MANAGER, "notifyPlayer", vec![json!("Quest Started: Visit Google!")])
            .await?;
        Ok(Value::Null)
    });

    let mut host = TestHost::start(loader).await;
    host.execute(SourceBundle::new(QUEST_MAIN, "agent-1"));
    let (result, traffic) = host.serve(ok).await;

    assert_eq!(result, "Quest Initialized");
    let types: Vec<&str> = traffic.iter().map(|m| m["type"].as_str().unwrap()).collect();
    assert_eq!(
        types,
        vec!["console_log", "quest_register_item", "quest_register_task", "quest_notify"]
    );
    assert_eq!(
        traffic[2]["data"],
        json!({
            "questId": "quest-1",
            "taskId": "task-1",
            "description": "Visit https://google.com",
            "instanceId": "agent-1"
        })
    );
    assert_eq!(traffic[1]["data"]["type"], "webpage");
}

/// S2: the main module's WASI import resolves through a shim that itself
/// depends on another shim.
#[tokio::test]
async fn test_single_shim_dependency() {
    let loader = ScriptedLoader::new().export("init", |_, _| async { Ok(Value::Null) });
    let imported = loader.imported.clone();

    let main = "import { getStderr } from 'wasi:cli/stderr';\nexport function init() {}\n";
    let bundle = SourceBundle::new(main, "agent-2")
        .with_shim("cli.js", "import { streams } from './io.js';\nexport const stderr = { getStderr() { return streams; } };")
        .with_shim("io.js", "export const streams = {};");

    let mut host = TestHost::start(loader).await;
    host.execute(bundle);
    let (result, _) = host.serve(ok).await;
    assert_eq!(result, "Quest Initialized");

    let imported = imported.lock()[0].clone();
    let io = imported.handles.iter().find(|h| h.key() == "io").unwrap();
    let cli = imported.handles.iter().find(|h| h.key() == "cli").unwrap();
    let adapter = imported
        .handles
        .iter()
        .find(|h| h.key() == "wasi:cli/stderr")
        .unwrap();

    assert!(imported.main_source.contains(&format!("from '{}'", adapter.url())));
    assert!(!imported.main_source.contains("wasi:cli/stderr"));
    let io_index = imported.handles.iter().position(|h| h.key() == "io").unwrap();
    let cli_index = imported.handles.iter().position(|h| h.key() == "cli").unwrap();
    assert!(io_index < cli_index);
    assert_ne!(io.url(), cli.url());
}

/// S3: circular shims abandon the execution before import.
#[tokio::test]
async fn test_circular_shims_are_reported() {
    let loader = ScriptedLoader::new().export("init", |_, _| async { Ok(Value::Null) });
    let imported = loader.imported.clone();

    let bundle = SourceBundle::new("export function init() {}", "agent-3")
        .with_shim("a.js", "import { b } from './b.js';\nexport const a = 1;")
        .with_shim("b.js", "import { a } from './a.js';\nexport const b = 2;");

    let mut host = TestHost::start(loader).await;
    host.execute(bundle);
    let (result, _) = host.serve(ok).await;

    assert_eq!(result, "Error: circular-shims: a, b");
    assert!(imported.lock().is_empty());
}

/// S4: `run` receives `args.code` (or the default) and its value is the
/// result.
#[tokio::test]
async fn test_run_with_args() {
    let loader = ScriptedLoader::new().export("run", |_, args| async move {
        let code = args[0].as_str().unwrap_or_default();
        Ok(json!(code.chars().count()))
    });

    let mut host = TestHost::start(loader).await;

    host.execute(SourceBundle::new("export const run = async (code) => code.length;", "a").with_arg("code", "abc"));
    assert_eq!(host.serve(ok).await.0, "3");

    host.execute(SourceBundle::new("export const run = async (code) => code.length;", "a"));
    assert_eq!(host.serve(ok).await.0, "7");
}

/// S5: navigation after `init` reaches `onVisit`, which can call back into
/// the host.
#[tokio::test]
async fn test_late_navigation_reaches_on_visit() {
    let loader = ScriptedLoader::new()
        .export("init", |_, _| async { Ok(Value::Null) })
        .export("onVisit", |guest, args| async move {
            let url = args[0].as_str().unwrap_or_default().to_string();
            if url.contains("google.com") {
                let completed = guest.call(MANAGER, "status", vec![]).await?["completed"].clone();
                guest
                    .call(MANAGER, "updateTask", vec![json!("quest-1"), json!("task-1"), completed])
                    .await?;
            }
            Ok(Value::Null)
        });

    let mut host = TestHost::start(loader).await;
    host.execute(SourceBundle::new(QUEST_MAIN, "agent-5"));
    assert_eq!(host.serve(ok).await.0, "Quest Initialized");

    host.navigate("https://example.com");
    host.navigate("https://google.com/search");

    let request = host.next().await;
    assert_eq!(request["type"], "quest_update_task");
    assert_eq!(request["data"]["status"], "completed");
    assert_eq!(request["data"]["instanceId"], "agent-5");
    host.respond(&request, true, Value::Null);
}

/// Navigations posted while an execution runs are delivered after it
/// completes, in order.
#[tokio::test]
async fn test_navigation_during_execution_is_queued() {
    let loader = ScriptedLoader::new()
        .export("init", |guest, _| async move {
            guest.call(EVENTS, "getCurrentUrl", vec![]).await?;
            Ok(Value::Null)
        })
        .export("onVisit", |guest, args| async move {
            guest.call(CONSOLE, "log", args).await?;
            Ok(Value::Null)
        });

    let mut host = TestHost::start(loader).await;
    host.execute(SourceBundle::new(QUEST_MAIN, "agent-q"));

    let request = host.next().await;
    assert_eq!(request["type"], "quest_get_url");
    host.navigate("https://first.example");
    host.navigate("https://second.example");
    host.respond(&request, true, json!("about:blank"));

    assert_eq!(host.next().await["result"], "Quest Initialized");
    assert_eq!(host.next().await["data"]["message"], "https://first.example");
    assert_eq!(host.next().await["data"]["message"], "https://second.example");
}

/// S6: a failing capability reaches the guest as an `Error: ...` string.
#[tokio::test]
async fn test_capability_error_is_stringified() {
    let loader = ScriptedLoader::new().export("run", |guest, _| async move {
        let answer = guest.call(AGENT, "ask", vec![json!("x")]).await?;
        assert_eq!(answer, json!("Error: rate-limited"));
        Ok(answer)
    });

    let mut host = TestHost::start(loader).await;
    host.execute(SourceBundle::new(QUEST_MAIN, "agent-6"));
    let (result, traffic) = host.serve(|_| (false, json!("rate-limited"))).await;

    assert_eq!(traffic[0]["type"], "BRIDGE_AI_REQUEST");
    assert_eq!(traffic[0]["data"]["prompt"], "x");
    assert_eq!(result, "Error: rate-limited");
}

/// Responses arriving in any order resolve the request with the same id.
#[tokio::test]
async fn test_correlated_delivery_out_of_order() {
    let loader = ScriptedLoader::new().export("run", |guest, _| async move {
        let (a, b, c) = tokio::join!(
            guest.call(AGENT, "ask", vec![json!("p1")]),
            guest.call(AGENT, "ask", vec![json!("p2")]),
            guest.call(AGENT, "ask", vec![json!("p3")]),
        );
        Ok(json!(format!("{}|{}|{}", a?, b?, c?)))
    });

    let mut host = TestHost::start(loader).await;
    host.execute(SourceBundle::new(QUEST_MAIN, "agent-c"));

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(host.next().await);
    }
    let ids: BTreeSet<u64> = requests
        .iter()
        .map(|r| r["requestId"].as_u64().unwrap())
        .collect();
    assert_eq!(ids.len(), 3);

    for request in requests.iter().rev() {
        let prompt = request["data"]["prompt"].as_str().unwrap();
        host.respond(request, true, json!(prompt.replace('p', "a")));
    }

    assert_eq!(host.next().await["result"], r#""a1"|"a2"|"a3""#);
}

/// After completion no minted URL resolves and pending requests are
/// rejected.
#[tokio::test]
async fn test_teardown_releases_urls_and_rejects_pending() {
    let (abandoned_tx, abandoned_rx) = oneshot::channel();
    let abandoned_tx = Arc::new(Mutex::new(Some(abandoned_tx)));
    let bridge_slot: Arc<Mutex<Option<Arc<Bridge>>>> = Arc::default();

    let loader = ScriptedLoader::new().export("init", {
        let bridge_slot = bridge_slot.clone();
        move |guest, _| {
            let abandoned_tx = abandoned_tx.clone();
            let bridge = bridge_slot.lock().clone();
            async move {
                tokio::spawn(async move {
                    let value = guest.call(AGENT, "ask", vec![json!("never answered")]).await;
                    if let Some(tx) = abandoned_tx.lock().take() {
                        let _ = tx.send(value);
                    }
                });
                if let Some(bridge) = bridge {
                    while bridge.pending_count() == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                Ok(Value::Null)
            }
        }
    });
    let imported = loader.imported.clone();

    let mut host = TestHost::start(loader).await;
    *bridge_slot.lock() = Some(host.bridge.clone());
    host.execute(SourceBundle::new(QUEST_MAIN, "agent-t"));

    let request = host.next().await;
    assert_eq!(request["type"], "BRIDGE_AI_REQUEST");
    assert_eq!(host.next().await["result"], "Quest Initialized");

    assert_eq!(abandoned_rx.await.unwrap(), Ok(json!(TORN_DOWN)));
    assert_eq!(host.bridge.pending_count(), 0);

    let imported = imported.lock()[0].clone();
    assert!(!imported.handles.is_empty());
    assert!(imported.handles.iter().all(|h| !h.is_retained()));

    // The stale response is dropped without disturbing the sandbox.
    host.respond(&request, true, json!("late"));
}

/// A second execution while one is running is rejected with `busy`.
#[tokio::test]
async fn test_concurrent_execution_is_busy() {
    let loader = ScriptedLoader::new().export("run", |guest, _| async move {
        guest.call(AGENT, "ask", vec![json!("slow")]).await
    });

    let mut host = TestHost::start(loader).await;
    host.execute(SourceBundle::new(QUEST_MAIN, "first"));
    let request = host.next().await;

    host.execute(SourceBundle::new(QUEST_MAIN, "second"));
    let rejected = host.next().await;
    assert_eq!(rejected["type"], "AgentExecutionComplete");
    assert!(rejected["result"].as_str().unwrap().starts_with("Error: busy:"));

    host.respond(&request, true, json!("done"));
    assert_eq!(host.next().await["result"], "done");
}

/// An execution requested while `onVisit` runs is rejected too; the
/// navigation job is unaffected.
#[tokio::test]
async fn test_execution_during_on_visit_is_busy() {
    let loader = ScriptedLoader::new()
        .export("init", |_, _| async { Ok(Value::Null) })
        .export("onVisit", |guest, args| async move {
            guest.call(AGENT, "ask", args).await?;
            guest.call(CONSOLE, "log", vec![json!("visited")]).await?;
            Ok(Value::Null)
        });

    let mut host = TestHost::start(loader).await;
    host.execute(SourceBundle::new(QUEST_MAIN, "agent-v"));
    assert_eq!(host.serve(ok).await.0, "Quest Initialized");

    host.navigate("https://example.com");
    let request = host.next().await;
    assert_eq!(request["type"], "BRIDGE_AI_REQUEST");

    host.execute(SourceBundle::new(QUEST_MAIN, "agent-w"));
    let rejected = host.next().await;
    assert_eq!(rejected["type"], "AgentExecutionComplete");
    assert!(rejected["result"].as_str().unwrap().starts_with("Error: busy:"));

    host.respond(&request, true, json!("ok"));
    let log = host.next().await;
    assert_eq!(log["type"], "console_log");
    assert_eq!(log["data"]["message"], "visited");
}

/// An `ExecuteAgent` without a payload still completes, with an error.
#[tokio::test]
async fn test_malformed_execute_completes_with_error() {
    let loader = ScriptedLoader::new().export("init", |_, _| async { Ok(Value::Null) });
    let imported = loader.imported.clone();
    let mut host = TestHost::start(loader).await;

    host.endpoint
        .tx
        .send(json!({"type": "ExecuteAgent", "mainSource": "export function init() {}"}))
        .unwrap();
    let complete = host.next().await;
    assert_eq!(complete["type"], "AgentExecutionComplete");
    assert_eq!(complete["result"], "Error: invalid-message: missing payload");
    assert!(imported.lock().is_empty());

    host.endpoint
        .tx
        .send(json!({"type": "ExecuteAgent", "payload": {"mainSource": 7}}))
        .unwrap();
    let complete = host.next().await;
    assert!(complete["result"]
        .as_str()
        .unwrap()
        .starts_with("Error: invalid-message:"));

    host.execute(SourceBundle::new(QUEST_MAIN, "agent-m"));
    assert_eq!(host.serve(ok).await.0, "Quest Initialized");
}

#[tokio::test]
async fn test_missing_entry_point() {
    let loader = ScriptedLoader::new().export("onVisit", |_, _| async { Ok(Value::Null) });

    let mut host = TestHost::start(loader).await;
    host.execute(SourceBundle::new("export function onVisit() {}", "agent-n"));
    let (result, _) = host.serve(ok).await;

    assert!(result.starts_with("Error: no-entry-point:"), "{result}");
}

#[tokio::test]
async fn test_load_and_runtime_errors() {
    let loader = ScriptedLoader::new().failing(
        GuestError::new("SyntaxError: Unexpected token '}'").with_stack("at blob:x/main/main-1:3:5"),
    );
    let mut host = TestHost::start(loader).await;
    host.execute(SourceBundle::new("export function init() {\n}\n}\n", "agent-l"));
    assert_eq!(
        host.serve(ok).await.0,
        "Error: load-error: SyntaxError: Unexpected token '}'"
    );

    let loader = ScriptedLoader::new().export("init", |_, _| async {
        Err(GuestError::new("TypeError: quest is undefined"))
    });
    let mut host = TestHost::start(loader).await;
    host.execute(SourceBundle::new(QUEST_MAIN, "agent-r"));
    assert_eq!(
        host.serve(ok).await.0,
        "Error: runtime-error: TypeError: quest is undefined"
    );
}

#[tokio::test]
async fn test_link_diagnostics_abort_before_import() {
    let loader = ScriptedLoader::new().export("init", |_, _| async { Ok(Value::Null) });
    let imported = loader.imported.clone();

    let main = "import { hammer } from 'acme:tools/hammer';\nimport { x } from 'wasi:sockets/tcp';\n";
    let mut host = TestHost::start(loader).await;
    host.execute(SourceBundle::new(main, "agent-d"));
    let (result, _) = host.serve(ok).await;

    assert_eq!(
        result,
        "Error: unknown-specifier: acme:tools/hammer; unknown-specifier: wasi:sockets/tcp"
    );
    assert!(imported.lock().is_empty());
}

#[tokio::test]
async fn test_unknown_messages_are_ignored() {
    let loader = ScriptedLoader::new().export("init", |_, _| async { Ok(Value::Null) });
    let mut host = TestHost::start(loader).await;

    host.endpoint.tx.send(json!({"type": "Reload"})).unwrap();
    host.endpoint.tx.send(json!({"noType": true})).unwrap();
    host.execute(SourceBundle::new(QUEST_MAIN, "agent-u"));

    assert_eq!(host.serve(ok).await.0, "Quest Initialized");
}

#[tokio::test]
async fn test_sandbox_exits_when_host_closes() {
    let loader = ScriptedLoader::new().export("init", |_, _| async { Ok(Value::Null) });
    let host = TestHost::start(loader).await;

    let TestHost { endpoint, task, .. } = host;
    drop(endpoint);

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("sandbox did not exit")
        .unwrap();
}

/// Shim realization depends only on the shim map.
#[test]
fn test_shim_realization_is_order_stable() {
    let shims: BTreeMap<String, String> = [
        ("cli.js", "import { streams } from './io.js';\nexport const stderr = {};"),
        ("io.js", "import { poll } from './poll.js';\nexport const streams = {};"),
        ("poll.js", "export const poll = {};"),
        ("random", "export const random = {};"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let contents = |store: &ModuleStore| -> BTreeMap<String, String> {
        realize_shims(store, &shims)
            .unwrap()
            .into_iter()
            .map(|(name, handle)| {
                let blob = store.resolve(handle.url().as_str()).unwrap();
                (name, blob.text().unwrap().to_string())
            })
            .collect()
    };

    let first = contents(&ModuleStore::new("quest-sandbox"));
    let second = contents(&ModuleStore::new("quest-sandbox"));
    assert_eq!(first, second);
    assert_eq!(first.len(), 4);
}

/// Every bound outer name at any import site is exported by the adapter.
#[test]
fn test_adapter_completeness() {
    let main = r#"import { registerTask as rt } from 'component:quest-v1/host-quest-manager';
import { notifyPlayer, status as questStatus } from "component:quest-v1/host-quest-manager";
import { getCurrentUrl } from 'component:quest-v1/host-events';
"#;
    let store = ModuleStore::new("quest-sandbox");
    let bundle = SourceBundle::new(main, "agent-p");
    let output = ModuleLinker::new().link(&store, (&bundle).into()).unwrap();

    let manager = output.adapter(MANAGER).unwrap();
    for name in ["registerTask", "notifyPlayer", "status"] {
        assert!(manager.exports.contains(name), "{name}");
    }
    assert!(output.adapter(EVENTS).unwrap().exports.contains("getCurrentUrl"));
    assert_eq!(output.adapters.len(), 2);
}

/// A main module whose imports are already minted URLs links unchanged.
#[test]
fn test_rewrite_of_minted_urls_is_a_noop() {
    let main = "import { log } from 'blob:quest-sandbox/adapter/component-quest-v1-host-console-0123456789abcdef';\n\
                const core = fetch('blob:quest-sandbox/wasm/agent.core.wasm-0123456789abcdef');\n";
    let store = ModuleStore::new("quest-sandbox");
    let bundle = SourceBundle::new(main, "agent-i");
    let output = ModuleLinker::new().link(&store, (&bundle).into()).unwrap();

    assert_eq!(output.main_source, main);
    assert!(output.adapters.is_empty());
}
