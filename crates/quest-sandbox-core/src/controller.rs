//! Agent lifecycle controller and the sandbox event loop.
//!
//! [`LifecycleController`] runs one bundle end to end: link, import, call
//! the lifecycle export, report, tear down. [`Sandbox`] owns a controller
//! and the sandbox end of the channel and drives both from a single task.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use quest_sandbox_common::protocol::{Endpoint, MessageReceiver};
use quest_sandbox_common::{SandboxConfig, SandboxError, SandboxMessage, SourceBundle};

use crate::agent::{AgentModule, EntryPoint, GuestError, ImportScope, ModuleLoader, ON_VISIT};
use crate::blob::ModuleStore;
use crate::bridge::{Bridge, HostCapabilities, Incoming, render_value};
use crate::link::{LinkInput, ModuleLinker};

/// Result reported when an `init` entry point completes.
pub const INITIALIZED: &str = "Quest Initialized";

/// Events the host delivers to an active guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Navigate { url: String },
}

struct ActiveAgent {
    instance_id: String,
    module: Box<dyn AgentModule>,
}

/// A failure at the controller boundary, with the guest error that caused
/// it when there is one.
struct Failure {
    error: SandboxError,
    guest: Option<GuestError>,
}

impl From<SandboxError> for Failure {
    fn from(error: SandboxError) -> Self {
        Self { error, guest: None }
    }
}

/// Drives one agent execution at a time.
pub struct LifecycleController {
    config: SandboxConfig,
    bridge: Arc<Bridge>,
    loader: Arc<dyn ModuleLoader>,
    linker: ModuleLinker,
    active: Option<ActiveAgent>,
}

impl LifecycleController {
    pub fn new(config: SandboxConfig, bridge: Arc<Bridge>, loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            config,
            bridge,
            loader,
            linker: ModuleLinker::new(),
            active: None,
        }
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    /// Whether a guest is retained for event delivery.
    pub fn has_active_agent(&self) -> bool {
        self.active.is_some()
    }

    /// Run a bundle and return the result string reported to the host.
    ///
    /// Never fails: errors are rendered as `Error: <kind>: <detail>`.
    #[instrument(skip_all, fields(instance_id = %bundle.instance_id))]
    pub async fn execute_bundle(&mut self, bundle: SourceBundle) -> String {
        if let Some(previous) = self.active.take() {
            debug!(instance_id = %previous.instance_id, "Dropping previous agent");
        }

        let store = ModuleStore::new(self.config.blob_origin.clone());
        let capabilities = HostCapabilities::new(self.bridge.clone(), &bundle.instance_id);
        let mut linked_source = None;

        let outcome = self
            .run_lifecycle(&store, &capabilities, &bundle, &mut linked_source)
            .await;

        let mut result = match outcome {
            Ok(result) => {
                info!(result = %result, "Agent execution complete");
                result
            }
            Err(failure) => {
                error!(error = %failure.error, "Agent execution failed");
                if let (Some(source), Some((line, column))) = (
                    linked_source.as_deref(),
                    failure.guest.as_ref().and_then(GuestError::location),
                ) {
                    error!(
                        line,
                        column,
                        "Agent source around failure:\n{}",
                        source_context(source, line, column, self.config.source_context_lines)
                    );
                }
                failure.error.to_result()
            }
        };

        if self.bridge.is_channel_lost() {
            result = SandboxError::channel("host channel closed").to_result();
        }

        let released = store.release_all();
        let rejected = self.bridge.teardown();
        debug!(released, rejected, "Execution torn down");

        result
    }

    async fn run_lifecycle(
        &mut self,
        store: &ModuleStore,
        capabilities: &HostCapabilities,
        bundle: &SourceBundle,
        linked_source: &mut Option<String>,
    ) -> Result<String, Failure> {
        let link = self.linker.link(store, LinkInput::from(bundle))?;
        *linked_source = Some(link.main_source.clone());

        let scope = ImportScope {
            store,
            capabilities,
            link: &link,
        };
        let mut module = self
            .loader
            .import(link.main.url(), scope)
            .await
            .map_err(|e| Failure {
                error: SandboxError::load(e.message.clone()),
                guest: Some(e),
            })?;

        let exports = module.exports();
        debug!(exports = ?exports, "Agent module imported");

        let entry = EntryPoint::select(&exports).ok_or(SandboxError::NoEntryPoint)?;
        let args = if entry.takes_code() {
            let code = bundle
                .code_arg()
                .unwrap_or(self.config.default_code.as_str());
            vec![Value::String(code.to_string())]
        } else {
            Vec::new()
        };

        debug!(entry = entry.export_name(), "Calling lifecycle export");
        let value = module
            .call(entry.export_name(), args)
            .await
            .map_err(|e| Failure {
                error: SandboxError::runtime(e.message.clone()),
                guest: Some(e),
            })?;

        self.active = Some(ActiveAgent {
            instance_id: bundle.instance_id.clone(),
            module,
        });

        Ok(match entry {
            EntryPoint::Init | EntryPoint::NestedInit => INITIALIZED.to_string(),
            EntryPoint::Run | EntryPoint::RunCode => render_value(&value),
        })
    }

    /// Deliver a host event to the active guest.
    ///
    /// Returns `Ok(false)` when there is no active guest or it does not
    /// export a handler.
    ///
    /// # Errors
    ///
    /// `runtime-error` if the guest's handler throws.
    pub async fn dispatch_event(&mut self, event: HostEvent) -> Result<bool, SandboxError> {
        let HostEvent::Navigate { url } = event;
        let Some(active) = self.active.as_mut() else {
            debug!(url = %url, "Navigation with no active agent");
            return Ok(false);
        };
        if !active.module.exports().contains(ON_VISIT) {
            debug!(instance_id = %active.instance_id, "Agent has no onVisit export");
            return Ok(false);
        }

        debug!(instance_id = %active.instance_id, url = %url, "Dispatching onVisit");
        active
            .module
            .call(ON_VISIT, vec![Value::String(url)])
            .await
            .map(|_| true)
            .map_err(|e| SandboxError::runtime(e.message))
    }

    /// Drop the active guest and reject pending requests.
    pub fn shutdown(&mut self) {
        self.active = None;
        self.bridge.teardown();
    }
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("config", &self.config)
            .field("active", &self.active.as_ref().map(|a| &a.instance_id))
            .finish_non_exhaustive()
    }
}

/// Numbered lines of `source` around `line`, with the failing line marked.
pub fn source_context(source: &str, line: usize, column: usize, radius: usize) -> String {
    let first = line.saturating_sub(radius).max(1);
    let last = line.saturating_add(radius);
    let mut out = String::new();
    for (number, text) in source.lines().enumerate().map(|(i, l)| (i + 1, l)) {
        if number < first || number > last {
            continue;
        }
        let marker = if number == line { '>' } else { ' ' };
        out.push_str(&format!("{marker}{number:>5} | {text}\n"));
        if number == line {
            out.push_str(&format!("       | {}^\n", " ".repeat(column.saturating_sub(1))));
        }
    }
    out
}

enum JobOutcome {
    Executed(String),
    Navigated(Result<bool, SandboxError>),
}

type Job = Pin<Box<dyn Future<Output = (LifecycleController, JobOutcome)> + Send>>;

enum Work {
    Execute(Box<SourceBundle>),
    Navigate(String),
}

/// The sandbox side of the channel.
///
/// Posts `SandboxReady`, then serves `ExecuteAgent` and `Navigate` until
/// the host end closes. Executions and navigation handlers run as jobs on
/// the same task as message intake, so host responses keep flowing while
/// a job awaits them.
///
/// One job runs at a time. An `ExecuteAgent` arriving while any job runs
/// completes immediately with `busy`; a `Navigate` is queued and delivered
/// once the running job finishes.
pub struct Sandbox {
    controller: LifecycleController,
    bridge: Arc<Bridge>,
    incoming: MessageReceiver,
}

impl Sandbox {
    pub fn new(config: SandboxConfig, endpoint: Endpoint, loader: Arc<dyn ModuleLoader>) -> Self {
        let bridge = Arc::new(Bridge::new(endpoint.tx));
        Self {
            controller: LifecycleController::new(config, bridge.clone(), loader),
            bridge,
            incoming: endpoint.rx,
        }
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    /// Serve until the host end of the channel closes.
    pub async fn run(self) {
        let Sandbox {
            controller,
            bridge,
            mut incoming,
        } = self;

        bridge.post(&SandboxMessage::SandboxReady);
        info!("Sandbox ready");

        let mut idle = Some(controller);
        let mut job: Option<Job> = None;
        let mut navigations: VecDeque<String> = VecDeque::new();

        loop {
            tokio::select! {
                (controller, outcome) = poll_job(&mut job) => {
                    job = None;
                    match outcome {
                        JobOutcome::Executed(result) => {
                            bridge.post(&SandboxMessage::AgentExecutionComplete { result });
                        }
                        JobOutcome::Navigated(Err(e)) => warn!(error = %e, "onVisit failed"),
                        JobOutcome::Navigated(Ok(_)) => {}
                    }
                    match navigations.pop_front() {
                        Some(url) => job = Some(start_job(controller, Work::Navigate(url))),
                        None => idle = Some(controller),
                    }
                }
                message = incoming.recv() => {
                    let Some(message) = message else {
                        debug!("Host channel closed; shutting down sandbox");
                        break;
                    };
                    let next = match bridge.handle_incoming(message) {
                        Incoming::Execute(bundle) => Work::Execute(bundle),
                        Incoming::Navigate(url) => Work::Navigate(url),
                        Incoming::InvalidExecute(e) => {
                            bridge.post(&SandboxMessage::AgentExecutionComplete {
                                result: e.to_result(),
                            });
                            continue;
                        }
                        Incoming::Response | Incoming::Ignored => continue,
                    };

                    if let Some(controller) = idle.take() {
                        job = Some(start_job(controller, next));
                        continue;
                    }

                    match next {
                        Work::Execute(bundle) => {
                            warn!(instance_id = %bundle.instance_id, "Rejecting execution while busy");
                            bridge.post(&SandboxMessage::AgentExecutionComplete {
                                result: SandboxError::Busy.to_result(),
                            });
                        }
                        Work::Navigate(url) => navigations.push_back(url),
                    }
                }
            }
        }

        drop(job);
        if let Some(mut controller) = idle {
            controller.shutdown();
        } else {
            bridge.teardown();
        }
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}

fn start_job(mut controller: LifecycleController, work: Work) -> Job {
    match work {
        Work::Execute(bundle) => Box::pin(async move {
            let result = controller.execute_bundle(*bundle).await;
            (controller, JobOutcome::Executed(result))
        }),
        Work::Navigate(url) => Box::pin(async move {
            let outcome = controller.dispatch_event(HostEvent::Navigate { url }).await;
            (controller, JobOutcome::Navigated(outcome))
        }),
    }
}

async fn poll_job(job: &mut Option<Job>) -> (LifecycleController, JobOutcome) {
    match job {
        Some(running) => running.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_context_window() {
        let source: String = (1..=30).map(|i| format!("line {i}\n")).collect();
        let context = source_context(&source, 15, 3, 2);

        let lines: Vec<&str> = context.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], "    13 | line 13");
        assert_eq!(lines[2], ">   15 | line 15");
        assert_eq!(lines[3], "       |   ^");
        assert_eq!(lines[5], "    17 | line 17");
    }

    #[test]
    fn test_source_context_clamps_at_edges() {
        let context = source_context("a\nb\nc", 1, 1, 10);
        assert!(context.starts_with(">    1 | a"));
        assert!(context.contains("     3 | c"));
    }
}
