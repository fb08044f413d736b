//! The host end of the sandbox channel.
//!
//! [`SandboxHost`] answers guest requests through the
//! [`CapabilityRegistry`]; a [`HostHandle`] drives executions and
//! navigation from the embedding application.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use quest_sandbox_common::protocol::{Endpoint, MessageSender};
use quest_sandbox_common::{HostMessage, SandboxMessage, SourceBundle};

use crate::quest::QuestBook;
use crate::registry::CapabilityRegistry;

/// Errors seen by a [`HostHandle`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// The sandbox end of the channel is gone.
    #[error("sandbox channel closed")]
    Closed,
}

/// Lifecycle messages forwarded to the [`HostHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum Notice {
    Ready,
    Complete(String),
}

/// Generate a fresh agent instance id.
pub fn new_instance_id() -> String {
    Uuid::new_v4().to_string()
}

/// Serves guest requests until the sandbox closes its end of the channel.
pub struct SandboxHost {
    registry: Arc<CapabilityRegistry>,
    endpoint: Endpoint,
    notices: mpsc::UnboundedSender<Notice>,
}

impl SandboxHost {
    /// Create a host over the host end of a channel.
    pub fn new(registry: Arc<CapabilityRegistry>, endpoint: Endpoint) -> (Self, HostHandle) {
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let handle = HostHandle {
            tx: endpoint.tx.clone(),
            notices: notices_rx,
            book: None,
        };
        let host = Self {
            registry,
            endpoint,
            notices,
        };
        (host, handle)
    }

    /// Track navigations in `book` so `quest.getCurrentUrl` follows them.
    pub fn with_quest_book(
        registry: Arc<CapabilityRegistry>,
        endpoint: Endpoint,
        book: Arc<QuestBook>,
    ) -> (Self, HostHandle) {
        let (host, mut handle) = Self::new(registry, endpoint);
        handle.book = Some(book);
        (host, handle)
    }

    /// Serve until the sandbox end closes.
    ///
    /// Each request is dispatched on its own task, so responses may be
    /// posted in any order. The host keeps only a weak sender, so the
    /// sandbox sees its channel close once the [`HostHandle`] is dropped.
    #[instrument(skip_all)]
    pub async fn run(self) {
        let SandboxHost {
            registry,
            endpoint: Endpoint { tx, mut rx },
            notices,
        } = self;
        let weak_tx = tx.downgrade();
        drop(tx);

        while let Some(value) = rx.recv().await {
            let message = match SandboxMessage::from_value(value) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed sandbox message");
                    continue;
                }
            };

            match message {
                SandboxMessage::SandboxReady => {
                    info!("Sandbox ready");
                    let _ = notices.send(Notice::Ready);
                }
                SandboxMessage::AgentExecutionComplete { result } => {
                    info!(result = %result, "Agent execution complete");
                    let _ = notices.send(Notice::Complete(result));
                }
                SandboxMessage::Request {
                    kind,
                    request_id,
                    data,
                } => {
                    let Some(tx) = weak_tx.upgrade() else {
                        debug!(request_id, "Host handle gone; dropping request");
                        continue;
                    };
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        respond(&registry, &tx, &kind, request_id, data).await;
                    });
                }
                SandboxMessage::Event { kind, data } => {
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        if let Err(e) = registry.dispatch(&kind, data).await {
                            warn!(kind = %kind, error = %e, "Guest event failed");
                        }
                    });
                }
            }
        }

        debug!("Sandbox channel closed; host stopping");
    }
}

impl std::fmt::Debug for SandboxHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHost")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

async fn respond(
    registry: &CapabilityRegistry,
    tx: &MessageSender,
    kind: &str,
    request_id: u64,
    data: Value,
) {
    let (success, data) = match registry.dispatch(kind, data).await {
        Ok(data) => (true, data),
        Err(e) => {
            debug!(kind, request_id, error = %e, "Capability call failed");
            (false, Value::String(e.to_string()))
        }
    };

    let response = HostMessage::HostResponse {
        request_id,
        success,
        data,
    };
    if tx.send(response.to_value()).is_err() {
        debug!(request_id, "Sandbox gone before response");
    }
}

/// Drives a sandbox from the embedding application.
#[derive(Debug)]
pub struct HostHandle {
    tx: MessageSender,
    notices: mpsc::UnboundedReceiver<Notice>,
    book: Option<Arc<QuestBook>>,
}

impl HostHandle {
    /// Wait for `SandboxReady`.
    pub async fn ready(&mut self) -> Result<(), HostError> {
        loop {
            match self.notices.recv().await {
                Some(Notice::Ready) => return Ok(()),
                Some(Notice::Complete(result)) => {
                    warn!(result = %result, "Unexpected completion before ready");
                }
                None => return Err(HostError::Closed),
            }
        }
    }

    /// Post `ExecuteAgent` and wait for its completion.
    #[instrument(skip_all, fields(instance_id = %bundle.instance_id))]
    pub async fn execute(&mut self, bundle: SourceBundle) -> Result<String, HostError> {
        self.send(&HostMessage::ExecuteAgent(Box::new(bundle)))?;
        loop {
            match self.notices.recv().await {
                Some(Notice::Complete(result)) => return Ok(result),
                Some(Notice::Ready) => {}
                None => return Err(HostError::Closed),
            }
        }
    }

    /// Post `Navigate`.
    pub fn navigate(&self, url: &str) -> Result<(), HostError> {
        if let Some(book) = &self.book {
            book.set_current_url(url);
        }
        self.send(&HostMessage::Navigate {
            url: url.to_string(),
        })
    }

    fn send(&self, message: &HostMessage) -> Result<(), HostError> {
        self.tx
            .send(message.to_value())
            .map_err(|_| HostError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_ids_are_unique() {
        assert_ne!(new_instance_id(), new_instance_id());
        assert_eq!(new_instance_id().len(), 36);
    }
}
