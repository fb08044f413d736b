//! Forwarding of `ai.ask` prompts to an HTTP endpoint.
//!
//! The sandbox never talks to a model itself. The host posts
//! `{"prompt", "instanceId"}` to the configured endpoint and hands the
//! answer back to the guest as a string.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use quest_sandbox_common::CapabilityError;

use crate::Permissions;

/// Fields checked, in order, for the answer in a JSON object response.
const ANSWER_FIELDS: [&str; 3] = ["answer", "response", "text"];

/// Forwards prompts with permission checks and a request budget.
pub struct AiForwarder {
    client: Client,
    endpoint: String,
    permissions: Permissions,
    request_count: AtomicU32,
}

impl AiForwarder {
    /// Create a forwarder posting to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns `internal` if the HTTP client cannot be built.
    pub fn new(
        endpoint: impl Into<String>,
        permissions: Permissions,
        timeout: Duration,
    ) -> Result<Self, CapabilityError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("quest-sandbox/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CapabilityError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self::with_client(client, endpoint, permissions))
    }

    /// Create with a custom HTTP client.
    pub fn with_client(client: Client, endpoint: impl Into<String>, permissions: Permissions) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            permissions,
            request_count: AtomicU32::new(0),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Forward a prompt and return the answer.
    ///
    /// # Errors
    ///
    /// - `not-permitted` when the budget is spent, the endpoint host is not
    ///   allowed, or it resolves to a private address
    /// - `internal` when the request fails or the endpoint answers with an
    ///   error status
    pub async fn ask(&self, prompt: &str, instance_id: &str) -> Result<String, CapabilityError> {
        let count = self.request_count.fetch_add(1, Ordering::SeqCst);
        if count >= self.permissions.max_ai_requests {
            warn!(
                instance_id,
                count,
                max = self.permissions.max_ai_requests,
                "AI request limit exceeded"
            );
            return Err(CapabilityError::NotPermitted(format!(
                "ai request limit of {} reached",
                self.permissions.max_ai_requests
            )));
        }

        if !self.permissions.is_ai_endpoint_allowed(&self.endpoint) {
            warn!(endpoint = %self.endpoint, "AI request blocked: host not allowed");
            return Err(CapabilityError::NotPermitted(
                "ai endpoint host is not allowed".into(),
            ));
        }

        if Permissions::is_private_address(&self.endpoint) {
            warn!(endpoint = %self.endpoint, "AI request blocked: private address");
            return Err(CapabilityError::NotPermitted(
                "ai endpoint is a private address".into(),
            ));
        }

        debug!(instance_id, endpoint = %self.endpoint, "Forwarding prompt");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "prompt": prompt, "instanceId": instance_id }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CapabilityError::Internal("ai request timed out".into())
                } else {
                    CapabilityError::Internal(format!("ai request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CapabilityError::Internal(format!(
                "ai endpoint returned {status}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| CapabilityError::Internal(format!("ai response unreadable: {e}")))?;

        info!(instance_id, status = status.as_u16(), bytes = body.len(), "AI answer received");
        Ok(extract_answer(body))
    }

    /// Number of prompts attempted so far.
    pub fn request_count(&self) -> u32 {
        self.request_count.load(Ordering::SeqCst)
    }

    pub fn reset_count(&self) {
        self.request_count.store(0, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for AiForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiForwarder")
            .field("endpoint", &self.endpoint)
            .field("request_count", &self.request_count())
            .finish_non_exhaustive()
    }
}

/// Pull the answer out of a response body.
///
/// A JSON string is unwrapped, a JSON object yields its first
/// [`ANSWER_FIELDS`] string, and anything else is returned as is.
fn extract_answer(body: String) -> String {
    match serde_json::from_str::<Value>(&body) {
        Ok(Value::String(answer)) => answer,
        Ok(Value::Object(map)) => ANSWER_FIELDS
            .iter()
            .find_map(|field| map.get(*field).and_then(Value::as_str))
            .map_or(body.clone(), str::to_string),
        _ => body,
    }
}
