//! Capability-based permissions for guest calls.
//!
//! This module provides the [`Permissions`] struct, which decides which
//! capabilities an agent may invoke and where `ai.ask` prompts may be
//! forwarded.

use std::collections::HashSet;

use quest_sandbox_common::Capability;

/// Permission configuration for a sandbox host.
///
/// Checked by the [`CapabilityRegistry`](crate::CapabilityRegistry) before
/// any handler runs. By default nothing is allowed; each capability must be
/// granted explicitly.
#[derive(Debug, Clone, Default)]
pub struct Permissions {
    /// Capabilities the guest may invoke.
    pub allowed_capabilities: HashSet<Capability>,

    /// Hosts the AI forwarder may contact (domain patterns).
    ///
    /// Patterns can be:
    /// - Exact match: `llm.example.com`
    /// - Wildcard subdomain: `*.example.com` (matches `api.example.com` and `example.com`)
    /// - All hosts: `*`
    pub allowed_ai_hosts: HashSet<String>,

    /// Maximum `ai.ask` prompts forwarded per host lifetime.
    pub max_ai_requests: u32,
}

impl Permissions {
    /// Create a permission set with every capability disabled.
    pub fn none() -> Self {
        Self::default()
    }

    /// Create a permission set with every capability enabled.
    ///
    /// Intended for development and tests.
    pub fn all() -> Self {
        Self {
            allowed_capabilities: Capability::ALL.into_iter().collect(),
            allowed_ai_hosts: HashSet::from(["*".to_string()]),
            max_ai_requests: 100,
        }
    }

    /// Every quest and console capability, without `ai.ask`.
    pub fn quest_defaults() -> Self {
        Self::builder()
            .allow_capabilities(
                Capability::ALL
                    .into_iter()
                    .filter(|c| *c != Capability::AiAsk),
            )
            .build()
    }

    /// Create a builder for constructing permissions.
    pub fn builder() -> PermissionsBuilder {
        PermissionsBuilder::default()
    }

    /// Check if the guest may invoke `capability`.
    pub fn is_capability_allowed(&self, capability: Capability) -> bool {
        self.allowed_capabilities.contains(&capability)
    }

    /// Check if prompts may be forwarded to `url`.
    pub fn is_ai_endpoint_allowed(&self, url: &str) -> bool {
        if !self.is_capability_allowed(Capability::AiAsk) {
            return false;
        }

        if self.allowed_ai_hosts.contains("*") {
            return true;
        }

        let host = match url::Url::parse(url) {
            Ok(parsed) => match parsed.host_str() {
                Some(h) => h.to_lowercase(),
                None => return false,
            },
            Err(_) => return false,
        };

        self.allowed_ai_hosts
            .iter()
            .any(|pattern| Self::matches_pattern(pattern, &host))
    }

    fn matches_pattern(pattern: &str, host: &str) -> bool {
        let pattern = pattern.to_lowercase();

        if let Some(bare) = pattern.strip_prefix("*.") {
            host == bare || host.ends_with(&pattern[1..])
        } else {
            pattern == host
        }
    }

    /// Check if the URL points at a private or internal address.
    ///
    /// Blocks localhost, private and link-local ranges, and cloud metadata
    /// endpoints.
    pub fn is_private_address(url: &str) -> bool {
        let Ok(parsed) = url::Url::parse(url) else {
            return false;
        };

        let Some(host_str) = parsed.host_str() else {
            return false;
        };
        let host = host_str.to_lowercase();

        if host == "localhost" || host == "metadata.google.internal" {
            return true;
        }

        match parsed.host() {
            Some(url::Host::Ipv4(v4)) => {
                v4.is_private()
                    || v4.is_loopback()
                    || v4.is_link_local()
                    || v4.is_broadcast()
                    || v4.is_documentation()
                    || v4.is_unspecified()
            }
            Some(url::Host::Ipv6(v6)) => v6.is_loopback() || v6.is_unspecified(),
            Some(url::Host::Domain(_)) | None => false,
        }
    }
}

/// Builder for [`Permissions`].
#[derive(Debug, Default)]
pub struct PermissionsBuilder {
    inner: Permissions,
}

impl PermissionsBuilder {
    /// Grant the given capabilities.
    #[must_use]
    pub fn allow_capabilities<I>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = Capability>,
    {
        self.inner.allowed_capabilities.extend(capabilities);
        self
    }

    /// Grant `ai.ask`, forwarding only to the given host patterns.
    #[must_use]
    pub fn allow_ai_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.allowed_capabilities.insert(Capability::AiAsk);
        self.inner.allowed_ai_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Set the maximum number of forwarded prompts.
    #[must_use]
    pub fn max_ai_requests(mut self, max: u32) -> Self {
        self.inner.max_ai_requests = max;
        self
    }

    /// Build the permissions.
    #[must_use]
    pub fn build(self) -> Permissions {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permissions_none() {
        let perms = Permissions::none();
        assert!(perms.allowed_capabilities.is_empty());
        assert!(!perms.is_capability_allowed(Capability::ConsoleLog));
        assert!(!perms.is_ai_endpoint_allowed("https://llm.example.com/ask"));
    }

    #[test]
    fn test_permissions_all() {
        let perms = Permissions::all();
        for capability in Capability::ALL {
            assert!(perms.is_capability_allowed(capability), "{capability}");
        }
        assert!(perms.is_ai_endpoint_allowed("https://anything.example/"));
    }

    #[test]
    fn test_quest_defaults_exclude_ai() {
        let perms = Permissions::quest_defaults();
        assert!(perms.is_capability_allowed(Capability::QuestUpdateTask));
        assert!(perms.is_capability_allowed(Capability::ConsoleLog));
        assert!(!perms.is_capability_allowed(Capability::AiAsk));
    }

    #[test]
    fn test_ai_endpoint_exact_and_wildcard() {
        let perms = Permissions::builder()
            .allow_ai_hosts(["llm.example.com", "*.models.dev"])
            .build();

        assert!(perms.is_ai_endpoint_allowed("https://llm.example.com/v1/ask"));
        assert!(!perms.is_ai_endpoint_allowed("https://other.example.com/v1/ask"));
        assert!(perms.is_ai_endpoint_allowed("https://eu.models.dev/ask"));
        assert!(perms.is_ai_endpoint_allowed("https://models.dev/ask"));
        assert!(!perms.is_ai_endpoint_allowed("not a url"));
    }

    #[test]
    fn test_private_address() {
        assert!(Permissions::is_private_address("http://localhost:8080/"));
        assert!(Permissions::is_private_address("http://127.0.0.1:8080/"));
        assert!(Permissions::is_private_address("http://[::1]:8080/"));
        assert!(Permissions::is_private_address("http://10.0.0.1/"));
        assert!(Permissions::is_private_address("http://192.168.1.1/"));
        assert!(Permissions::is_private_address("http://169.254.169.254/"));
        assert!(Permissions::is_private_address("http://metadata.google.internal/"));

        assert!(!Permissions::is_private_address("https://llm.example.com/"));
        assert!(!Permissions::is_private_address("https://8.8.8.8/"));
    }

    #[test]
    fn test_builder() {
        let perms = Permissions::builder()
            .allow_capabilities([Capability::ConsoleLog, Capability::QuestNotifyPlayer])
            .allow_ai_hosts(["llm.example.com"])
            .max_ai_requests(3)
            .build();

        assert_eq!(perms.allowed_capabilities.len(), 3);
        assert_eq!(perms.max_ai_requests, 3);
        assert!(perms.is_capability_allowed(Capability::AiAsk));
    }
}
