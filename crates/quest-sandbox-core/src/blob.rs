//! In-memory module store.
//!
//! [`ModuleStore`] turns source strings and wasm bytes into `blob:` URLs that
//! a module loader can resolve, and invalidates all of them at once when an
//! execution ends. URLs are derived from the content, so minting the same
//! input twice yields the same URL.

use std::collections::HashMap;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};
use url::Url;

use quest_sandbox_common::SandboxError;

/// MIME type of script modules.
pub const JAVASCRIPT_MIME: &str = "text/javascript";

/// MIME type of wasm payloads.
pub const WASM_MIME: &str = "application/wasm";

/// What a minted module is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    /// A realized shim.
    Shim,
    /// A generated adapter for one import specifier.
    Adapter,
    /// The rewritten agent module.
    Main,
    /// A wasm payload.
    Wasm,
    /// The module exporting the capability object.
    Bridge,
}

impl ModuleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleKind::Shim => "shim",
            ModuleKind::Adapter => "adapter",
            ModuleKind::Main => "main",
            ModuleKind::Wasm => "wasm",
            ModuleKind::Bridge => "bridge",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A minted module URL.
///
/// The `retained` flag is shared with the store: once the store releases,
/// every clone of the handle reports `is_retained() == false`.
#[derive(Debug, Clone)]
pub struct ModuleHandle {
    key: String,
    url: Url,
    kind: ModuleKind,
    retained: Arc<AtomicBool>,
}

impl ModuleHandle {
    /// Shim name, wasm file name, import specifier, or `main`.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    /// Whether the URL still resolves.
    pub fn is_retained(&self) -> bool {
        self.retained.load(Ordering::SeqCst)
    }
}

/// Content behind a minted URL.
#[derive(Debug, Clone)]
pub struct Blob {
    pub kind: ModuleKind,
    pub key: String,
    pub mime: String,
    pub content: Arc<[u8]>,
}

impl Blob {
    /// The content as UTF-8 text, if it is text.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }
}

/// Per-execution store of minted module URLs.
///
/// Shared between the linker (which mints) and the module loader (which
/// resolves); interior mutability keeps both on `&self`.
pub struct ModuleStore {
    origin: String,
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    blobs: HashMap<String, Blob>,
    handles: Vec<ModuleHandle>,
    released: bool,
}

impl ModuleStore {
    /// Create an empty store minting `blob:<origin>/...` URLs.
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            inner: Mutex::new(StoreInner::default()),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Mint a URL for `content`.
    ///
    /// Minting the same `(kind, key, content)` again returns the existing
    /// handle.
    ///
    /// # Errors
    ///
    /// Fails once the store has been released.
    pub fn mint(
        &self,
        kind: ModuleKind,
        key: &str,
        content: impl Into<Vec<u8>>,
        mime: &str,
    ) -> Result<ModuleHandle, SandboxError> {
        let content: Vec<u8> = content.into();
        let mut inner = self.inner.lock();
        if inner.released {
            return Err(SandboxError::load(format!(
                "cannot mint {kind} module '{key}' into a released store"
            )));
        }

        let base = format!(
            "blob:{}/{}/{}-{}",
            self.origin,
            kind,
            slug(key),
            content_hash(kind, key, &content)
        );

        let mut candidate = base.clone();
        let mut suffix = 1;
        while let Some(existing) = inner.blobs.get(&candidate) {
            if existing.key == key && existing.kind == kind {
                if let Some(handle) = inner.handles.iter().find(|h| h.url.as_str() == candidate) {
                    return Ok(handle.clone());
                }
            }
            suffix += 1;
            candidate = format!("{base}-{suffix}");
        }

        let url = Url::parse(&candidate)
            .map_err(|e| SandboxError::load(format!("invalid module URL '{candidate}': {e}")))?;

        let handle = ModuleHandle {
            key: key.to_string(),
            url,
            kind,
            retained: Arc::new(AtomicBool::new(true)),
        };

        trace!(url = %handle.url, kind = %kind, key, bytes = content.len(), "Minted module");

        inner.blobs.insert(
            candidate,
            Blob {
                kind,
                key: key.to_string(),
                mime: mime.to_string(),
                content: Arc::from(content),
            },
        );
        inner.handles.push(handle.clone());

        Ok(handle)
    }

    /// Fetch the content behind a URL.
    ///
    /// Returns `None` for unknown URLs and for every URL after release.
    pub fn resolve(&self, url: &str) -> Option<Blob> {
        let inner = self.inner.lock();
        if inner.released {
            return None;
        }
        inner.blobs.get(url).cloned()
    }

    /// Invalidate every minted URL.
    ///
    /// Returns the number of URLs released.
    pub fn release_all(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.released = true;
        inner.blobs.clear();
        for handle in &inner.handles {
            handle.retained.store(false, Ordering::SeqCst);
        }
        let count = inner.handles.len();
        debug!(count, origin = %self.origin, "Released module URLs");
        count
    }

    /// Every handle minted so far, in minting order.
    pub fn handles(&self) -> Vec<ModuleHandle> {
        self.inner.lock().handles.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().released
    }
}

impl fmt::Debug for ModuleStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ModuleStore")
            .field("origin", &self.origin)
            .field("modules", &inner.handles.len())
            .field("released", &inner.released)
            .finish()
    }
}

/// URL-safe rendering of a key.
fn slug(key: &str) -> String {
    let slug: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "module".to_string()
    } else {
        slug.to_string()
    }
}

fn content_hash(kind: ModuleKind, key: &str, content: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    kind.hash(&mut hasher);
    key.hash(&mut hasher);
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_and_resolve() {
        let store = ModuleStore::new("test");
        let handle = store
            .mint(ModuleKind::Shim, "io", "export const x = 1;", JAVASCRIPT_MIME)
            .unwrap();

        assert!(handle.url().as_str().starts_with("blob:test/shim/io-"));
        assert_eq!(handle.key(), "io");
        assert_eq!(handle.kind(), ModuleKind::Shim);
        assert!(handle.is_retained());

        let blob = store.resolve(handle.url().as_str()).unwrap();
        assert_eq!(blob.text(), Some("export const x = 1;"));
        assert_eq!(blob.mime, JAVASCRIPT_MIME);
    }

    #[test]
    fn test_urls_are_deterministic() {
        let a = ModuleStore::new("test");
        let b = ModuleStore::new("test");

        let ha = a.mint(ModuleKind::Shim, "io", "x", JAVASCRIPT_MIME).unwrap();
        let hb = b.mint(ModuleKind::Shim, "io", "x", JAVASCRIPT_MIME).unwrap();
        let hc = b.mint(ModuleKind::Shim, "io2", "x", JAVASCRIPT_MIME).unwrap();

        assert_eq!(ha.url(), hb.url());
        assert_ne!(hb.url(), hc.url());
    }

    #[test]
    fn test_minting_twice_returns_same_handle() {
        let store = ModuleStore::new("test");
        let first = store.mint(ModuleKind::Wasm, "a.wasm", vec![0u8, 1], WASM_MIME).unwrap();
        let second = store.mint(ModuleKind::Wasm, "a.wasm", vec![0u8, 1], WASM_MIME).unwrap();

        assert_eq!(first.url(), second.url());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_release_all_invalidates_every_handle() {
        let store = ModuleStore::new("test");
        let shim = store.mint(ModuleKind::Shim, "io", "a", JAVASCRIPT_MIME).unwrap();
        let main = store.mint(ModuleKind::Main, "main", "b", JAVASCRIPT_MIME).unwrap();
        let copy = shim.clone();

        assert_eq!(store.release_all(), 2);

        assert!(!shim.is_retained());
        assert!(!copy.is_retained());
        assert!(!main.is_retained());
        assert!(store.resolve(shim.url().as_str()).is_none());
        assert!(store.resolve(main.url().as_str()).is_none());
        assert!(store.is_released());
    }

    #[test]
    fn test_mint_after_release_is_rejected() {
        let store = ModuleStore::new("test");
        store.release_all();

        let err = store
            .mint(ModuleKind::Main, "main", "x", JAVASCRIPT_MIME)
            .unwrap_err();
        assert_eq!(err.kind(), quest_sandbox_common::ErrorKind::LoadError);
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("component:quest-v1/host-console"), "component-quest-v1-host-console");
        assert_eq!(slug("agent.core.wasm"), "agent.core.wasm");
        assert_eq!(slug("///"), "module");
    }
}
