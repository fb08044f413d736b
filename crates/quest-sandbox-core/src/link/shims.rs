//! Topological shim realization.
//!
//! A shim can only be minted once every shim it imports has a URL, because
//! its own content must embed those URLs. Realization therefore proceeds in
//! passes, minting whatever has become ready, until nothing is left or a pass
//! makes no progress.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use quest_sandbox_common::SandboxError;

use super::scan::{relative_shim_refs, rewrite_import_sites};
use super::specifier::relative_shim_name;
use crate::blob::{JAVASCRIPT_MIME, ModuleHandle, ModuleKind, ModuleStore};

/// Shim names with any `.js` suffix stripped.
///
/// When both `io` and `io.js` are given, the suffixed entry wins.
pub fn normalize_shim_names(shims: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut normalized = BTreeMap::new();
    for (name, source) in shims {
        let bare = name.strip_suffix(".js").unwrap_or(name);
        if normalized.insert(bare.to_string(), source.clone()).is_some() {
            warn!(shim = %bare, "Duplicate shim name; keeping '{name}'");
        }
    }
    normalized
}

/// Mint every shim, dependencies first.
///
/// # Errors
///
/// `missing-dep` for each stuck shim that imports an absent name, otherwise
/// `circular-shims` naming every stuck shim.
pub fn realize_shims(
    store: &ModuleStore,
    shims: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, ModuleHandle>, SandboxError> {
    let shims = normalize_shim_names(shims);
    let deps: BTreeMap<&str, BTreeSet<String>> = shims
        .iter()
        .map(|(name, source)| (name.as_str(), relative_shim_refs(source)))
        .collect();

    let mut realized: BTreeMap<String, ModuleHandle> = BTreeMap::new();
    let mut pass = 0;

    while realized.len() < shims.len() {
        pass += 1;
        let mut progressed = false;

        for (name, source) in &shims {
            if realized.contains_key(name) {
                continue;
            }
            let ready = deps[name.as_str()].iter().all(|dep| realized.contains_key(dep));
            if !ready {
                continue;
            }

            let rewritten = rewrite_import_sites(source, |spec| {
                relative_shim_name(spec)
                    .and_then(|dep| realized.get(dep))
                    .map(|handle| handle.url().to_string())
            });
            let handle = store.mint(ModuleKind::Shim, name, rewritten, JAVASCRIPT_MIME)?;
            debug!(shim = %name, pass, url = %handle.url(), "Shim realized");
            realized.insert(name.clone(), handle);
            progressed = true;
        }

        if !progressed {
            return Err(stuck(&shims, &deps, &realized));
        }
    }

    Ok(realized)
}

fn stuck(
    shims: &BTreeMap<String, String>,
    deps: &BTreeMap<&str, BTreeSet<String>>,
    realized: &BTreeMap<String, ModuleHandle>,
) -> SandboxError {
    let unresolved: Vec<&str> = shims
        .keys()
        .map(String::as_str)
        .filter(|name| !realized.contains_key(*name))
        .collect();

    let missing: Vec<SandboxError> = unresolved
        .iter()
        .filter_map(|name| {
            let absent: Vec<String> = deps[name]
                .iter()
                .filter(|dep| !shims.contains_key(*dep))
                .cloned()
                .collect();
            (!absent.is_empty()).then(|| SandboxError::MissingDep {
                shim: (*name).to_string(),
                missing: absent,
            })
        })
        .collect();

    if missing.is_empty() {
        SandboxError::CircularShims {
            shims: unresolved.into_iter().map(str::to_string).collect(),
        }
    } else {
        SandboxError::from_diagnostics(missing)
    }
}
