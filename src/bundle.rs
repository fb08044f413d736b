//! Loading a source bundle from a directory.
//!
//! Layout:
//!
//! ```text
//! bundle/
//!   main.js         agent main module
//!   shims/*.js      shim modules, keyed by file name
//!   *.wasm          wasm payloads, keyed by file name
//!   args.json       optional invocation arguments (a JSON object)
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, bail};
use serde_json::{Map, Value};

use quest_sandbox_common::SourceBundle;

pub const MAIN_FILE: &str = "main.js";
pub const SHIM_DIR: &str = "shims";
pub const ARGS_FILE: &str = "args.json";

/// Read the bundle in `dir`.
pub fn load(dir: &Path, instance_id: &str) -> anyhow::Result<SourceBundle> {
    let main_path = dir.join(MAIN_FILE);
    let main_source = fs::read_to_string(&main_path)
        .with_context(|| format!("Failed to read {}", main_path.display()))?;
    let mut bundle = SourceBundle::new(main_source, instance_id);

    let shim_dir = dir.join(SHIM_DIR);
    if shim_dir.is_dir() {
        for entry in fs::read_dir(&shim_dir)
            .with_context(|| format!("Failed to list {}", shim_dir.display()))?
        {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "js") {
                let name = file_name(&path)?;
                let source = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read shim {}", path.display()))?;
                bundle.shims.insert(name, source);
            }
        }
    }

    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "wasm") {
            let bytes = fs::read(&path)
                .with_context(|| format!("Failed to read wasm {}", path.display()))?;
            bundle.wasm_files.insert(file_name(&path)?, bytes);
        }
    }

    let args_path = dir.join(ARGS_FILE);
    if args_path.is_file() {
        let text = fs::read_to_string(&args_path)
            .with_context(|| format!("Failed to read {}", args_path.display()))?;
        match serde_json::from_str::<Value>(&text)
            .with_context(|| format!("Invalid JSON in {}", args_path.display()))?
        {
            Value::Object(args) => bundle.args = Some(args),
            _ => bail!("{} must contain a JSON object", args_path.display()),
        }
    }

    Ok(bundle)
}

/// Set `args.code`, keeping any other arguments.
pub fn set_code(bundle: &mut SourceBundle, code: String) {
    bundle
        .args
        .get_or_insert_with(Map::new)
        .insert("code".into(), Value::String(code));
}

fn file_name(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .with_context(|| format!("Non UTF-8 file name: {}", path.display()))
}
