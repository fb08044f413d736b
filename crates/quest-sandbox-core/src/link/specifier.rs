//! Import specifier classification.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use quest_sandbox_common::SandboxError;

/// An import specifier the linker rewrites.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ImportSpecifier {
    /// `./NAME.js`
    RelativeShim { name: String },
    /// `component:PACKAGE/INTERFACE`
    WitComponent { package: String, interface: String },
    /// `wasi:PACKAGE/INTERFACE[@VERSION]`
    WasiPreview2 {
        package: String,
        interface: String,
        version: Option<String>,
    },
}

fn wit_shape() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z][A-Za-z0-9-]*):([A-Za-z0-9][A-Za-z0-9.-]*)/([A-Za-z0-9][A-Za-z0-9-]*)(?:@([0-9A-Za-z.+-]+))?$")
            .expect("valid regex")
    })
}

impl ImportSpecifier {
    /// Classify a `from '...'` / `import('...')` specifier.
    ///
    /// Returns `Ok(None)` for specifiers the linker leaves alone (absolute
    /// URLs, bare package names, already-minted `blob:` URLs).
    ///
    /// # Errors
    ///
    /// A WIT-shaped specifier in a namespace other than `component` or
    /// `wasi` is an `unknown-specifier`.
    pub fn parse(specifier: &str) -> Result<Option<Self>, SandboxError> {
        if let Some(name) = relative_shim_name(specifier) {
            return Ok(Some(Self::RelativeShim {
                name: name.to_string(),
            }));
        }

        if specifier.starts_with("blob:") {
            return Ok(None);
        }

        let Some(caps) = wit_shape().captures(specifier) else {
            return Ok(None);
        };

        let package = caps[2].to_string();
        let interface = caps[3].to_string();
        match &caps[1] {
            "component" => Ok(Some(Self::WitComponent { package, interface })),
            "wasi" => Ok(Some(Self::WasiPreview2 {
                package,
                interface,
                version: caps.get(4).map(|m| m.as_str().to_string()),
            })),
            _ => Err(SandboxError::unknown_specifier(specifier)),
        }
    }

    /// Whether the linker generates an adapter for this specifier.
    pub fn needs_adapter(&self) -> bool {
        matches!(self, Self::WitComponent { .. } | Self::WasiPreview2 { .. })
    }
}

impl fmt::Display for ImportSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RelativeShim { name } => write!(f, "./{name}.js"),
            Self::WitComponent { package, interface } => {
                write!(f, "component:{package}/{interface}")
            }
            Self::WasiPreview2 {
                package,
                interface,
                version,
            } => {
                write!(f, "wasi:{package}/{interface}")?;
                if let Some(version) = version {
                    write!(f, "@{version}")?;
                }
                Ok(())
            }
        }
    }
}

/// `./NAME.js` → `NAME`.
pub(crate) fn relative_shim_name(specifier: &str) -> Option<&str> {
    let name = specifier.strip_prefix("./")?.strip_suffix(".js")?;
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    valid.then_some(name)
}

/// Kebab-case WIT identifier to JavaScript camelCase.
pub fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '-' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}
