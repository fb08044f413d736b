//! Lexical scanning and rewriting of import sites.
//!
//! The linker never parses JavaScript. It recognizes a handful of import
//! and export site shapes with regular expressions and rewrites only the
//! specifier inside them. Sites are only accepted when their keyword sits
//! in code: text inside string literals, template literals and comments is
//! never scanned or rewritten.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use quest_sandbox_common::SandboxError;

use super::specifier::relative_shim_name;

const IDENT: &str = r"[A-Za-z_$][\w$]*";
const QUOTED: &str = r#"(?:'([^'\n]*)'|"([^"\n]*)")"#;

fn compile(pattern: &str, what: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("{what} regex: {e}"))
}

/// `... from 'SPEC'` (static imports and re-exports).
fn from_site() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| compile(&format!(r"(\bfrom\s*){QUOTED}"), "from site"))
}

/// `import('SPEC')`
fn dynamic_site() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| compile(&format!(r"(\bimport\s*\(\s*){QUOTED}(\s*\))"), "dynamic import"))
}

/// `import 'SPEC';`
fn side_effect_site() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| compile(&format!(r"(\bimport\s*){QUOTED}"), "side-effect import"))
}

/// `import [Default,] { a, b as c } from 'SPEC'` and
/// `export { a, b as c } from 'SPEC'`
fn named_group() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        compile(
            &format!(r"\b(?:import\s*(?:{IDENT}\s*,\s*)?|export\s*)\{{([^}}]*)\}}\s*from\s*{QUOTED}"),
            "named group",
        )
    })
}

/// `import Default [, ...] from 'SPEC'`
fn default_import() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        compile(
            &format!(
                r"\bimport\s+({IDENT})\s*(?:,\s*(?:\{{[^}}]*\}}|\*\s*as\s+{IDENT})\s*)?from\s*{QUOTED}"
            ),
            "default import",
        )
    })
}

/// `import [Default,] * as ns from 'SPEC'`
fn namespace_import() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        compile(
            &format!(r"\bimport\s*(?:{IDENT}\s*,\s*)?\*\s*as\s+({IDENT})\s*from\s*{QUOTED}"),
            "namespace import",
        )
    })
}

/// `export * [as ns] from 'SPEC'`
fn star_export() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        compile(
            &format!(r"\bexport\s*\*\s*(?:as\s+{IDENT}\s*)?from\s*{QUOTED}"),
            "star export",
        )
    })
}

/// Declarations exported by a module: `export [async] function NAME`,
/// `export const|let|var|class NAME`.
fn exported_declaration() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        compile(
            &format!(
                r"\bexport\s+(?:(?:async\s+)?function\s*\*?\s*|(?:const|let|var|class)\s+)({IDENT})"
            ),
            "exported declaration",
        )
    })
}

/// `export { a, b as c }` with or without a `from` clause.
fn export_list() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| compile(r"\bexport\s*\{([^}]*)\}", "export list"))
}

/// `new URL('./x.wasm', import.meta.url)`, any quote style.
fn wasm_url_expression() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        compile(
            r#"new\s+URL\s*\(\s*(?:'([^'\n]*)'|"([^"\n]*)"|`([^`\n]*)`)\s*,\s*import\.meta\.url\s*\)"#,
            "wasm url",
        )
    })
}

fn identifier() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| compile(&format!("^{IDENT}$"), "identifier"))
}

/// Byte ranges of a source that are not code.
#[derive(Debug)]
struct Literals {
    /// String literals, template literals and comments, sorted and
    /// disjoint.
    spans: Vec<Range<usize>>,
}

impl Literals {
    fn scan(source: &str) -> Self {
        let bytes = source.as_bytes();
        let mut spans = Vec::new();
        let mut i = 0;

        while i < bytes.len() {
            let start = i;
            match bytes[i] {
                quote @ (b'\'' | b'"' | b'`') => {
                    i += 1;
                    while i < bytes.len() && bytes[i] != quote {
                        if bytes[i] == b'\\' {
                            i += 1;
                        } else if bytes[i] == b'\n' && quote != b'`' {
                            break;
                        }
                        i += 1;
                    }
                    i = (i + 1).min(bytes.len());
                    spans.push(start..i);
                }
                b'/' if bytes.get(i + 1) == Some(&b'/') => {
                    i = source[i..].find('\n').map_or(bytes.len(), |end| i + end);
                    spans.push(start..i);
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    i = source[i + 2..]
                        .find("*/")
                        .map_or(bytes.len(), |end| i + 2 + end + 2);
                    spans.push(start..i);
                }
                _ => i += 1,
            }
        }

        Self { spans }
    }

    /// Whether byte `at` is outside every literal and comment.
    fn is_code(&self, at: usize) -> bool {
        let index = self.spans.partition_point(|span| span.end <= at);
        self.spans.get(index).is_none_or(|span| span.start > at)
    }
}

/// Matches of `re` whose first byte is code.
fn code_sites<'r, 'h>(
    re: &'r Regex,
    source: &'h str,
    literals: &'r Literals,
) -> impl Iterator<Item = Captures<'h>> + 'r
where
    'h: 'r,
{
    re.captures_iter(source)
        .filter(|caps| caps.get(0).is_some_and(|m| literals.is_code(m.start())))
}

/// The quoted specifier of a site match: `(quote, text)`.
fn quoted<'h>(caps: &Captures<'h>, single: usize) -> Option<(char, &'h str)> {
    if let Some(m) = caps.get(single) {
        return Some(('\'', m.as_str()));
    }
    caps.get(single + 1).map(|m| ('"', m.as_str()))
}

fn specifiers_in(source: &str, literals: &Literals) -> Vec<(usize, String)> {
    let mut found = Vec::new();
    for re in [from_site(), dynamic_site(), side_effect_site()] {
        for caps in code_sites(re, source, literals) {
            if let Some((_, spec)) = quoted(&caps, 2) {
                found.push((caps.get(0).map_or(0, |m| m.start()), spec.to_string()));
            }
        }
    }
    found.sort_by_key(|(at, _)| *at);
    found
}

/// Every import site's specifier, in source order.
pub fn import_specifiers(source: &str) -> Vec<String> {
    let literals = Literals::scan(source);
    specifiers_in(source, &literals)
        .into_iter()
        .map(|(_, spec)| spec)
        .collect()
}

/// Names of shims referenced through `./NAME.js` import sites.
pub fn relative_shim_refs(source: &str) -> BTreeSet<String> {
    import_specifiers(source)
        .iter()
        .filter_map(|spec| relative_shim_name(spec))
        .map(str::to_string)
        .collect()
}

/// What the sites importing one specifier ask of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteRequest {
    /// Names bound by named groups (`import { a }`, `export { a } from`),
    /// `default` for default imports, and members read through namespace
    /// bindings (`ns.a`).
    pub names: BTreeSet<String>,
    /// A namespace binding, `export *` or `import()` wants the whole
    /// module.
    pub whole_module: bool,
    /// Some site (`export *`, `import()`) exposes the module to code the
    /// linker cannot see, so its used members are unknown.
    pub opaque: bool,
}

/// Requests per specifier, across all import sites.
///
/// Specifiers only reached by side-effect imports appear with an empty
/// request.
#[derive(Debug, Default)]
pub struct ImportSites {
    pub requested: BTreeMap<String, SiteRequest>,
    pub diagnostics: Vec<SandboxError>,
}

/// Collect import sites and the names requested at each.
pub fn scan_import_sites(source: &str) -> ImportSites {
    let literals = Literals::scan(source);
    let mut sites = ImportSites::default();

    for (_, spec) in specifiers_in(source, &literals) {
        sites.requested.entry(spec).or_default();
    }

    for caps in code_sites(named_group(), source, &literals) {
        let Some((_, spec)) = quoted(&caps, 2) else {
            continue;
        };
        let group = caps.get(1).map_or("", |m| m.as_str());
        let request = sites.requested.entry(spec.to_string()).or_default();

        for binding in group.split(',').map(str::trim).filter(|b| !b.is_empty()) {
            match parse_binding(binding) {
                Some((source_name, _)) => {
                    request.names.insert(source_name.to_string());
                }
                None => sites.diagnostics.push(SandboxError::malformed_import(format!(
                    "cannot bind '{binding}' from '{spec}'"
                ))),
            }
        }
    }

    for caps in code_sites(default_import(), source, &literals) {
        if let Some((_, spec)) = quoted(&caps, 2) {
            let request = sites.requested.entry(spec.to_string()).or_default();
            request.names.insert("default".to_string());
        }
    }

    for caps in code_sites(namespace_import(), source, &literals) {
        let (Some(binding), Some((_, spec))) = (caps.get(1), quoted(&caps, 2)) else {
            continue;
        };
        let members = member_reads(source, &literals, binding.as_str());
        let request = sites.requested.entry(spec.to_string()).or_default();
        request.whole_module = true;
        request.names.extend(members);
    }

    for caps in code_sites(star_export(), source, &literals) {
        if let Some((_, spec)) = quoted(&caps, 1) {
            let request = sites.requested.entry(spec.to_string()).or_default();
            request.whole_module = true;
            request.opaque = true;
        }
    }

    for caps in code_sites(dynamic_site(), source, &literals) {
        if let Some((_, spec)) = quoted(&caps, 2) {
            let request = sites.requested.entry(spec.to_string()).or_default();
            request.whole_module = true;
            request.opaque = true;
        }
    }

    sites
}

/// Members read as `namespace.member` in code.
fn member_reads(source: &str, literals: &Literals, namespace: &str) -> BTreeSet<String> {
    let pattern = format!(
        r"(?:^|[^\w$.])({})\s*\.\s*({IDENT})",
        regex::escape(namespace)
    );
    let Ok(re) = Regex::new(&pattern) else {
        return BTreeSet::new();
    };
    re.captures_iter(source)
        .filter(|caps| caps.get(1).is_some_and(|m| literals.is_code(m.start())))
        .filter_map(|caps| caps.get(2).map(|m| m.as_str().to_string()))
        .collect()
}

/// Names a module exports, from its declarations and export lists.
pub fn export_names(source: &str) -> BTreeSet<String> {
    let literals = Literals::scan(source);
    let mut names = BTreeSet::new();

    for caps in code_sites(exported_declaration(), source, &literals) {
        if let Some(name) = caps.get(1) {
            names.insert(name.as_str().to_string());
        }
    }
    for caps in code_sites(export_list(), source, &literals) {
        let group = caps.get(1).map_or("", |m| m.as_str());
        for binding in group.split(',').map(str::trim).filter(|b| !b.is_empty()) {
            if let Some((_, exported)) = parse_binding(binding) {
                names.insert(exported.to_string());
            }
        }
    }
    if code_sites(export_default(), source, &literals).next().is_some() {
        names.insert("default".to_string());
    }

    names
}

fn export_default() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| compile(r"\bexport\s+default\b", "export default"))
}

/// `X` → `(X, X)`, `X as Y` → `(X, Y)`.
fn parse_binding(binding: &str) -> Option<(&str, &str)> {
    let mut parts = binding.split_whitespace();
    let name = parts.next()?;
    let alias = match (parts.next(), parts.next(), parts.next()) {
        (None, None, None) => name,
        (Some("as"), Some(alias), None) if identifier().is_match(alias) => alias,
        _ => return None,
    };
    identifier().is_match(name).then_some((name, alias))
}

/// Rewrite the specifier of every import site for which `resolve` returns
/// a replacement.
pub fn rewrite_import_sites(source: &str, resolve: impl Fn(&str) -> Option<String>) -> String {
    let rewrite_pass = |source: &str, re: &Regex| -> String {
        let literals = Literals::scan(source);
        re.replace_all(source, |caps: &Captures<'_>| -> String {
            let whole = caps.get(0).map_or("", |m| m.as_str());
            if !caps.get(0).is_some_and(|m| literals.is_code(m.start())) {
                return whole.to_string();
            }
            let (Some(prefix), Some((quote, spec))) = (caps.get(1), quoted(caps, 2)) else {
                return whole.to_string();
            };
            match resolve(spec) {
                Some(url) => {
                    let suffix = caps.get(4).map_or("", |m| m.as_str());
                    format!("{}{quote}{url}{quote}{suffix}", prefix.as_str())
                }
                None => whole.to_string(),
            }
        })
        .into_owned()
    };

    let source = rewrite_pass(source, from_site());
    let source = rewrite_pass(&source, dynamic_site());
    rewrite_pass(&source, side_effect_site())
}

/// Rewrite `new URL('./NAME.wasm', import.meta.url)` expressions to string
/// literals.
///
/// Returns the rewritten source and the file names that `resolve` could not
/// map.
pub fn rewrite_wasm_urls(
    source: &str,
    resolve: impl Fn(&str) -> Option<String>,
) -> (String, Vec<String>) {
    let literals = Literals::scan(source);
    let mut unresolved = Vec::new();
    let rewritten = wasm_url_expression().replace_all(source, |caps: &Captures<'_>| {
        let Some(site) = caps.get(0) else {
            return String::new();
        };
        let whole = site.as_str().to_string();
        if !literals.is_code(site.start()) {
            return whole;
        }
        let (quote, path) = match (caps.get(1), caps.get(2), caps.get(3)) {
            (Some(m), _, _) => ('\'', m.as_str()),
            (_, Some(m), _) => ('"', m.as_str()),
            (_, _, Some(m)) => ('`', m.as_str()),
            _ => return whole,
        };
        let file = path.strip_prefix("./").unwrap_or(path);
        if !file.ends_with(".wasm") {
            return whole;
        }
        match resolve(file) {
            Some(url) => format!("{quote}{url}{quote}"),
            None => {
                unresolved.push(file.to_string());
                whole
            }
        }
    });
    (rewritten.into_owned(), unresolved)
}

/// Replace bare quoted literals naming `file` (`'file'`, `"./file"`) with
/// the quoted `url`.
pub fn replace_wasm_literals(source: &str, file: &str, url: &str) -> String {
    let mut out = source.to_string();
    for quote in ['\'', '"'] {
        for path in [file.to_string(), format!("./{file}")] {
            let needle = format!("{quote}{path}{quote}");
            if out.contains(&needle) {
                out = out.replace(&needle, &format!("{quote}{url}{quote}"));
            }
        }
    }
    out
}
