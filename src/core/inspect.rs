//! Purpose: Resolve inspect requests against the builtin registry and render their docs.
//! Exports: `InspectionService`, `InspectResult`, `BuiltinRegistry`, `StaticRegistry`,
//! `DocRenderer`, `PlainDocRenderer`, `qualify`.
//! Role: Backs `inspect_request`; independent of the session and the engine.
//! Invariants: Unqualified names resolve in the default namespace before lookup.
//! Invariants: A miss is `found = false` with an empty bundle, never an error.
//! Invariants: A hit always carries `text/plain` and `text/html`.
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::core::error::{Error, ErrorKind};
use crate::core::mime::{MimeBundle, TEXT_HTML, TEXT_PLAIN};

pub const NAMESPACE_SEPARATOR: char = '`';
pub const DEFAULT_NAMESPACE: &str = "System`";

/// Lookup table of named builtins and their documentation.
pub trait BuiltinRegistry {
    /// Exact-key lookup. `Some("")` means the builtin exists but has no doc string.
    fn documentation(&self, qualified_name: &str) -> Option<&str>;
}

pub trait DocRenderer {
    fn text(&self, doc: &str, detail_level: u8) -> String;
    fn html(&self, doc: &str) -> String;
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StaticRegistry {
    entries: BTreeMap<String, String>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, name: impl Into<String>, doc: impl Into<String>) -> Self {
        self.entries.insert(name.into(), doc.into());
        self
    }

    /// Load a JSON object of `qualified name -> doc string` (null docs become empty).
    pub fn from_json_file(path: &Path) -> Result<Self, Error> {
        let file = File::open(path).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message(format!("failed to open builtins file {}", path.display()))
                .with_source(err)
        })?;
        let raw: BTreeMap<String, Option<String>> =
            serde_json::from_reader(BufReader::new(file)).map_err(|err| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("invalid builtins file {}", path.display()))
                    .with_hint("Expected a JSON object mapping qualified names to doc strings.")
                    .with_source(err)
            })?;
        let entries = raw
            .into_iter()
            .map(|(name, doc)| (name, doc.unwrap_or_default()))
            .collect();
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl BuiltinRegistry for StaticRegistry {
    fn documentation(&self, qualified_name: &str) -> Option<&str> {
        self.entries.get(qualified_name).map(String::as_str)
    }
}

/// Renders the first paragraph at detail level 0 and the full text otherwise.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainDocRenderer;

impl DocRenderer for PlainDocRenderer {
    fn text(&self, doc: &str, detail_level: u8) -> String {
        let doc = doc.trim();
        if detail_level > 0 {
            return doc.to_string();
        }
        doc.split("\n\n").next().unwrap_or_default().trim_end().to_string()
    }

    fn html(&self, doc: &str) -> String {
        format!("<pre>{}</pre>", html_escape::encode_text(doc.trim()))
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InspectResult {
    pub found: bool,
    pub data: MimeBundle,
}

pub fn qualify(name: &str, default_namespace: &str) -> String {
    if name.contains(NAMESPACE_SEPARATOR) {
        return name.to_string();
    }
    if default_namespace.ends_with(NAMESPACE_SEPARATOR) {
        format!("{default_namespace}{name}")
    } else {
        format!("{default_namespace}{NAMESPACE_SEPARATOR}{name}")
    }
}

pub struct InspectionService<R, D> {
    registry: R,
    renderer: D,
    default_namespace: String,
}

impl<R: BuiltinRegistry, D: DocRenderer> InspectionService<R, D> {
    pub fn new(registry: R, renderer: D) -> Self {
        Self {
            registry,
            renderer,
            default_namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }

    pub fn with_default_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.default_namespace = namespace.into();
        self
    }

    pub fn inspect(&self, name: &str, detail_level: u8) -> InspectResult {
        let qualified = qualify(name, &self.default_namespace);
        let Some(doc) = self.registry.documentation(&qualified) else {
            tracing::debug!(name = %qualified, "inspect miss");
            return InspectResult::default();
        };
        let mut data = MimeBundle::new();
        data.set(TEXT_PLAIN, self.renderer.text(doc, detail_level));
        data.set(TEXT_HTML, self.renderer.html(doc));
        InspectResult { found: true, data }
    }
}
