//! Purpose: Turn displayable values into negotiated MIME bundles and rewrite result markup.
//! Exports: `MimeBundle`, `Displayable`, `ReprKind`, `Repr`, `format_bundle`, `rewrite_markup`.
//! Role: Shared formatter for execute results, the client init payload, and inspect replies.
//! Invariants: Bundles built by `format_bundle` always carry `text/plain`.
//! Invariants: A failing or empty representation is omitted; it never aborts the bundle.
//! Invariants: Binary payloads become UTF-8 text when valid, base64 text otherwise.
use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde_json::Value;

use crate::core::error::Error;

pub const TEXT_PLAIN: &str = "text/plain";
pub const TEXT_HTML: &str = "text/html";

/// Opening sequence the engine emits for an embedded graphic inside math markup.
pub const GRAPHICS_OPEN_TAG: &str = "<mtable><mtr><mtd><svg";
pub const GRAPHICS_OPEN_WRAPPED: &str =
    "<mtable><mtr><mtd><annotation-xml encoding=\"text/html\" ><svg";
pub const GRAPHICS_CLOSE_TAG: &str = "</svg></mtd></mtr></mtable>";
pub const GRAPHICS_CLOSE_WRAPPED: &str = "</svg></annotation-xml></mtd></mtr></mtable>";

/// Wrap embedded graphics in an `annotation-xml` boundary so math renderers leave them opaque.
///
/// One forward pass per tag; the result is not re-scanned.
pub fn rewrite_markup(markup: &str) -> String {
    markup
        .replace(GRAPHICS_OPEN_TAG, GRAPHICS_OPEN_WRAPPED)
        .replace(GRAPHICS_CLOSE_TAG, GRAPHICS_CLOSE_WRAPPED)
}

/// Representation kinds probed after `text/plain`, in probe order.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ReprKind {
    Png,
    Jpeg,
    Html,
    Markdown,
    Svg,
    Latex,
    Json,
    Javascript,
    Pdf,
}

impl ReprKind {
    pub const PROBE_ORDER: [ReprKind; 9] = [
        ReprKind::Png,
        ReprKind::Jpeg,
        ReprKind::Html,
        ReprKind::Markdown,
        ReprKind::Svg,
        ReprKind::Latex,
        ReprKind::Json,
        ReprKind::Javascript,
        ReprKind::Pdf,
    ];

    pub fn mimetype(self) -> &'static str {
        match self {
            ReprKind::Png => "image/png",
            ReprKind::Jpeg => "image/jpeg",
            ReprKind::Html => TEXT_HTML,
            ReprKind::Markdown => "text/markdown",
            ReprKind::Svg => "image/svg+xml",
            ReprKind::Latex => "text/latex",
            ReprKind::Json => "application/json",
            ReprKind::Javascript => "application/javascript",
            ReprKind::Pdf => "application/pdf",
        }
    }
}

/// Raw output of a representation producer.
#[derive(Clone, Debug, PartialEq)]
pub enum Repr {
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
}

impl Repr {
    fn is_empty(&self) -> bool {
        match self {
            Repr::Text(text) => text.is_empty(),
            Repr::Bytes(bytes) => bytes.is_empty(),
            Repr::Json(value) => json_is_falsy(value),
        }
    }

    fn into_text(self) -> String {
        match self {
            Repr::Text(text) => text,
            Repr::Bytes(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(err) => STANDARD.encode(err.into_bytes()),
            },
            Repr::Json(value) => value.to_string(),
        }
    }
}

fn json_is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::Number(number) => number.as_f64() == Some(0.0),
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

/// A value that can be shown to the front-end.
///
/// `plain_text` is mandatory; every other kind is an optional producer slot. Returning
/// `None` means the value has no producer for that kind; `Some(Err(_))` means the
/// producer exists but failed.
pub trait Displayable {
    fn plain_text(&self) -> String;

    fn represent(&self, kind: ReprKind) -> Option<Result<Repr, Error>> {
        let _ = kind;
        None
    }
}

/// Mimetype to representation text.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MimeBundle(BTreeMap<String, String>);

impl MimeBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `text` under `mimetype`, even when it is empty.
    pub fn set(&mut self, mimetype: impl Into<String>, text: impl Into<String>) {
        self.0.insert(mimetype.into(), text.into());
    }

    /// Insert `text` under `mimetype`, skipping empty text.
    pub fn insert(&mut self, mimetype: impl Into<String>, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        self.0.insert(mimetype.into(), text);
    }

    pub fn get(&self, mimetype: &str) -> Option<&str> {
        self.0.get(mimetype).map(String::as_str)
    }

    pub fn contains(&self, mimetype: &str) -> bool {
        self.0.contains_key(mimetype)
    }

    pub fn mimetypes(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(mimetype, text)| (mimetype.clone(), Value::String(text.clone())))
                .collect(),
        )
    }
}

pub fn format_bundle(value: &dyn Displayable) -> MimeBundle {
    let mut bundle = MimeBundle::new();
    bundle.set(TEXT_PLAIN, value.plain_text());

    for kind in ReprKind::PROBE_ORDER {
        let Some(produced) = value.represent(kind) else {
            continue;
        };
        match produced {
            Ok(repr) if repr.is_empty() => {}
            Ok(repr) => bundle.insert(kind.mimetype(), repr.into_text()),
            Err(err) => {
                tracing::debug!(mimetype = kind.mimetype(), error = %err, "representation failed");
            }
        }
    }
    bundle
}

/// Engine markup shown as an execute result.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MarkupResult<'a> {
    pub raw: &'a str,
    pub rewritten: &'a str,
}

impl Displayable for MarkupResult<'_> {
    fn plain_text(&self) -> String {
        self.raw.to_string()
    }

    fn represent(&self, kind: ReprKind) -> Option<Result<Repr, Error>> {
        match kind {
            ReprKind::Html => Some(Ok(Repr::Text(self.rewritten.to_string()))),
            _ => None,
        }
    }
}
