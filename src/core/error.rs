//! Purpose: Crate-wide error model shared by the kernel core, protocol, and CLI.
//! Exports: `Error`, `ErrorKind`, `to_exit_code`, `format_traceback`.
//! Role: One error type with a stable kind plus optional message/hint/source.
//! Invariants: Exit codes per kind are stable once published.
//! Invariants: `Contract` is reserved for broken collaborator contracts and is fatal.
use std::error::Error as StdError;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    NotFound,
    Io,
    Engine,
    Contract,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Contract
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::Io => 4,
        ErrorKind::Engine => 5,
        ErrorKind::Contract => 6,
    }
}

/// Render an error and its `source()` chain as traceback lines, outermost first.
///
/// Every line ends with a newline so the lines can be concatenated verbatim by
/// front-ends that join tracebacks without a separator.
pub fn format_traceback(err: &(dyn StdError + 'static)) -> Vec<String> {
    let mut lines = vec![format!("{err}\n")];
    let mut current = err.source();
    while let Some(cause) = current {
        lines.push(format!("Caused by: {cause}\n"));
        current = cause.source();
    }
    lines
}
