//! Purpose: Describe the external evaluation engine and its streamed side-output.
//! Exports: `EvaluationEngine`, `EngineResult`, `OutputSink`, `RawOutput`, `StreamedOutputEvent`.
//! Role: Seam between the execution coordinator and whatever engine backs the kernel.
//! Invariants: Streamed output is classified as exactly `Message` or `Print`.
//! Invariants: Any other output kind is a `Contract` error and is never recovered from.
use std::time::Duration;

use crate::core::channel::StreamName;
use crate::core::error::{Error, ErrorKind};

pub const OUTPUT_KIND_MESSAGE: &str = "message";
pub const OUTPUT_KIND_PRINT: &str = "print";

/// One evaluated input line as reported by the engine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EngineResult {
    pub line_no: u64,
    /// Rendered markup; `None` when the line produced no displayable result.
    pub markup: Option<String>,
}

/// Side-output as the engine emits it, before classification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawOutput {
    pub kind: String,
    pub symbol: Option<String>,
    pub tag: Option<String>,
    pub text: String,
}

impl RawOutput {
    pub fn message(
        symbol: impl Into<String>,
        tag: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            kind: OUTPUT_KIND_MESSAGE.to_string(),
            symbol: Some(symbol.into()),
            tag: Some(tag.into()),
            text: text.into(),
        }
    }

    pub fn print(text: impl Into<String>) -> Self {
        Self {
            kind: OUTPUT_KIND_PRINT.to_string(),
            symbol: None,
            tag: None,
            text: text.into(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StreamedOutputEvent {
    Message {
        symbol: String,
        tag: String,
        text: String,
    },
    Print {
        text: String,
    },
}

impl StreamedOutputEvent {
    pub fn classify(raw: RawOutput) -> Result<Self, Error> {
        match raw.kind.as_str() {
            OUTPUT_KIND_MESSAGE => match (raw.symbol, raw.tag) {
                (Some(symbol), Some(tag)) => Ok(StreamedOutputEvent::Message {
                    symbol,
                    tag,
                    text: raw.text,
                }),
                _ => Err(Error::new(ErrorKind::Contract)
                    .with_message("message output is missing its symbol or tag")),
            },
            OUTPUT_KIND_PRINT => Ok(StreamedOutputEvent::Print { text: raw.text }),
            other => Err(Error::new(ErrorKind::Contract)
                .with_message(format!("unknown streamed output kind `{other}`"))
                .with_hint("The evaluation engine may only emit message or print output.")),
        }
    }

    pub fn stream(&self) -> StreamName {
        match self {
            StreamedOutputEvent::Message { .. } => StreamName::Stderr,
            StreamedOutputEvent::Print { .. } => StreamName::Stdout,
        }
    }

    pub fn render(&self) -> String {
        match self {
            StreamedOutputEvent::Message { symbol, tag, text } => {
                format!("{symbol}::{tag}: {text}\n")
            }
            StreamedOutputEvent::Print { text } => format!("{text}\n"),
        }
    }
}

/// Receives side-output while an evaluation is running.
///
/// An `Err` return tells the engine to stop; the coordinator decides what it means.
pub trait OutputSink {
    fn emit(&mut self, output: RawOutput) -> Result<(), Error>;
}

/// The external engine that parses and evaluates code against a persistent environment.
pub trait EvaluationEngine {
    type Environment;
    type Evaluation;

    fn new_environment(&mut self) -> Result<Self::Environment, Error>;

    /// Build an evaluation for `code`. Failure here is reported to the client.
    fn prepare(
        &mut self,
        code: &str,
        environment: &mut Self::Environment,
        timeout: Duration,
    ) -> Result<Self::Evaluation, Error>;

    /// Run to completion (or timeout), streaming side-output into `sink` as it happens.
    fn run(
        &mut self,
        evaluation: Self::Evaluation,
        environment: &mut Self::Environment,
        sink: &mut dyn OutputSink,
    ) -> Result<Vec<EngineResult>, Error>;

    fn current_line(&self, environment: &Self::Environment) -> u64;

    fn reset_line(&mut self, environment: &mut Self::Environment);
}
