//! Purpose: Loopback evaluation engine for protocol conformance runs and tests.
//! Exports: `EchoEngine`, `EchoEnvironment`, `EchoEvaluation`.
//! Role: Stands in for the external symbolic engine behind `imathics serve`.
//! Invariants: Each non-blank input line advances the line counter by one.
//! Invariants: `Print[...]` lines stream their argument to stdout and yield no result.
//! Invariants: Structurally invalid input fails at construction, before any line is counted.
use std::time::{Duration, Instant};

use crate::core::completeness::{self, CompletenessVerdict};
use crate::core::engine::{EngineResult, EvaluationEngine, OutputSink, RawOutput};
use crate::core::error::{Error, ErrorKind};

const PRINT_PREFIX: &str = "Print[";

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EchoEnvironment {
    line: u64,
}

#[derive(Clone, Debug)]
pub struct EchoEvaluation {
    lines: Vec<String>,
    /// `None` when the timeout reaches past what `Instant` can represent.
    deadline: Option<Instant>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EchoEngine;

impl EvaluationEngine for EchoEngine {
    type Environment = EchoEnvironment;
    type Evaluation = EchoEvaluation;

    fn new_environment(&mut self) -> Result<EchoEnvironment, Error> {
        Ok(EchoEnvironment::default())
    }

    fn prepare(
        &mut self,
        code: &str,
        _environment: &mut EchoEnvironment,
        timeout: Duration,
    ) -> Result<EchoEvaluation, Error> {
        if completeness::check(code) == CompletenessVerdict::Invalid {
            return Err(Error::new(ErrorKind::Engine)
                .with_message("Syntax::bktmcp: input has mismatched brackets"));
        }
        Ok(EchoEvaluation {
            lines: code
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            deadline: Instant::now().checked_add(timeout),
        })
    }

    fn run(
        &mut self,
        evaluation: EchoEvaluation,
        environment: &mut EchoEnvironment,
        sink: &mut dyn OutputSink,
    ) -> Result<Vec<EngineResult>, Error> {
        let mut results = Vec::with_capacity(evaluation.lines.len());
        for line in evaluation.lines {
            if evaluation
                .deadline
                .is_some_and(|deadline| Instant::now() > deadline)
            {
                return Err(Error::new(ErrorKind::Engine).with_message("evaluation timed out"));
            }
            environment.line += 1;
            let markup = match print_argument(&line) {
                Some(text) => {
                    sink.emit(RawOutput::print(text))?;
                    None
                }
                None => Some(format!(
                    "<math><mtext>{}</mtext></math>",
                    html_escape::encode_text(&line)
                )),
            };
            results.push(EngineResult {
                line_no: environment.line,
                markup,
            });
        }
        Ok(results)
    }

    fn current_line(&self, environment: &EchoEnvironment) -> u64 {
        environment.line
    }

    fn reset_line(&mut self, environment: &mut EchoEnvironment) {
        environment.line = 0;
    }
}

fn print_argument(line: &str) -> Option<&str> {
    let inner = line.strip_prefix(PRINT_PREFIX)?.strip_suffix(']')?;
    Some(
        inner
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
            .unwrap_or(inner),
    )
}
