//! Purpose: Drive one execute request end-to-end against the evaluation engine.
//! Exports: `ExecutionCoordinator`, `ExecutionRequest`, `ExecutionReply`, `ExecutionOutcome`,
//! `ResultItem`, `ClientInitPayload`.
//! Role: Owns the session; the only place session state changes after start-up.
//! Invariants: The client init payload precedes any evaluation; the session is marked
//! Initialized only after it was published.
//! Invariants: Streamed output is forwarded as it happens and always precedes result messages.
//! Invariants: Construction/run failures are reported in the reply; the session continues.
//! Invariants: A `Contract` error (unknown streamed-output kind) is returned as `Err` and is fatal.
use std::time::Duration;

use crate::core::channel::{OutputMessage, Publisher};
use crate::core::engine::{EvaluationEngine, OutputSink, RawOutput, StreamedOutputEvent};
use crate::core::error::{Error, ErrorKind, format_traceback};
use crate::core::mime::{Displayable, MarkupResult, Repr, ReprKind, format_bundle, rewrite_markup};
use crate::core::session::{ClientState, Session};

/// `ename` reported when an evaluation cannot be constructed or run.
pub const SYSTEM_EXCEPTION: &str = "System:exception";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const MATH_RENDERER_CONFIG: &str = r#"MathJax.Hub.Config({jax: ["input/TeX","input/MathML","input/AsciiMath","output/HTML-CSS","output/NativeMML",
"output/PreviewHTML"],extensions: ["tex2jax.js","mml2jax.js","asciimath2jax.js","MathMenu.js","MathZoom.js",
"fast-preview.js", "AssistiveMML.js"],TeX: { extensions: ["AMSmath.js","AMSsymbols.js","noErrors.js",
"noUndefined.js"]}});"#;
const MATH_RENDERER_URL: &str = "https://cdn.mathjax.org/mathjax/latest/MathJax.js";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecutionRequest {
    pub code: String,
    pub silent: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExecutionStatus {
    Ok,
    Error,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecutionError {
    pub name: String,
    pub value: String,
    pub traceback: Vec<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecutionReply {
    pub status: ExecutionStatus,
    pub execution_count: u64,
    pub error: Option<ExecutionError>,
}

impl ExecutionReply {
    fn ok(execution_count: u64) -> Self {
        Self {
            status: ExecutionStatus::Ok,
            execution_count,
            error: None,
        }
    }

    fn failed(execution_count: u64, err: &Error) -> Self {
        Self {
            status: ExecutionStatus::Error,
            execution_count,
            error: Some(ExecutionError {
                name: SYSTEM_EXCEPTION.to_string(),
                value: err.message().unwrap_or("evaluation failed").to_string(),
                traceback: format_traceback(err),
            }),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResultItem {
    pub line_no: u64,
    pub rendered_markup: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecutionOutcome {
    pub reply: ExecutionReply,
    pub results: Vec<ResultItem>,
    pub events: Vec<StreamedOutputEvent>,
}

/// Script plus the library it needs, sent once to configure client-side math rendering.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientInitPayload {
    pub script: String,
    pub library_url: String,
}

impl Default for ClientInitPayload {
    fn default() -> Self {
        Self {
            script: MATH_RENDERER_CONFIG.to_string(),
            library_url: MATH_RENDERER_URL.to_string(),
        }
    }
}

impl Displayable for ClientInitPayload {
    fn plain_text(&self) -> String {
        format!("<client init script: {}>", self.library_url)
    }

    fn represent(&self, kind: ReprKind) -> Option<Result<Repr, Error>> {
        match kind {
            ReprKind::Javascript => Some(Ok(Repr::Text(format!(
                "$.getScript(\"{}\", function () {{\n{}}});\n",
                self.library_url, self.script
            )))),
            _ => None,
        }
    }
}

pub struct ExecutionCoordinator<E: EvaluationEngine> {
    engine: E,
    session: Session<E::Environment>,
    timeout: Duration,
    client_init: Option<ClientInitPayload>,
}

impl<E: EvaluationEngine> ExecutionCoordinator<E> {
    /// Start a session: fresh environment with the engine's line counter reset to zero.
    pub fn start(mut engine: E) -> Result<Self, Error> {
        let mut environment = engine.new_environment()?;
        engine.reset_line(&mut environment);
        let mut session = Session::new(environment);
        session.reset_line();
        Ok(Self {
            engine,
            session,
            timeout: DEFAULT_TIMEOUT,
            client_init: Some(ClientInitPayload::default()),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the one-time client payload; `None` skips it (the lifecycle still advances).
    pub fn with_client_init(mut self, payload: Option<ClientInitPayload>) -> Self {
        self.client_init = payload;
        self
    }

    pub fn session(&self) -> &Session<E::Environment> {
        &self.session
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn execute(
        &mut self,
        request: &ExecutionRequest,
        publisher: &mut dyn Publisher,
    ) -> Result<ExecutionOutcome, Error> {
        if self.session.client_state() == ClientState::Uninitialized {
            if let Some(payload) = &self.client_init {
                tracing::debug!("publishing client init payload");
                publisher.publish(OutputMessage::DisplayData {
                    data: format_bundle(payload),
                })?;
            }
            self.session.mark_client_initialized();
        }

        let prepared =
            self.engine
                .prepare(&request.code, self.session.environment_mut(), self.timeout);
        let evaluation = match prepared {
            Ok(evaluation) => evaluation,
            Err(err) => return self.report_failure(err, Vec::new()),
        };

        let mut sink = ForwardingSink::new(&mut *publisher);
        let run = self
            .engine
            .run(evaluation, self.session.environment_mut(), &mut sink);
        let ForwardingSink {
            events, violation, ..
        } = sink;
        if let Some(err) = violation {
            tracing::error!(error = %err, "evaluation engine broke the output contract");
            return Err(err);
        }
        let results = match run {
            Ok(results) => results,
            Err(err) => return self.report_failure(err, events),
        };

        let line = self.engine.current_line(self.session.environment());
        self.session.advance_line(line);

        let mut items = Vec::new();
        if !request.silent {
            for result in results {
                let Some(markup) = result.markup.filter(|markup| !markup.is_empty()) else {
                    continue;
                };
                let item = ResultItem {
                    line_no: result.line_no,
                    rendered_markup: rewrite_markup(&markup),
                };
                publisher.publish(OutputMessage::ExecuteResult {
                    execution_count: item.line_no,
                    data: format_bundle(&MarkupResult {
                        raw: &markup,
                        rewritten: &item.rendered_markup,
                    }),
                })?;
                items.push(item);
            }
        }

        Ok(ExecutionOutcome {
            reply: ExecutionReply::ok(self.session.current_line()),
            results: items,
            events,
        })
    }

    fn report_failure(
        &self,
        err: Error,
        events: Vec<StreamedOutputEvent>,
    ) -> Result<ExecutionOutcome, Error> {
        if err.is_fatal() {
            return Err(err);
        }
        tracing::warn!(error = %err, "evaluation failed");
        Ok(ExecutionOutcome {
            reply: ExecutionReply::failed(self.session.current_line(), &err),
            results: Vec::new(),
            events,
        })
    }
}

/// Classifies engine output and forwards it to the publisher in emission order.
struct ForwardingSink<'a> {
    publisher: &'a mut dyn Publisher,
    events: Vec<StreamedOutputEvent>,
    violation: Option<Error>,
}

impl<'a> ForwardingSink<'a> {
    fn new(publisher: &'a mut dyn Publisher) -> Self {
        Self {
            publisher,
            events: Vec::new(),
            violation: None,
        }
    }
}

impl OutputSink for ForwardingSink<'_> {
    fn emit(&mut self, output: RawOutput) -> Result<(), Error> {
        if self.violation.is_some() {
            return Err(Error::new(ErrorKind::Contract).with_message("output sink is closed"));
        }
        let event = match StreamedOutputEvent::classify(output) {
            Ok(event) => event,
            Err(err) => {
                let message = err.message().unwrap_or("invalid streamed output").to_string();
                self.violation = Some(err);
                return Err(Error::new(ErrorKind::Contract).with_message(message));
            }
        };
        self.publisher.publish(OutputMessage::Stream {
            name: event.stream(),
            text: event.render(),
        })?;
        self.events.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::StreamName;
    use crate::core::engine::EngineResult;
    use crate::core::mime::{GRAPHICS_CLOSE_TAG, GRAPHICS_OPEN_TAG, TEXT_HTML, TEXT_PLAIN};
    use std::collections::VecDeque;
    use std::io;

    /// Scripted engine: each `run` pops one step.
    #[derive(Default)]
    struct ScriptedEngine {
        steps: VecDeque<Step>,
        prepared: Vec<(String, Duration)>,
        resets: usize,
    }

    enum Step {
        FailPrepare(&'static str),
        Run {
            outputs: Vec<RawOutput>,
            results: Vec<EngineResult>,
            advance: u64,
        },
        FailRun(&'static str),
    }

    #[derive(Default)]
    struct Env {
        line: u64,
    }

    impl EvaluationEngine for ScriptedEngine {
        type Environment = Env;
        type Evaluation = Step;

        fn new_environment(&mut self) -> Result<Env, Error> {
            Ok(Env { line: 42 })
        }

        fn prepare(
            &mut self,
            code: &str,
            _environment: &mut Env,
            timeout: Duration,
        ) -> Result<Step, Error> {
            self.prepared.push((code.to_string(), timeout));
            match self.steps.pop_front().expect("scripted step") {
                Step::FailPrepare(message) => Err(Error::new(ErrorKind::Engine)
                    .with_message(message)
                    .with_source(io::Error::other("parser state lost"))),
                step => Ok(step),
            }
        }

        fn run(
            &mut self,
            evaluation: Step,
            environment: &mut Env,
            sink: &mut dyn OutputSink,
        ) -> Result<Vec<EngineResult>, Error> {
            match evaluation {
                Step::Run {
                    outputs,
                    results,
                    advance,
                } => {
                    for output in outputs {
                        sink.emit(output)?;
                    }
                    environment.line += advance;
                    Ok(results)
                }
                Step::FailRun(message) => {
                    Err(Error::new(ErrorKind::Engine).with_message(message))
                }
                Step::FailPrepare(_) => unreachable!("prepare already failed"),
            }
        }

        fn current_line(&self, environment: &Env) -> u64 {
            environment.line
        }

        fn reset_line(&mut self, environment: &mut Env) {
            self.resets += 1;
            environment.line = 0;
        }
    }

    fn result(line_no: u64, markup: Option<&str>) -> EngineResult {
        EngineResult {
            line_no,
            markup: markup.map(str::to_string),
        }
    }

    fn request(code: &str) -> ExecutionRequest {
        ExecutionRequest {
            code: code.to_string(),
            silent: false,
        }
    }

    fn coordinator(steps: Vec<Step>) -> ExecutionCoordinator<ScriptedEngine> {
        let engine = ScriptedEngine {
            steps: steps.into(),
            ..ScriptedEngine::default()
        };
        ExecutionCoordinator::start(engine).expect("start")
    }

    #[test]
    fn start_resets_the_engine_line_counter() {
        let coordinator = coordinator(Vec::new());
        assert_eq!(coordinator.engine().resets, 1);
        assert_eq!(coordinator.session().current_line(), 0);
        assert_eq!(coordinator.session().environment().line, 0);
    }

    #[test]
    fn client_init_is_published_once_before_anything_else() {
        let mut coordinator = coordinator(vec![
            Step::Run {
                outputs: vec![RawOutput::print("a")],
                results: vec![],
                advance: 1,
            },
            Step::Run {
                outputs: vec![],
                results: vec![],
                advance: 1,
            },
        ]);
        let mut published = Vec::new();
        coordinator
            .execute(&request("Print[a]"), &mut published)
            .expect("first");
        coordinator
            .execute(&request("1"), &mut published)
            .expect("second");

        let displays = published
            .iter()
            .filter(|message| matches!(message, OutputMessage::DisplayData { .. }))
            .count();
        assert_eq!(displays, 1);
        let OutputMessage::DisplayData { data } = &published[0] else {
            panic!("expected init payload first, got {:?}", published[0]);
        };
        let script = data.get("application/javascript").expect("javascript");
        assert!(script.contains("MathJax.Hub.Config"));
        assert!(script.contains("MathJax.js"));
    }

    /// Rejects the first `failures` messages, then records the rest.
    struct FlakyPublisher {
        failures: usize,
        published: Vec<OutputMessage>,
    }

    impl Publisher for FlakyPublisher {
        fn publish(&mut self, message: OutputMessage) -> Result<(), Error> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(Error::new(ErrorKind::Io).with_message("front-end went away"));
            }
            self.published.push(message);
            Ok(())
        }
    }

    #[test]
    fn failed_client_init_publish_is_retried_on_next_execute() {
        let mut coordinator = coordinator(vec![Step::Run {
            outputs: vec![],
            results: vec![],
            advance: 1,
        }]);
        let mut publisher = FlakyPublisher {
            failures: 1,
            published: Vec::new(),
        };
        let err = coordinator
            .execute(&request("1"), &mut publisher)
            .expect_err("publish failure");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(
            coordinator.session().client_state(),
            ClientState::Uninitialized
        );

        coordinator
            .execute(&request("1"), &mut publisher)
            .expect("retry");
        assert!(matches!(
            publisher.published.first(),
            Some(OutputMessage::DisplayData { .. })
        ));
        assert_eq!(
            coordinator.session().client_state(),
            ClientState::Initialized
        );
    }

    #[test]
    fn disabled_client_init_still_transitions_lifecycle() {
        let mut coordinator = coordinator(vec![Step::Run {
            outputs: vec![],
            results: vec![],
            advance: 1,
        }])
        .with_client_init(None);
        let mut published = Vec::new();
        coordinator
            .execute(&request("1"), &mut published)
            .expect("execute");
        assert!(published.is_empty());
        assert_eq!(
            coordinator.session().client_state(),
            ClientState::Initialized
        );
    }

    #[test]
    fn streamed_output_precedes_results_in_emission_order() {
        let mut coordinator = coordinator(vec![Step::Run {
            outputs: vec![
                RawOutput::print("first"),
                RawOutput::message("Power", "infy", "Infinite expression."),
                RawOutput::print("second"),
            ],
            results: vec![result(1, Some("<math><mn>1</mn></math>"))],
            advance: 1,
        }])
        .with_client_init(None);
        let mut published = Vec::new();
        let outcome = coordinator
            .execute(&request("x"), &mut published)
            .expect("execute");

        assert_eq!(
            published[..3],
            [
                OutputMessage::Stream {
                    name: StreamName::Stdout,
                    text: "first\n".to_string(),
                },
                OutputMessage::Stream {
                    name: StreamName::Stderr,
                    text: "Power::infy: Infinite expression.\n".to_string(),
                },
                OutputMessage::Stream {
                    name: StreamName::Stdout,
                    text: "second\n".to_string(),
                },
            ]
        );
        assert!(matches!(
            published[3],
            OutputMessage::ExecuteResult {
                execution_count: 1,
                ..
            }
        ));
        assert_eq!(outcome.events.len(), 3);
        assert_eq!(outcome.results.len(), 1);
    }

    #[test]
    fn results_are_rewritten_and_empty_ones_dropped() {
        let markup = format!("<math>{GRAPHICS_OPEN_TAG}><g/>{GRAPHICS_CLOSE_TAG}</math>");
        let mut coordinator = coordinator(vec![Step::Run {
            outputs: vec![],
            results: vec![
                result(1, Some(&markup)),
                result(2, None),
                result(3, Some("")),
                result(4, Some("<math><mi>y</mi></math>")),
            ],
            advance: 4,
        }])
        .with_client_init(None);
        let mut published = Vec::new();
        let outcome = coordinator
            .execute(&request("a\nb\nc\nd"), &mut published)
            .expect("execute");

        assert_eq!(
            outcome
                .results
                .iter()
                .map(|item| item.line_no)
                .collect::<Vec<_>>(),
            vec![1, 4]
        );
        assert_eq!(outcome.results[0].rendered_markup, rewrite_markup(&markup));
        let OutputMessage::ExecuteResult { data, .. } = &published[0] else {
            panic!("expected execute_result");
        };
        assert_eq!(data.get(TEXT_HTML), Some(rewrite_markup(&markup).as_str()));
        assert_eq!(data.get(TEXT_PLAIN), Some(markup.as_str()));
    }

    #[test]
    fn silent_execution_advances_state_without_results() {
        let mut coordinator = coordinator(vec![Step::Run {
            outputs: vec![RawOutput::print("still streamed")],
            results: vec![result(1, Some("<math/>"))],
            advance: 1,
        }])
        .with_client_init(None);
        let mut published = Vec::new();
        let outcome = coordinator
            .execute(
                &ExecutionRequest {
                    code: "x = 1".to_string(),
                    silent: true,
                },
                &mut published,
            )
            .expect("execute");
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.reply.execution_count, 1);
        assert_eq!(published.len(), 1);
        assert!(matches!(published[0], OutputMessage::Stream { .. }));
    }

    #[test]
    fn execution_count_follows_engine_line_advancement() {
        let mut coordinator = coordinator(vec![
            Step::Run {
                outputs: vec![],
                results: vec![result(1, Some("a")), result(2, Some("b"))],
                advance: 2,
            },
            Step::Run {
                outputs: vec![],
                results: vec![result(3, Some("c"))],
                advance: 1,
            },
        ])
        .with_client_init(None);
        let mut published = Vec::new();
        let first = coordinator
            .execute(&request("a\nb"), &mut published)
            .expect("first");
        let second = coordinator
            .execute(&request("c"), &mut published)
            .expect("second");
        assert_eq!(first.reply, ExecutionReply::ok(2));
        assert_eq!(second.reply, ExecutionReply::ok(3));
        assert!(second.reply.execution_count >= first.reply.execution_count);
    }

    #[test]
    fn construction_failure_is_reported_and_session_continues() {
        let mut coordinator = coordinator(vec![
            Step::FailPrepare("could not build evaluation"),
            Step::Run {
                outputs: vec![],
                results: vec![result(1, Some("ok"))],
                advance: 1,
            },
        ])
        .with_client_init(None);
        let mut published = Vec::new();
        let failed = coordinator
            .execute(&request("f["), &mut published)
            .expect("reported, not escalated");
        assert_eq!(failed.reply.status, ExecutionStatus::Error);
        assert_eq!(failed.reply.execution_count, 0);
        let error = failed.reply.error.expect("error details");
        assert_eq!(error.name, SYSTEM_EXCEPTION);
        assert_eq!(error.value, "could not build evaluation");
        assert_eq!(
            error.traceback,
            vec![
                "Engine: could not build evaluation\n".to_string(),
                "Caused by: parser state lost\n".to_string(),
            ]
        );
        assert!(published.is_empty());

        let next = coordinator
            .execute(&request("1"), &mut published)
            .expect("next execute");
        assert_eq!(next.reply, ExecutionReply::ok(1));
    }

    #[test]
    fn run_failure_is_reported() {
        let mut coordinator =
            coordinator(vec![Step::FailRun("timed out")]).with_client_init(None);
        let mut published = Vec::new();
        let outcome = coordinator
            .execute(&request("While[True]"), &mut published)
            .expect("reported");
        assert_eq!(outcome.reply.status, ExecutionStatus::Error);
        assert_eq!(
            outcome.reply.error.map(|error| error.value),
            Some("timed out".to_string())
        );
    }

    #[test]
    fn unknown_output_kind_is_fatal() {
        let mut coordinator = coordinator(vec![Step::Run {
            outputs: vec![
                RawOutput::print("before"),
                RawOutput {
                    kind: "graphics".to_string(),
                    symbol: None,
                    tag: None,
                    text: String::new(),
                },
            ],
            results: vec![result(1, Some("never shown"))],
            advance: 1,
        }])
        .with_client_init(None);
        let mut published = Vec::new();
        let err = coordinator
            .execute(&request("x"), &mut published)
            .expect_err("fatal");
        assert_eq!(err.kind(), ErrorKind::Contract);
        assert!(err.message().expect("message").contains("graphics"));
        assert_eq!(published.len(), 1);
        assert_eq!(coordinator.session().current_line(), 0);
    }

    #[test]
    fn configured_timeout_reaches_the_engine() {
        let mut coordinator = coordinator(vec![Step::Run {
            outputs: vec![],
            results: vec![],
            advance: 0,
        }])
        .with_timeout(Duration::from_secs(3))
        .with_client_init(None);
        let mut published = Vec::new();
        coordinator
            .execute(&request("1"), &mut published)
            .expect("execute");
        assert_eq!(
            coordinator.engine().prepared,
            vec![("1".to_string(), Duration::from_secs(3))]
        );
    }
}
