//! Purpose: `imathics` CLI entry point.
//! Role: Binary crate root; parses args, installs logging, runs commands.
//! Invariants: `serve` keeps stdout protocol-only; diagnostics and logs go to stderr.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `to_exit_code`.
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

use imathics::core::error::{Error, ErrorKind, to_exit_code};

mod command_dispatch;

const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse_from(std::env::args_os().collect::<Vec<OsString>>()) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `imathics --help`."));
            }
        },
    };

    init_tracing();

    command_dispatch::dispatch_command(cli.command)
        .map_err(add_io_hint)
        .map_err(add_contract_hint)
        .map_err(add_internal_hint)
}

#[derive(Parser)]
#[command(
    name = "imathics",
    version,
    about = "Notebook kernel adapter for a symbolic-computation engine",
    long_about = r#"Notebook kernel adapter for a symbolic-computation engine.

Speaks the notebook messaging protocol as newline-delimited JSON envelopes on
stdin/stdout. Logs go to stderr; set RUST_LOG to adjust verbosity."#,
    after_help = r#"EXAMPLES
  $ imathics serve --builtins builtins.json
  $ imathics is-complete 'f[x'

LEARN MORE
  $ imathics <command> --help"#,
    arg_required_else_help = true,
    disable_help_subcommand = false
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Run the kernel over stdio",
        long_about = r#"Run the kernel over stdio.

Reads one JSON request envelope per line from stdin and writes one JSON line per
outgoing message to stdout, tagged with its channel ("shell" or "iopub").
Exits on stdin EOF or after answering a shutdown_request."#,
        after_help = r#"EXAMPLES
  $ echo '{"header":{"msg_id":"1","msg_type":"kernel_info_request"}}' | imathics serve
  $ imathics serve --timeout-secs 30 --default-namespace 'Global`'
  $ imathics serve --builtins builtins.json --no-client-init

NOTES
  - --builtins takes a JSON object mapping qualified names to doc strings
  - Unqualified inspect names are resolved in --default-namespace"#
    )]
    Serve {
        #[arg(
            long,
            default_value_t = 10,
            value_name = "SECS",
            help = "Evaluation timeout handed to the engine"
        )]
        timeout_secs: u64,
        #[arg(
            long,
            default_value = "System`",
            value_name = "NS",
            help = "Namespace used to qualify unqualified inspect names"
        )]
        default_namespace: String,
        #[arg(
            long,
            value_name = "FILE",
            value_hint = ValueHint::FilePath,
            help = "JSON file of builtin documentation for inspect requests"
        )]
        builtins: Option<PathBuf>,
        #[arg(long, help = "Skip the one-time client initialization payload")]
        no_client_init: bool,
    },
    #[command(
        arg_required_else_help = true,
        about = "Check whether code is ready to submit",
        long_about = r#"Check whether code is ready to submit.

Prints the is_complete_reply content as JSON: complete, incomplete (with an
indent hint), or invalid."#,
        after_help = r#"EXAMPLES
  $ imathics is-complete 'f[x]'
  $ imathics is-complete 'Plus[1,'"#
    )]
    IsComplete {
        #[arg(help = "Code to check")]
        code: String,
    },
    #[command(about = "Print version info")]
    Version,
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ imathics completion bash > ~/.local/share/bash-completion/completions/imathics
  $ imathics completion zsh > ~/.zfunc/_imathics"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn add_io_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Io || err.hint().is_some() {
        return err;
    }
    err.with_hint("I/O error. Check the path and that stdin/stdout are still open.")
}

fn add_contract_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Contract || err.hint().is_some() {
        return err;
    }
    err.with_hint("The evaluation engine emitted output the kernel cannot classify; restart it.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_LOG=debug and share the log if it persists.",
    )
}

fn emit_json(value: Value) {
    let encoded = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    };
    let json = encoded.unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Engine => "evaluation engine error".to_string(),
        ErrorKind::Contract => "engine contract violation".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }
    json!({ "error": Value::Object(inner) })
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
