//! Purpose: Hold top-level CLI command dispatch for `imathics`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Only `serve` touches stdin; every other command prints one JSON value.

use super::*;

use std::time::Duration;

use imathics::core::completeness;
use imathics::core::execute::ClientInitPayload;
use imathics::core::inspect::{PlainDocRenderer, StaticRegistry};
use imathics::engine_echo::EchoEngine;
use imathics::kernel::{KernelConfig, MathicsKernel};
use imathics::kernel_stdio;
use imathics::protocol::{KernelDispatcher, KernelInfo};

pub(super) fn dispatch_command(command: Command) -> Result<RunOutcome, Error> {
    match command {
        Command::Serve {
            timeout_secs,
            default_namespace,
            builtins,
            no_client_init,
        } => {
            let registry = match builtins {
                Some(path) => StaticRegistry::from_json_file(&path)?,
                None => StaticRegistry::new(),
            };
            tracing::info!(builtins = registry.len(), "loaded builtin registry");
            let config = KernelConfig {
                timeout: Duration::from_secs(timeout_secs),
                default_namespace,
                client_init: (!no_client_init).then(ClientInitPayload::default),
            };
            let kernel = MathicsKernel::new(EchoEngine, registry, PlainDocRenderer, config)?;
            let mut dispatcher = KernelDispatcher::new(kernel);
            kernel_stdio::serve(&mut dispatcher)?;
            Ok(RunOutcome::ok())
        }
        Command::IsComplete { code } => {
            let verdict = completeness::check(&code);
            let value = serde_json::to_value(verdict).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode verdict")
                    .with_source(err)
            })?;
            emit_json(value);
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            let info = KernelInfo::default();
            emit_json(json!({
                "name": info.implementation,
                "version": info.implementation_version,
                "protocol_version": info.protocol_version,
            }));
            Ok(RunOutcome::ok())
        }
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "imathics", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
    }
}
