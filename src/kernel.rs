//! Purpose: The kernel handler wiring session, execution, completeness, and inspection together.
//! Exports: `MathicsKernel`, `KernelConfig`.
//! Role: Implements `KernelHandler` for the protocol dispatcher.
//! Invariants: One session per kernel instance; execute is the only mutating request.
use std::time::Duration;

use crate::core::channel::Publisher;
use crate::core::completeness::{self, CompletenessVerdict};
use crate::core::engine::EvaluationEngine;
use crate::core::error::Error;
use crate::core::execute::{
    ClientInitPayload, DEFAULT_TIMEOUT, ExecutionCoordinator, ExecutionReply, ExecutionRequest,
};
use crate::core::inspect::{
    BuiltinRegistry, DEFAULT_NAMESPACE, DocRenderer, InspectResult, InspectionService,
};
use crate::protocol::{KernelHandler, KernelInfo};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    pub timeout: Duration,
    pub default_namespace: String,
    pub client_init: Option<ClientInitPayload>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            default_namespace: DEFAULT_NAMESPACE.to_string(),
            client_init: Some(ClientInitPayload::default()),
        }
    }
}

pub struct MathicsKernel<E: EvaluationEngine, R, D> {
    coordinator: ExecutionCoordinator<E>,
    inspection: InspectionService<R, D>,
    info: KernelInfo,
}

impl<E, R, D> MathicsKernel<E, R, D>
where
    E: EvaluationEngine,
    R: BuiltinRegistry,
    D: DocRenderer,
{
    pub fn new(engine: E, registry: R, renderer: D, config: KernelConfig) -> Result<Self, Error> {
        let coordinator = ExecutionCoordinator::start(engine)?
            .with_timeout(config.timeout)
            .with_client_init(config.client_init);
        let inspection = InspectionService::new(registry, renderer)
            .with_default_namespace(config.default_namespace);
        tracing::info!(
            timeout_secs = config.timeout.as_secs(),
            "kernel session started"
        );
        Ok(Self {
            coordinator,
            inspection,
            info: KernelInfo::default(),
        })
    }

    pub fn coordinator(&self) -> &ExecutionCoordinator<E> {
        &self.coordinator
    }
}

impl<E, R, D> KernelHandler for MathicsKernel<E, R, D>
where
    E: EvaluationEngine,
    R: BuiltinRegistry,
    D: DocRenderer,
{
    fn kernel_info(&self) -> KernelInfo {
        self.info.clone()
    }

    fn execute(
        &mut self,
        request: ExecutionRequest,
        publisher: &mut dyn Publisher,
    ) -> Result<ExecutionReply, Error> {
        let outcome = self.coordinator.execute(&request, publisher)?;
        tracing::debug!(
            execution_count = outcome.reply.execution_count,
            results = outcome.results.len(),
            events = outcome.events.len(),
            "execute finished"
        );
        Ok(outcome.reply)
    }

    fn is_complete(&self, code: &str) -> CompletenessVerdict {
        completeness::check(code)
    }

    fn inspect(&self, name: &str, detail_level: u8) -> InspectResult {
        self.inspection.inspect(name, detail_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::OutputMessage;
    use crate::core::execute::ExecutionStatus;
    use crate::core::inspect::{PlainDocRenderer, StaticRegistry};
    use crate::core::mime::TEXT_PLAIN;
    use crate::engine_echo::EchoEngine;

    fn build_kernel(
        config: KernelConfig,
    ) -> MathicsKernel<EchoEngine, StaticRegistry, PlainDocRenderer> {
        let registry =
            StaticRegistry::new().with_entry("System`Sin", "Sin[z] gives the sine of z.");
        MathicsKernel::new(EchoEngine::default(), registry, PlainDocRenderer, config)
            .expect("kernel")
    }

    #[test]
    fn consecutive_executes_report_non_decreasing_counts() {
        let mut kernel = build_kernel(KernelConfig::default());
        let mut published = Vec::new();
        let first = kernel
            .execute(
                ExecutionRequest {
                    code: "a\nb".to_string(),
                    silent: false,
                },
                &mut published,
            )
            .expect("first");
        let second = kernel
            .execute(
                ExecutionRequest {
                    code: "c".to_string(),
                    silent: false,
                },
                &mut published,
            )
            .expect("second");
        assert_eq!(first.status, ExecutionStatus::Ok);
        assert_eq!(first.execution_count, 2);
        assert_eq!(second.execution_count, 3);
        let results = published
            .iter()
            .filter(|message| matches!(message, OutputMessage::ExecuteResult { .. }))
            .count();
        assert_eq!(results, 3);
    }

    #[test]
    fn out_of_range_timeout_still_executes() {
        let mut kernel = build_kernel(KernelConfig {
            timeout: Duration::from_secs(u64::MAX),
            ..KernelConfig::default()
        });
        let mut published = Vec::new();
        let reply = kernel
            .execute(
                ExecutionRequest {
                    code: "x".to_string(),
                    silent: false,
                },
                &mut published,
            )
            .expect("execute");
        assert_eq!(reply.status, ExecutionStatus::Ok);
        assert_eq!(reply.execution_count, 1);
    }

    #[test]
    fn inspect_uses_configured_namespace() {
        let kernel = build_kernel(KernelConfig::default());
        let result = kernel.inspect("Sin", 0);
        assert!(result.found);
        assert_eq!(result.data.get(TEXT_PLAIN), Some("Sin[z] gives the sine of z."));

        let kernel = build_kernel(KernelConfig {
            default_namespace: "Global`".to_string(),
            ..KernelConfig::default()
        });
        assert!(!kernel.inspect("Sin", 0).found);
        assert!(kernel.inspect("System`Sin", 0).found);
    }

    #[test]
    fn is_complete_delegates_to_checker() {
        let kernel = build_kernel(KernelConfig::default());
        assert_eq!(kernel.is_complete("f[x]"), CompletenessVerdict::Complete);
        assert_eq!(kernel.is_complete("f(x]"), CompletenessVerdict::Invalid);
    }
}
