use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::domain::StepOutcome;
use crate::core::traits::sandbox::{Sandbox, SandboxError, StepInvocation};

/// Answers every step with the same outcome after a fixed delay.
#[derive(Debug)]
pub struct SandboxStub {
    result: Result<StepOutcome, SandboxError>,
    delay: Duration,
    calls: AtomicUsize,
}

impl SandboxStub {
    pub fn new(result: Result<StepOutcome, SandboxError>, delay: Duration) -> Self {
        Self {
            result,
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn succeeding(stdout: &str, delay: Duration) -> Self {
        Self::new(
            Ok(StepOutcome {
                stdout: stdout.to_string(),
                exit_code: Some(0),
                ..StepOutcome::default()
            }),
            delay,
        )
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Sandbox for SandboxStub {
    #[tracing::instrument(skip(self, cancel))]
    async fn run_step(
        &self,
        invocation: &StepInvocation,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, SandboxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
            _ = tokio::time::sleep(self.delay) => {}
        }
        tracing::debug!("Step result: {:?}", self.result);

        self.result.clone()
    }
}
