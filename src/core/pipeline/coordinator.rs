//! Entry point of the engine: admits requests, owns workspaces and drives the
//! compile and run steps of a profile through the sandbox.
//!
//! Resource order on every path: session claim, pool permit, workspace. They are
//! released in reverse, so a permit is only returned once its workspace is gone.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::Config;
use crate::core::domain::{
    ExecutionRequest, ExecutionResult, ExecutionState, ExecutionStatus, ResourceLimits, SessionId,
    StepOutcome,
};
use crate::core::errors::ExecuteError;
use crate::core::pipeline::sessions::{SessionClaim, SessionRegistry};
use crate::core::pipeline::steps;
use crate::core::registry::{LanguageProfile, LanguageRegistry};
use crate::core::traits::sandbox::{Sandbox, SandboxError};
use crate::native::workspace::{Workspace, WorkspaceManager};

#[derive(Debug)]
pub struct Coordinator {
    config: Config,
    registry: LanguageRegistry,
    workspaces: WorkspaceManager,
    sandbox: Arc<dyn Sandbox>,
    pool: Arc<Semaphore>,
    sessions: SessionRegistry,
}

impl Coordinator {
    pub fn new(config: Config, registry: LanguageRegistry, sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            workspaces: WorkspaceManager::new(&config.workspace_root),
            pool: Arc::new(Semaphore::new(config.max_concurrent_executions)),
            sessions: SessionRegistry::new(),
            config,
            registry,
            sandbox,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn available_slots(&self) -> usize {
        self.pool.available_permits()
    }

    /// State of the execution currently owned by `session`, if any.
    pub fn state(&self, session: &SessionId) -> Option<ExecutionState> {
        self.sessions.state(session)
    }

    /// Withdraws the queued or running execution of `session`. Its `submit`
    /// returns `ExecuteError::Cancelled` once the process tree is gone.
    pub fn cancel(&self, session: &SessionId) -> bool {
        let found = self.sessions.cancel(session);
        if found {
            tracing::info!("Cancelling execution of session {}", session);
        }
        found
    }

    #[tracing::instrument(
        skip(self, request),
        fields(session = %session, language = %request.language)
    )]
    pub async fn submit(
        &self,
        session: &SessionId,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, ExecuteError> {
        let started_at = Utc::now();
        let profile = self.registry.resolve(&request.language)?;
        if request.source.len() > self.config.max_source_bytes {
            return Err(ExecuteError::SourceTooLarge {
                size: request.source.len(),
                limit: self.config.max_source_bytes,
            });
        }
        let claim = self
            .sessions
            .claim(session)
            .ok_or_else(|| ExecuteError::AlreadyRunning(session.clone()))?;

        let result = match self.acquire_slot(&claim).await {
            Ok(permit) => {
                let limits = self.config.resolve_limits(&request.limits);
                tracing::debug!("Admitted with limits {:?}", limits);
                self.execute(profile, &request, &limits, &claim, permit, started_at)
                    .await
            }
            Err(e) => Err(e),
        };

        claim.set_state(match &result {
            Ok(result) if result.status() == ExecutionStatus::InternalError => {
                ExecutionState::Failed
            }
            Ok(_) => ExecutionState::Completed,
            Err(ExecuteError::Cancelled) => ExecutionState::Cancelled,
            Err(_) => ExecutionState::Failed,
        });
        match &result {
            Ok(result) => tracing::info!(
                "Execution finished: status={:?}, compile_ms={}, run_ms={}",
                result.status(),
                result.compile_duration_ms(),
                result.run_duration_ms()
            ),
            Err(e) => tracing::info!("Execution not completed: {}", e),
        }
        result
    }

    async fn acquire_slot(
        &self,
        claim: &SessionClaim,
    ) -> Result<OwnedSemaphorePermit, ExecuteError> {
        let wait = Duration::from_millis(self.config.queue_timeout_ms);
        let overloaded = ExecuteError::Overloaded {
            waited_ms: self.config.queue_timeout_ms,
        };

        tokio::select! {
            biased;
            _ = claim.cancel_token().cancelled() => Err(ExecuteError::Cancelled),
            permit = tokio::time::timeout(wait, self.pool.clone().acquire_owned()) => match permit {
                Ok(Ok(permit)) => Ok(permit),
                // the pool is never closed
                Ok(Err(_)) => Err(overloaded),
                Err(_) => {
                    tracing::warn!("No execution slot within {} ms", self.config.queue_timeout_ms);
                    Err(overloaded)
                }
            },
        }
    }

    /// Runs with an acquired slot. `permit` is dropped last, after the workspace is released.
    async fn execute(
        &self,
        profile: &LanguageProfile,
        request: &ExecutionRequest,
        limits: &ResourceLimits,
        claim: &SessionClaim,
        permit: OwnedSemaphorePermit,
        started_at: DateTime<Utc>,
    ) -> Result<ExecutionResult, ExecuteError> {
        let mut workspace = match self.workspaces.acquire().await {
            Ok(workspace) => workspace,
            Err(e) => {
                tracing::error!("Workspace creation failed: {}", e);
                drop(permit);
                return Ok(ExecutionResult::internal_error(
                    profile.id,
                    e.to_string(),
                    0,
                    0,
                    started_at,
                ));
            }
        };

        let result = self
            .run_steps(profile, request, limits, claim, &workspace, started_at)
            .await;

        workspace.release().await;
        drop(permit);
        result
    }

    async fn run_steps(
        &self,
        profile: &LanguageProfile,
        request: &ExecutionRequest,
        limits: &ResourceLimits,
        claim: &SessionClaim,
        workspace: &Workspace,
        started_at: DateTime<Utc>,
    ) -> Result<ExecutionResult, ExecuteError> {
        let internal = |message: String, compile_ms, run_ms| {
            tracing::error!("Internal error: {}", message);
            ExecutionResult::internal_error(profile.id, message, compile_ms, run_ms, started_at)
        };

        if let Err(e) = workspace
            .write_source(profile.source_file, &request.source)
            .await
        {
            return Ok(internal(e.to_string(), 0, 0));
        }

        let cancel = claim.cancel_token();
        let mut compile_ms = 0;
        let mut run_ms = 0;
        for step in profile.steps {
            if cancel.is_cancelled() {
                return Err(ExecuteError::Cancelled);
            }
            let step_limits = if step.is_compile {
                self.config.compile_limits(limits)
            } else {
                limits.clone()
            };
            claim.set_state(if step.is_compile {
                ExecutionState::Compiling
            } else {
                ExecutionState::Running
            });

            let invocation = steps::invocation(
                profile,
                step,
                workspace.path(),
                &step_limits,
                request.stdin.as_deref(),
            );
            let outcome = match self.sandbox.run_step(&invocation, cancel).await {
                Ok(outcome) => outcome,
                Err(SandboxError::Cancelled) => return Err(ExecuteError::Cancelled),
                Err(e) => return Ok(internal(e.to_string(), compile_ms, run_ms)),
            };
            if step.is_compile {
                compile_ms += outcome.duration_ms;
            } else {
                run_ms += outcome.duration_ms;
            }

            if step.is_compile && outcome.succeeded() {
                continue;
            }
            // a failed compile short-circuits; otherwise this was the run step
            let status = outcome.status(step.is_compile);
            return Ok(self.finish(status, profile, outcome, compile_ms, run_ms, started_at));
        }

        Ok(internal(
            format!("profile `{}` ended without a run step", profile.id),
            compile_ms,
            run_ms,
        ))
    }

    fn finish(
        &self,
        status: ExecutionStatus,
        profile: &LanguageProfile,
        outcome: StepOutcome,
        compile_ms: u64,
        run_ms: u64,
        started_at: DateTime<Utc>,
    ) -> ExecutionResult {
        ExecutionResult::from_outcome(status, profile.id, outcome, compile_ms, run_ms, started_at)
            .unwrap_or_else(|e| {
                tracing::error!("Sandbox produced an inconsistent outcome: {}", e);
                ExecutionResult::internal_error(
                    profile.id,
                    e.to_string(),
                    compile_ms,
                    run_ms,
                    started_at,
                )
            })
    }
}
