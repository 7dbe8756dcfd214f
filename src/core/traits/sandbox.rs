use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::core::domain::{ResourceLimits, StepOutcome};

/// A fully rendered step, ready to be spawned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepInvocation {
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
    pub limits: ResourceLimits,
    pub is_compile: bool,
    pub caps_address_space: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to spawn `{program}`: {msg}")]
    Spawn { program: String, msg: String },
    #[error("failed to deliver signal to process group {pgid}: {msg}")]
    Signal { pgid: i32, msg: String },
    #[error("sandbox i/o failure: {msg}")]
    Io { msg: String },
    #[error("step was cancelled")]
    Cancelled,
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait Sandbox: std::fmt::Debug + Send + Sync {
    /// Runs one step to completion or until a limit or `cancel` stops it.
    /// The whole process tree of the step is gone when this returns.
    async fn run_step(
        &self,
        invocation: &StepInvocation,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, SandboxError>;
}
