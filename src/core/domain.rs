use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies the caller session that owns an execution.
/// At most one execution per session is in flight at any time.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub wall_clock_ms: u64,
    pub cpu_ms: u64,
    pub memory_bytes: u64,
    pub max_output_bytes: u64,
    pub allow_network: bool,
}

/// Limits as supplied by a caller. Missing fields are filled from the configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialLimits {
    pub wall_clock_ms: Option<u64>,
    pub cpu_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub max_output_bytes: Option<u64>,
    pub allow_network: Option<bool>,
}

#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    pub language: String,
    pub source: String,
    pub stdin: Option<String>,
    pub limits: PartialLimits,
}

impl ExecutionRequest {
    pub fn new(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            source: source.into(),
            stdin: None,
            limits: PartialLimits::default(),
        }
    }

    pub fn with_stdin(self, stdin: impl Into<String>) -> Self {
        Self {
            stdin: Some(stdin.into()),
            ..self
        }
    }

    pub fn with_limits(self, limits: PartialLimits) -> Self {
        Self { limits, ..self }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    CompileError,
    RuntimeError,
    Timeout,
    ResourceExceeded,
    InternalError,
}

/// The limit that made the sandbox kill a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Wall,
    Cpu,
    Memory,
    Output,
}

impl LimitKind {
    pub fn status(self) -> ExecutionStatus {
        match self {
            LimitKind::Wall | LimitKind::Cpu => ExecutionStatus::Timeout,
            LimitKind::Memory | LimitKind::Output => ExecutionStatus::ResourceExceeded,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    #[default]
    Queued,
    Compiling,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// What a single compile or run step produced inside the sandbox.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub killed_by: Option<LimitKind>,
    pub duration_ms: u64,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub peak_memory_bytes: u64,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        self.killed_by.is_none() && self.exit_code == Some(0)
    }

    pub fn truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }

    /// Status of the whole execution if this step is the last one that ran.
    pub fn status(&self, is_compile: bool) -> ExecutionStatus {
        match (self.killed_by, self.exit_code) {
            (Some(limit), _) => limit.status(),
            (None, Some(0)) => ExecutionStatus::Success,
            (None, _) if is_compile => ExecutionStatus::CompileError,
            (None, _) => ExecutionStatus::RuntimeError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidResult {
    #[error(
        "exactly one of exit code and limit kill must be present (both present: {both_present})"
    )]
    ExitCodeMismatch { both_present: bool },
    #[error("status {status:?} contradicts the step outcome")]
    StatusMismatch { status: ExecutionStatus },
}

/// Final outcome of an execution. Fields are only readable; construction validates
/// that exactly one of `exit_code` and `killed_by` is present.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    status: ExecutionStatus,
    language: String,
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    killed_by: Option<LimitKind>,
    compile_duration_ms: u64,
    run_duration_ms: u64,
    truncated: bool,
    peak_memory_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn from_outcome(
        status: ExecutionStatus,
        language: &str,
        outcome: StepOutcome,
        compile_duration_ms: u64,
        run_duration_ms: u64,
        started_at: DateTime<Utc>,
    ) -> Result<Self, InvalidResult> {
        if outcome.exit_code.is_some() == outcome.killed_by.is_some() {
            return Err(InvalidResult::ExitCodeMismatch {
                both_present: outcome.exit_code.is_some(),
            });
        }
        let consistent = match outcome.killed_by {
            Some(limit) => status == limit.status(),
            None => matches!(
                status,
                ExecutionStatus::Success
                    | ExecutionStatus::CompileError
                    | ExecutionStatus::RuntimeError
            ),
        };
        if !consistent || (status == ExecutionStatus::Success) != outcome.succeeded() {
            return Err(InvalidResult::StatusMismatch { status });
        }

        let truncated = outcome.truncated();
        Ok(Self {
            status,
            language: language.to_string(),
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            exit_code: outcome.exit_code,
            killed_by: outcome.killed_by,
            compile_duration_ms,
            run_duration_ms,
            truncated,
            peak_memory_bytes: outcome.peak_memory_bytes,
            message: None,
            started_at,
            finished_at: Utc::now(),
        })
    }

    pub fn internal_error(
        language: &str,
        message: impl Into<String>,
        compile_duration_ms: u64,
        run_duration_ms: u64,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: ExecutionStatus::InternalError,
            language: language.to_string(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            killed_by: None,
            compile_duration_ms,
            run_duration_ms,
            truncated: false,
            peak_memory_bytes: 0,
            message: Some(message.into()),
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn killed_by(&self) -> Option<LimitKind> {
        self.killed_by
    }

    pub fn compile_duration_ms(&self) -> u64 {
        self.compile_duration_ms
    }

    pub fn run_duration_ms(&self) -> u64 {
        self.run_duration_ms
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn peak_memory_bytes(&self) -> u64 {
        self.peak_memory_bytes
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }
}
