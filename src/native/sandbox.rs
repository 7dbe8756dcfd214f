use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Isolation};
use crate::constants::{PIPE_DRAIN_TIMEOUT_MS, SAMPLE_INTERVAL_MS};
use crate::core::domain::{LimitKind, StepOutcome};
use crate::core::traits::sandbox::{Sandbox, SandboxError, StepInvocation};
use crate::native::capture::{self, SharedStream};
use crate::native::launcher;
use crate::native::limits::LimitPlan;
use crate::native::namespace::Confinement;
use crate::native::process_tree::{ProcessTree, TreeUsage};

/// Runs steps as local child processes confined by namespaces, rlimits, a
/// private process group and procfs sampling, or wrapped in bubblewrap.
#[derive(Clone, Debug)]
pub struct NativeSandbox {
    isolation: Isolation,
    require_isolation: bool,
    sample_interval: Duration,
}

impl NativeSandbox {
    pub fn new(isolation: Isolation, require_isolation: bool) -> Self {
        Self {
            isolation,
            require_isolation,
            sample_interval: Duration::from_millis(SAMPLE_INTERVAL_MS),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.isolation, config.require_isolation)
    }

    /// Builds the command for a step. The flag tells whether the program runs
    /// behind relay processes.
    fn command(&self, invocation: &StepInvocation) -> Result<(Command, bool), SandboxError> {
        let argv = launcher::argv(self.isolation, invocation);
        let Some((program, args)) = argv.split_first() else {
            return Err(SandboxError::Spawn {
                program: String::new(),
                msg: "empty command".to_string(),
            });
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&invocation.workdir)
            .env_clear()
            .envs(launcher::base_env(&invocation.workdir))
            .envs(invocation.env.iter().cloned())
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        // bubblewrap sets up its own namespaces
        let supervised = self.isolation == Isolation::Native;
        if supervised {
            let confinement = Confinement::new(
                &invocation.workdir,
                invocation.limits.allow_network,
                self.require_isolation,
            )
            .map_err(|e| SandboxError::Spawn {
                program: program.clone(),
                msg: e.to_string(),
            })?;
            confinement.install(&mut command);
        }
        LimitPlan::new(&invocation.limits, invocation.caps_address_space).install(&mut command);
        Ok((command, supervised))
    }
}

impl Default for NativeSandbox {
    fn default() -> Self {
        Self::new(Isolation::Native, true)
    }
}

/// Why the monitoring loop stopped watching the step.
#[derive(Debug)]
enum Stop {
    Exited(ExitStatus),
    Limit(LimitKind),
    Cancelled,
    WaitFailed(std::io::Error),
}

#[async_trait::async_trait]
impl Sandbox for NativeSandbox {
    #[tracing::instrument(
        skip(self, invocation, cancel),
        fields(program = ?invocation.argv.first())
    )]
    async fn run_step(
        &self,
        invocation: &StepInvocation,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, SandboxError> {
        let (mut command, supervised) = self.command(invocation)?;
        let started = Instant::now();
        let mut child = command.spawn().map_err(|e| SandboxError::Spawn {
            program: invocation.argv.first().cloned().unwrap_or_default(),
            msg: e.to_string(),
        })?;
        let Some(pid) = child.id() else {
            return Err(SandboxError::Io {
                msg: "child was reaped before it could be tracked".to_string(),
            });
        };
        let pgid = pid as i32;
        let tree = if supervised {
            ProcessTree::supervised(pgid)
        } else {
            ProcessTree::new(pgid)
        };
        let tree = Arc::new(Mutex::new(tree));
        tracing::debug!("Spawned step as process group {}", pgid);

        let stdin_writer = match (child.stdin.take(), invocation.stdin.clone()) {
            (Some(mut pipe), Some(data)) => Some(tokio::spawn(async move {
                // the program may exit without reading its input
                if let Err(e) = pipe.write_all(data.as_bytes()).await {
                    tracing::debug!("Stdin not fully consumed: {}", e);
                }
            })),
            _ => None,
        };

        let cap = usize::try_from(invocation.limits.max_output_bytes).unwrap_or(usize::MAX);
        let overflow = CancellationToken::new();
        let stdout = SharedStream::default();
        let stderr = SharedStream::default();
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            readers.push(tokio::spawn(capture::capture(
                pipe,
                cap,
                stdout.clone(),
                overflow.clone(),
            )));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(tokio::spawn(capture::capture(
                pipe,
                cap,
                stderr.clone(),
                overflow.clone(),
            )));
        }

        let limits = &invocation.limits;
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(limits.wall_clock_ms);
        let mut ticker = tokio::time::interval(self.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut peak_memory_bytes = 0;

        let stop = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Stop::Cancelled,
                _ = overflow.cancelled() => break Stop::Limit(LimitKind::Output),
                status = child.wait() => break match status {
                    Ok(status) => Stop::Exited(status),
                    Err(e) => Stop::WaitFailed(e),
                },
                _ = tokio::time::sleep_until(deadline) => break Stop::Limit(LimitKind::Wall),
                _ = ticker.tick() => {
                    let Some(usage) = sample(&tree).await else { continue };
                    peak_memory_bytes = peak_memory_bytes.max(usage.rss_bytes);
                    if usage.rss_bytes > limits.memory_bytes {
                        break Stop::Limit(LimitKind::Memory);
                    }
                    if usage.cpu_ms > limits.cpu_ms {
                        break Stop::Limit(LimitKind::Cpu);
                    }
                }
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        if let Stop::Limit(kind) = &stop {
            tracing::info!("Killing process group {} after exceeding {:?} limit", pgid, kind);
        }

        // the leader may be gone while descendants still run, so the tree dies in every case
        let killed = kill_tree(&tree).await;
        if !matches!(stop, Stop::Exited(_)) {
            if let Err(e) = child.wait().await {
                tracing::warn!("Failed to reap process group {}: {}", pgid, e);
            }
        }
        drain(readers).await;
        if let Some(writer) = stdin_writer {
            writer.abort();
        }
        if let Err(e) = killed {
            tracing::error!("Failed to kill process group {}: {}", pgid, e);
            return Err(SandboxError::Signal {
                pgid,
                msg: e.to_string(),
            });
        }

        let (exit_code, killed_by) = match stop {
            Stop::Cancelled => return Err(SandboxError::Cancelled),
            Stop::WaitFailed(e) => return Err(SandboxError::Io { msg: e.to_string() }),
            Stop::Limit(kind) => (None, Some(kind)),
            // the step exited before the overflow was noticed, the cap was still exceeded
            Stop::Exited(_) if overflow.is_cancelled() => (None, Some(LimitKind::Output)),
            Stop::Exited(status) => classify(status),
        };

        let (stdout, stdout_truncated) = capture::take(&stdout).into_text(cap);
        let (stderr, stderr_truncated) = capture::take(&stderr).into_text(cap);
        let outcome = StepOutcome {
            stdout,
            stderr,
            exit_code,
            killed_by,
            duration_ms,
            stdout_truncated,
            stderr_truncated,
            peak_memory_bytes,
        };
        tracing::debug!(
            "Step finished: exit_code={:?}, killed_by={:?}, duration_ms={}",
            outcome.exit_code,
            outcome.killed_by,
            outcome.duration_ms
        );
        Ok(outcome)
    }
}

/// Maps a wait status to `(exit_code, killed_by)`. A signal death the sandbox did
/// not cause is reported shell-style as `128 + signal`.
fn classify(status: ExitStatus) -> (Option<i32>, Option<LimitKind>) {
    match (status.code(), status.signal()) {
        (Some(code), _) => (Some(code), None),
        (None, Some(libc::SIGXCPU)) => (None, Some(LimitKind::Cpu)),
        (None, Some(signal)) => (Some(128 + signal), None),
        (None, None) => (Some(-1), None),
    }
}

fn lock(tree: &Mutex<ProcessTree>) -> MutexGuard<'_, ProcessTree> {
    tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn sample(tree: &Arc<Mutex<ProcessTree>>) -> Option<TreeUsage> {
    let tree = tree.clone();
    match tokio::task::spawn_blocking(move || lock(&tree).sample()).await {
        Ok(Ok(usage)) => Some(usage),
        Ok(Err(e)) => {
            tracing::warn!("Failed to sample process tree: {}", e);
            None
        }
        Err(e) => {
            tracing::warn!("Sampling task failed: {}", e);
            None
        }
    }
}

async fn kill_tree(tree: &Arc<Mutex<ProcessTree>>) -> std::io::Result<()> {
    let tree = tree.clone();
    tokio::task::spawn_blocking(move || lock(&tree).kill_all())
        .await
        .map_err(std::io::Error::other)?
}

/// Waits for the capture tasks to hit EOF. A pipe still held open by something
/// outside the tree is abandoned after a short grace period.
async fn drain(readers: Vec<JoinHandle<()>>) {
    let deadline =
        tokio::time::Instant::now() + Duration::from_millis(PIPE_DRAIN_TIMEOUT_MS);
    for mut reader in readers {
        if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
            tracing::warn!("Output pipe still open after the step was killed");
            reader.abort();
        }
    }
}
