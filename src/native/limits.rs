//! Kernel-enforced limits installed in the child between `fork` and `exec`.
//!
//! Everything in `LimitPlan::apply` runs in the forked child, so it only calls
//! async-signal-safe libc functions and never allocates or logs.

use std::io;

use crate::constants::{ADDRESS_SPACE_FACTOR, MAX_FILE_SIZE_BYTES, MAX_OPEN_FILES};
use crate::core::domain::ResourceLimits;

/// Sets a resource limit, never raising it above what the parent already had.
macro_rules! lower_limit {
    ($resource:expr, $soft:expr, $hard:expr) => {{
        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: `current` is a valid, writable rlimit.
        if unsafe { libc::getrlimit($resource, &mut current) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let hard = ($hard as libc::rlim_t).min(current.rlim_max);
        let soft = ($soft as libc::rlim_t).min(hard);
        let wanted = libc::rlimit {
            rlim_cur: soft,
            rlim_max: hard,
        };
        // SAFETY: `wanted` is a valid rlimit.
        if unsafe { libc::setrlimit($resource, &wanted) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }};
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LimitPlan {
    pub cpu_seconds: u64,
    pub address_space_bytes: Option<u64>,
    pub file_size_bytes: u64,
    pub open_files: u64,
}

impl LimitPlan {
    pub fn new(limits: &ResourceLimits, caps_address_space: bool) -> Self {
        Self {
            // RLIMIT_CPU has second granularity; the sampler enforces the exact budget
            cpu_seconds: limits.cpu_ms.div_ceil(1000) + 1,
            address_space_bytes: caps_address_space
                .then(|| limits.memory_bytes.saturating_mul(ADDRESS_SPACE_FACTOR)),
            file_size_bytes: MAX_FILE_SIZE_BYTES,
            open_files: MAX_OPEN_FILES,
        }
    }

    /// Registers the plan to run in the child right before `exec`.
    pub fn install(self, command: &mut tokio::process::Command) {
        // SAFETY: `apply` only performs async-signal-safe syscalls on copied data.
        unsafe {
            command.pre_exec(move || self.apply());
        }
    }

    fn apply(&self) -> io::Result<()> {
        // the soft limit raises SIGXCPU, the hard limit one second later SIGKILL
        lower_limit!(libc::RLIMIT_CPU, self.cpu_seconds, self.cpu_seconds + 1);
        if let Some(bytes) = self.address_space_bytes {
            lower_limit!(libc::RLIMIT_AS, bytes, bytes);
        }
        lower_limit!(libc::RLIMIT_FSIZE, self.file_size_bytes, self.file_size_bytes);
        lower_limit!(libc::RLIMIT_NOFILE, self.open_files, self.open_files);
        lower_limit!(libc::RLIMIT_CORE, 0, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            wall_clock_ms: 2_000,
            cpu_ms: 1_500,
            memory_bytes: 64 * 1024 * 1024,
            max_output_bytes: 1024,
            allow_network: false,
        }
    }

    #[test]
    fn test_plan_rounds_cpu_up_with_slack() {
        let plan = LimitPlan::new(&limits(), true);

        assert_eq!(plan.cpu_seconds, 3);
        assert_eq!(plan.address_space_bytes, Some(4 * 64 * 1024 * 1024));
    }

    #[test]
    fn test_plan_without_address_space_cap() {
        let plan = LimitPlan::new(&limits(), false);

        assert_eq!(plan.address_space_bytes, None);
    }

    #[tokio::test]
    async fn test_limits_are_visible_in_child() {
        let mut command = tokio::process::Command::new("sh");
        command.arg("-c").arg("ulimit -t; ulimit -n");
        command.stdout(std::process::Stdio::piped());
        LimitPlan::new(&limits(), true).install(&mut command);

        let output = command.output().await.unwrap();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let lines: Vec<&str> = stdout.lines().collect();

        assert!(output.status.success());
        assert_eq!(lines, vec!["3".to_string(), MAX_OPEN_FILES.to_string()]);
    }
}
