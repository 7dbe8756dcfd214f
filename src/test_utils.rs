use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::config::{Config, Isolation};
use crate::constants::SANDBOX_PATH;
use crate::core::domain::PartialLimits;
use crate::core::traits::sandbox::{Sandbox, StepInvocation};
use crate::native::sandbox::NativeSandbox;

/// Whether `name` resolves on the sandbox `PATH`. Tests that need a toolchain skip without it.
pub fn tool_available(name: &str) -> bool {
    let found = SANDBOX_PATH
        .split(':')
        .any(|dir| Path::new(dir).join(name).is_file());
    if !found {
        eprintln!("skipping: `{}` is not installed", name);
    }
    found
}

/// Whether a step can enter its namespaces and read-only mounts on this host.
/// Test containers often forbid user namespaces.
pub async fn confinement_available() -> bool {
    let Ok(dir) = tempfile::tempdir() else {
        return false;
    };
    let invocation = StepInvocation {
        argv: vec!["true".to_string()],
        workdir: dir.path().to_path_buf(),
        env: vec![],
        stdin: None,
        limits: Config::default().resolve_limits(&PartialLimits::default()),
        is_compile: false,
        caps_address_space: false,
    };
    let available = NativeSandbox::new(Isolation::Native, true)
        .run_step(&invocation, &CancellationToken::new())
        .await
        .is_ok();
    if !available {
        eprintln!("skipping: namespaces are not available");
    }
    available
}

/// Default configuration rooted at `root`. Isolation is best-effort, since test
/// containers often forbid namespaces.
pub fn test_config(root: &Path) -> Config {
    Config {
        workspace_root: root.to_path_buf(),
        require_isolation: false,
        ..Config::default()
    }
}

/// Pids of live processes whose command line contains `token`.
pub fn processes_with_token(token: &str) -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return vec![];
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter(|pid| {
            // zombies have an empty command line
            let cmdline = std::fs::read(format!("/proc/{pid}/cmdline")).unwrap_or_default();
            String::from_utf8_lossy(&cmdline).contains(token)
        })
        .collect()
}

pub fn assert_empty_dir(dir: &Path) {
    let leftovers: Vec<_> = std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(Result::ok).map(|entry| entry.path()).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "workspaces left behind: {:?}", leftovers);
}
