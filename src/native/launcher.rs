use std::path::Path;

use crate::config::Isolation;
use crate::constants::SANDBOX_PATH;
use crate::core::traits::sandbox::StepInvocation;

const BWRAP: &str = "bwrap";

/// Host paths exposed read-only inside bubblewrap when they exist.
const READ_ONLY_BINDS: &[&str] = &[
    "/usr", "/bin", "/sbin", "/lib", "/lib32", "/lib64", "/etc", "/opt",
];

/// The argument vector actually spawned for a step.
pub fn argv(isolation: Isolation, invocation: &StepInvocation) -> Vec<String> {
    match isolation {
        Isolation::Native => invocation.argv.clone(),
        Isolation::Bubblewrap => bubblewrap_argv(invocation, |path| Path::new(path).exists()),
    }
}

/// Environment every step starts from; nothing is inherited from the host.
pub fn base_env(workdir: &Path) -> Vec<(String, String)> {
    let workdir = workdir.display().to_string();
    vec![
        ("PATH".to_string(), SANDBOX_PATH.to_string()),
        ("HOME".to_string(), workdir.clone()),
        ("TMPDIR".to_string(), workdir),
        ("LANG".to_string(), "C.UTF-8".to_string()),
    ]
}

fn bubblewrap_argv<F>(invocation: &StepInvocation, exists: F) -> Vec<String>
where
    F: Fn(&str) -> bool,
{
    let workdir = invocation.workdir.display().to_string();
    let mut argv: Vec<String> = [BWRAP, "--die-with-parent", "--new-session", "--unshare-all"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if invocation.limits.allow_network && !invocation.is_compile {
        argv.push("--share-net".to_string());
    }
    for path in READ_ONLY_BINDS.iter().copied().filter(|path| exists(*path)) {
        argv.extend(["--ro-bind", path, path].map(String::from));
    }
    argv.extend(["--proc", "/proc", "--dev", "/dev", "--tmpfs", "/tmp"].map(String::from));
    // the workspace keeps its host path so rendered arguments stay valid inside
    argv.extend(["--bind".to_string(), workdir.clone(), workdir.clone()]);
    argv.extend(["--chdir".to_string(), workdir]);
    argv.push("--".to_string());
    argv.extend(invocation.argv.iter().cloned());
    argv
}
