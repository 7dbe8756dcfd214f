use std::path::Path;

use crate::core::domain::ResourceLimits;
use crate::core::registry::{LanguageProfile, Step, TemplateContext};
use crate::core::traits::sandbox::StepInvocation;

/// Renders `step` of `profile` for a workspace. Only run steps receive stdin.
pub fn invocation(
    profile: &LanguageProfile,
    step: &Step,
    workdir: &Path,
    limits: &ResourceLimits,
    stdin: Option<&str>,
) -> StepInvocation {
    let workdir_text = workdir.display().to_string();
    let source = workdir.join(profile.source_file).display().to_string();
    let argv = step.render(&TemplateContext {
        source_file: &source,
        workdir: &workdir_text,
        memory_bytes: limits.memory_bytes,
    });

    StepInvocation {
        argv,
        workdir: workdir.to_path_buf(),
        env: profile
            .env
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect(),
        stdin: if step.is_compile {
            None
        } else {
            stdin.map(str::to_string)
        },
        limits: limits.clone(),
        is_compile: step.is_compile,
        caps_address_space: profile.caps_address_space,
    }
}
