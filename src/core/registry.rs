//! Static table of the languages the engine can build and run.
//!
//! Profiles are the only place where command lines are defined. Every command is an
//! argument vector; placeholders are substituted per argument and never pass through
//! a shell.

use itertools::Itertools;

use crate::core::errors::RegistryError;

const SOURCE_PLACEHOLDER: &str = "{source}";
const WORKDIR_PLACEHOLDER: &str = "{workdir}";
const HEAP_MB_PLACEHOLDER: &str = "{heap_mb}";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Step {
    pub argv: &'static [&'static str],
    pub is_compile: bool,
}

/// Values substituted into a step's argument template.
#[derive(Clone, Debug)]
pub struct TemplateContext<'a> {
    pub source_file: &'a str,
    pub workdir: &'a str,
    pub memory_bytes: u64,
}

impl TemplateContext<'_> {
    /// Heap size handed to managed runtimes: three quarters of the memory cap,
    /// leaving room for the runtime's own native allocations.
    fn heap_mb(&self) -> u64 {
        (self.memory_bytes / (1024 * 1024) * 3 / 4).max(16)
    }
}

impl Step {
    pub fn render(&self, ctx: &TemplateContext<'_>) -> Vec<String> {
        let heap_mb = ctx.heap_mb().to_string();
        self.argv
            .iter()
            .map(|arg| {
                arg.replace(SOURCE_PLACEHOLDER, ctx.source_file)
                    .replace(WORKDIR_PLACEHOLDER, ctx.workdir)
                    .replace(HEAP_MB_PLACEHOLDER, &heap_mb)
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LanguageProfile {
    pub id: &'static str,
    pub aliases: &'static [&'static str],
    pub source_file: &'static str,
    pub steps: &'static [Step],
    /// Runtimes that reserve large virtual mappings up front (V8, the JVM) cannot
    /// run under `RLIMIT_AS`; their memory is enforced by sampling only.
    pub caps_address_space: bool,
    pub env: &'static [(&'static str, &'static str)],
}

impl LanguageProfile {
    pub fn extension(&self) -> &'static str {
        self.source_file
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .unwrap_or_default()
    }

    pub fn is_compiled(&self) -> bool {
        self.steps.iter().any(|step| step.is_compile)
    }

    pub fn matches(&self, id: &str) -> bool {
        self.id == id || self.aliases.contains(&id)
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidProfile {
            id: self.id.to_string(),
            reason: reason.to_string(),
        };

        let run_steps = self.steps.iter().filter(|step| !step.is_compile).count();
        if run_steps != 1 {
            return Err(invalid("profile must have exactly one run step"));
        }
        if self.steps.last().is_none_or(|step| step.is_compile) {
            return Err(invalid("the run step must be the last step"));
        }
        if self.steps.iter().filter(|step| step.is_compile).count() > 1 {
            return Err(invalid("profile may have at most one compile step"));
        }
        if self.steps.iter().any(|step| step.argv.is_empty()) {
            return Err(invalid("step has an empty command"));
        }
        if self.extension().is_empty() {
            return Err(invalid("source file has no extension"));
        }
        Ok(())
    }
}

pub const PYTHON: LanguageProfile = LanguageProfile {
    id: "python",
    aliases: &["py", "python3"],
    source_file: "main.py",
    steps: &[Step {
        argv: &["python3", "-u", "{source}"],
        is_compile: false,
    }],
    caps_address_space: true,
    env: &[("PYTHONDONTWRITEBYTECODE", "1")],
};

pub const BASH: LanguageProfile = LanguageProfile {
    id: "bash",
    aliases: &["sh", "shell"],
    source_file: "main.sh",
    steps: &[Step {
        argv: &["bash", "--noprofile", "--norc", "{source}"],
        is_compile: false,
    }],
    caps_address_space: true,
    env: &[],
};

pub const JAVASCRIPT: LanguageProfile = LanguageProfile {
    id: "javascript",
    aliases: &["js", "node", "javascript (node)"],
    source_file: "main.js",
    steps: &[Step {
        argv: &["node", "--max-old-space-size={heap_mb}", "{source}"],
        is_compile: false,
    }],
    caps_address_space: false,
    env: &[],
};

pub const C: LanguageProfile = LanguageProfile {
    id: "c",
    aliases: &["gcc"],
    source_file: "main.c",
    steps: &[
        Step {
            argv: &["gcc", "-O2", "-pipe", "-o", "{workdir}/main", "{source}", "-lm"],
            is_compile: true,
        },
        Step {
            argv: &["{workdir}/main"],
            is_compile: false,
        },
    ],
    caps_address_space: true,
    env: &[],
};

pub const CPP: LanguageProfile = LanguageProfile {
    id: "cpp",
    aliases: &["c++", "g++"],
    source_file: "main.cpp",
    steps: &[
        Step {
            argv: &["g++", "-O2", "-pipe", "-std=c++17", "-o", "{workdir}/main", "{source}"],
            is_compile: true,
        },
        Step {
            argv: &["{workdir}/main"],
            is_compile: false,
        },
    ],
    caps_address_space: true,
    env: &[],
};

pub const JAVA: LanguageProfile = LanguageProfile {
    id: "java",
    aliases: &[],
    source_file: "Main.java",
    steps: &[
        Step {
            argv: &[
                "javac",
                "-J-Xmx{heap_mb}m",
                "-J-XX:+UseSerialGC",
                "-J-XX:-UsePerfData",
                "-d",
                "{workdir}",
                "{source}",
            ],
            is_compile: true,
        },
        Step {
            argv: &[
                "java",
                "-Xmx{heap_mb}m",
                "-XX:+UseSerialGC",
                "-XX:TieredStopAtLevel=1",
                "-XX:-UsePerfData",
                "-cp",
                "{workdir}",
                "Main",
            ],
            is_compile: false,
        },
    ],
    caps_address_space: false,
    env: &[],
};

#[derive(Clone, Debug)]
pub struct LanguageRegistry {
    profiles: Vec<LanguageProfile>,
}

impl LanguageRegistry {
    pub fn builtin() -> Self {
        Self {
            profiles: vec![PYTHON, BASH, JAVASCRIPT, C, CPP, JAVA],
        }
    }

    pub fn new(profiles: Vec<LanguageProfile>) -> Result<Self, RegistryError> {
        for profile in &profiles {
            profile.validate()?;
        }
        if let Some(id) = profiles.iter().map(|profile| profile.id).duplicates().next() {
            return Err(RegistryError::InvalidProfile {
                id: id.to_string(),
                reason: "duplicate identifier".to_string(),
            });
        }
        Ok(Self { profiles })
    }

    #[tracing::instrument(skip(self))]
    pub fn resolve(&self, language_id: &str) -> Result<&LanguageProfile, RegistryError> {
        let normalized = language_id.trim().to_ascii_lowercase();
        self.profiles
            .iter()
            .find(|profile| profile.matches(&normalized))
            .ok_or_else(|| RegistryError::UnsupportedLanguage(language_id.to_string()))
    }

    pub fn profiles(&self) -> impl Iterator<Item = &LanguageProfile> {
        self.profiles.iter().sorted_by_key(|profile| profile.id)
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
