//! Process-wide configuration, read once at start-up.
//!
//! Values come from built-in defaults, then an optional YAML file, then
//! `CODERUNNER_*` environment variables.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{
    COMPILE_MEMORY_BYTES, COMPILE_WALL_CLOCK_MS, DEFAULT_CPU_MS, DEFAULT_LISTEN_ADDR,
    DEFAULT_MAX_CONCURRENT_EXECUTIONS, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_MEMORY_BYTES,
    DEFAULT_QUEUE_TIMEOUT_MS, DEFAULT_WALL_CLOCK_MS, ENV_PREFIX, MAX_MEMORY_BYTES,
    MAX_SOURCE_BYTES, MAX_WALL_CLOCK_MS,
};
use crate::core::domain::{PartialLimits, ResourceLimits};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid value `{value}` for {key}")]
    InvalidOverride { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How steps are confined.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// rlimits, a private process group and fresh user, mount, pid and network
    /// namespaces entered directly. The host filesystem is read-only and only
    /// the workspace is writable.
    #[default]
    Native,
    /// rlimits and a private process group, with the namespaces set up by
    /// wrapping the step in `bwrap`.
    Bubblewrap,
}

impl FromStr for Isolation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(Isolation::Native),
            "bubblewrap" | "bwrap" => Ok(Isolation::Bubblewrap),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub max_concurrent_executions: usize,
    pub queue_timeout_ms: u64,
    pub default_wall_clock_ms: u64,
    pub default_cpu_ms: u64,
    pub default_memory_bytes: u64,
    pub max_output_bytes: u64,
    pub allow_network_default: bool,
    pub max_wall_clock_ms: u64,
    pub max_memory_bytes: u64,
    pub max_source_bytes: usize,
    pub compile_wall_clock_ms: u64,
    pub compile_memory_bytes: u64,
    pub workspace_root: PathBuf,
    pub isolation: Isolation,
    /// Refuse to run a step when its namespaces or read-only mounts cannot be set up.
    pub require_isolation: bool,
    pub listen_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_executions: DEFAULT_MAX_CONCURRENT_EXECUTIONS,
            queue_timeout_ms: DEFAULT_QUEUE_TIMEOUT_MS,
            default_wall_clock_ms: DEFAULT_WALL_CLOCK_MS,
            default_cpu_ms: DEFAULT_CPU_MS,
            default_memory_bytes: DEFAULT_MEMORY_BYTES,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            allow_network_default: false,
            max_wall_clock_ms: MAX_WALL_CLOCK_MS,
            max_memory_bytes: MAX_MEMORY_BYTES,
            max_source_bytes: MAX_SOURCE_BYTES,
            compile_wall_clock_ms: COMPILE_WALL_CLOCK_MS,
            compile_memory_bytes: COMPILE_MEMORY_BYTES,
            workspace_root: std::env::temp_dir().join("coderunner"),
            isolation: Isolation::Native,
            require_isolation: true,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
        }
    }
}

impl Config {
    /// Loads the file at `path` if given, applies environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let content =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                        path: path.to_path_buf(),
                        source,
                    })?;
                Self::from_yaml_str(&content)?
            }
            None => Self::default(),
        };
        config.apply_overrides(utf8_vars(std::env::vars_os()))?;
        config.validate()?;
        tracing::debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Applies `CODERUNNER_<FIELD>` variables. Unrelated variables are ignored.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(field) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let field = field.to_ascii_lowercase();
            match field.as_str() {
                "max_concurrent_executions" => {
                    self.max_concurrent_executions = parse(&key, &value)?
                }
                "queue_timeout_ms" => self.queue_timeout_ms = parse(&key, &value)?,
                "default_wall_clock_ms" => self.default_wall_clock_ms = parse(&key, &value)?,
                "default_cpu_ms" => self.default_cpu_ms = parse(&key, &value)?,
                "default_memory_bytes" => self.default_memory_bytes = parse(&key, &value)?,
                "max_output_bytes" => self.max_output_bytes = parse(&key, &value)?,
                "allow_network_default" => self.allow_network_default = parse(&key, &value)?,
                "max_wall_clock_ms" => self.max_wall_clock_ms = parse(&key, &value)?,
                "max_memory_bytes" => self.max_memory_bytes = parse(&key, &value)?,
                "max_source_bytes" => self.max_source_bytes = parse(&key, &value)?,
                "compile_wall_clock_ms" => self.compile_wall_clock_ms = parse(&key, &value)?,
                "compile_memory_bytes" => self.compile_memory_bytes = parse(&key, &value)?,
                "workspace_root" => self.workspace_root = PathBuf::from(value),
                "isolation" => self.isolation = parse(&key, &value)?,
                "require_isolation" => self.require_isolation = parse(&key, &value)?,
                "listen_addr" => self.listen_addr = value,
                _ => tracing::warn!("Ignoring unknown configuration variable {}", key),
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.max_concurrent_executions == 0 {
            return fail("max_concurrent_executions must be at least 1");
        }
        if self.max_wall_clock_ms == 0 || self.default_wall_clock_ms == 0 {
            return fail("wall clock limits must be positive");
        }
        if self.default_wall_clock_ms > self.max_wall_clock_ms {
            return fail("default_wall_clock_ms exceeds max_wall_clock_ms");
        }
        if self.default_memory_bytes == 0 || self.default_memory_bytes > self.max_memory_bytes {
            return fail("default_memory_bytes must be positive and within max_memory_bytes");
        }
        if self.default_cpu_ms == 0 {
            return fail("default_cpu_ms must be positive");
        }
        if self.max_source_bytes == 0 {
            return fail("max_source_bytes must be positive");
        }
        if self.compile_wall_clock_ms == 0 || self.compile_memory_bytes == 0 {
            return fail("compile limits must be positive");
        }
        if self.workspace_root.as_os_str().is_empty() {
            return fail("workspace_root must not be empty");
        }
        Ok(())
    }

    /// Fills missing caller limits from defaults and clamps everything to the ceilings.
    pub fn resolve_limits(&self, partial: &PartialLimits) -> ResourceLimits {
        let wall_clock_ms = partial
            .wall_clock_ms
            .unwrap_or(self.default_wall_clock_ms)
            .clamp(1, self.max_wall_clock_ms);
        let cpu_ms = partial
            .cpu_ms
            .unwrap_or(self.default_cpu_ms)
            .clamp(1, self.max_wall_clock_ms);
        let memory_bytes = partial
            .memory_bytes
            .unwrap_or(self.default_memory_bytes)
            .clamp(1, self.max_memory_bytes);
        let max_output_bytes = partial
            .max_output_bytes
            .unwrap_or(self.max_output_bytes)
            .min(self.max_output_bytes);

        ResourceLimits {
            wall_clock_ms,
            cpu_ms,
            memory_bytes,
            max_output_bytes,
            allow_network: partial.allow_network.unwrap_or(self.allow_network_default),
        }
    }

    /// Compilers get their own budget; only the output cap follows the request.
    pub fn compile_limits(&self, run: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            wall_clock_ms: self.compile_wall_clock_ms,
            cpu_ms: self.compile_wall_clock_ms,
            memory_bytes: self.compile_memory_bytes,
            max_output_bytes: run.max_output_bytes,
            allow_network: false,
        }
    }
}

/// Drops variables whose name is not UTF-8; such a name can never match a field.
fn utf8_vars<I>(vars: I) -> impl Iterator<Item = (String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter().filter_map(|(key, value)| {
        let key = key.into_string().ok()?;
        Some((key, value.to_string_lossy().into_owned()))
    })
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidOverride {
            key: key.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert!(!config.allow_network_default);
        assert_eq!(config.isolation, Isolation::Native);
    }

    #[test]
    fn test_yaml_fills_missing_fields_with_defaults() {
        let config = Config::from_yaml_str(
            "max_concurrent_executions: 2\nisolation: bubblewrap\nworkspace_root: /srv/ws\n",
        )
        .unwrap();

        assert_eq!(config.max_concurrent_executions, 2);
        assert_eq!(config.isolation, Isolation::Bubblewrap);
        assert_eq!(config.workspace_root, PathBuf::from("/srv/ws"));
        assert_eq!(config.default_wall_clock_ms, DEFAULT_WALL_CLOCK_MS);
    }

    #[test]
    fn test_yaml_rejects_unknown_fields() {
        assert!(matches!(
            Config::from_yaml_str("max_threads: 9\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coderunner.yaml");
        std::fs::write(&path, "queue_timeout_ms: 750\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.queue_timeout_ms, 750);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            Config::load(Some(Path::new("/nonexistent/coderunner.yaml"))),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(vars(&[
                ("CODERUNNER_MAX_CONCURRENT_EXECUTIONS", "8"),
                ("CODERUNNER_ALLOW_NETWORK_DEFAULT", "true"),
                ("CODERUNNER_ISOLATION", "bwrap"),
                ("CODERUNNER_REQUIRE_ISOLATION", "false"),
                ("HOME", "/root"),
            ]))
            .unwrap();

        assert_eq!(config.max_concurrent_executions, 8);
        assert!(config.allow_network_default);
        assert_eq!(config.isolation, Isolation::Bubblewrap);
        assert!(!config.require_isolation);
    }

    #[test]
    fn test_non_unicode_variables_are_skipped() {
        use std::os::unix::ffi::OsStringExt;

        let vars = vec![
            (OsString::from_vec(b"JUNK_\xff".to_vec()), OsString::from("1")),
            (
                OsString::from("CODERUNNER_QUEUE_TIMEOUT_MS"),
                OsString::from("250"),
            ),
        ];
        let mut config = Config::default();

        config.apply_overrides(utf8_vars(vars)).unwrap();

        assert_eq!(config.queue_timeout_ms, 250);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = Config::default();
        let result = config.apply_overrides(vars(&[("CODERUNNER_QUEUE_TIMEOUT_MS", "soon")]));

        assert!(matches!(result, Err(ConfigError::InvalidOverride { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let config = Config {
            max_concurrent_executions: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_resolve_limits_uses_defaults() {
        let config = Config::default();
        let limits = config.resolve_limits(&PartialLimits::default());

        assert_eq!(limits.wall_clock_ms, DEFAULT_WALL_CLOCK_MS);
        assert_eq!(limits.cpu_ms, DEFAULT_CPU_MS);
        assert_eq!(limits.memory_bytes, DEFAULT_MEMORY_BYTES);
        assert_eq!(limits.max_output_bytes, DEFAULT_MAX_OUTPUT_BYTES);
        assert!(!limits.allow_network);
    }

    #[test]
    fn test_resolve_limits_clamps_to_ceilings() {
        let config = Config::default();
        let limits = config.resolve_limits(&PartialLimits {
            wall_clock_ms: Some(10 * MAX_WALL_CLOCK_MS),
            cpu_ms: Some(0),
            memory_bytes: Some(u64::MAX),
            max_output_bytes: Some(u64::MAX),
            allow_network: Some(true),
        });

        assert_eq!(limits.wall_clock_ms, MAX_WALL_CLOCK_MS);
        assert_eq!(limits.cpu_ms, 1);
        assert_eq!(limits.memory_bytes, MAX_MEMORY_BYTES);
        assert_eq!(limits.max_output_bytes, DEFAULT_MAX_OUTPUT_BYTES);
        assert!(limits.allow_network);
    }

    #[test]
    fn test_compile_limits_keep_output_cap_and_deny_network() {
        let config = Config::default();
        let run = config.resolve_limits(&PartialLimits {
            max_output_bytes: Some(100),
            allow_network: Some(true),
            ..Default::default()
        });

        let compile = config.compile_limits(&run);
        assert_eq!(compile.max_output_bytes, 100);
        assert_eq!(compile.wall_clock_ms, COMPILE_WALL_CLOCK_MS);
        assert!(!compile.allow_network);
    }
}
