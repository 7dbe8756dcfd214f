pub const DEFAULT_MAX_CONCURRENT_EXECUTIONS: usize = 4;
pub const DEFAULT_QUEUE_TIMEOUT_MS: u64 = 5_000;

pub const DEFAULT_WALL_CLOCK_MS: u64 = 10_000;
pub const DEFAULT_CPU_MS: u64 = 10_000;
pub const DEFAULT_MEMORY_BYTES: u64 = 256 * 1024 * 1024;
pub const DEFAULT_MAX_OUTPUT_BYTES: u64 = 64 * 1024;

pub const MAX_WALL_CLOCK_MS: u64 = 60_000;
pub const MAX_MEMORY_BYTES: u64 = 1024 * 1024 * 1024;
pub const MAX_SOURCE_BYTES: usize = 256 * 1024;

pub const COMPILE_WALL_CLOCK_MS: u64 = 30_000;
pub const COMPILE_MEMORY_BYTES: u64 = 1024 * 1024 * 1024;

/// How often the process tree of a running step is sampled for memory and CPU.
pub const SAMPLE_INTERVAL_MS: u64 = 10;
/// `RLIMIT_AS` is set to this multiple of the memory cap, the sampler does the real enforcement.
pub const ADDRESS_SPACE_FACTOR: u64 = 4;
pub const MAX_OPEN_FILES: u64 = 256;
pub const MAX_FILE_SIZE_BYTES: u64 = 64 * 1024 * 1024;
pub const PIPE_DRAIN_TIMEOUT_MS: u64 = 500;

pub const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
pub const WORKSPACE_PREFIX: &str = "coderunner_";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:50051";
pub const ENV_PREFIX: &str = "CODERUNNER_";
