use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind_addr: SocketAddr,
    pub pool_size: usize,
    pub acquire_timeout: Option<Duration>,
    pub workspace_root: PathBuf,
    pub runtimes_path: Option<PathBuf>,
    pub cgroup_root: Option<PathBuf>,
    /// Box `n` runs as uid and gid `box_uid_base + n`.
    pub box_uid_base: u32,
    /// Lets an unprivileged engine run every box under its own uid.
    /// Boxes are then not isolated from each other; development only.
    pub allow_shared_uid: bool,
    pub box_limits: BoxLimits,
    pub max_body_bytes: usize,
    pub log_level: String,
    pub log_format: LogFormat,
}

/// Limits applied to every process tree regardless of phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxLimits {
    pub output_max_bytes: usize,
    pub max_process_count: u64,
    pub max_open_files: u64,
    pub max_file_size_bytes: u64,
    /// Wall clock cap used when a phase's timeout resolves to 0.
    pub max_wall_timeout_ms: u64,
}

impl Default for BoxLimits {
    fn default() -> Self {
        Self {
            output_max_bytes: 1024,
            max_process_count: 64,
            max_open_files: 2048,
            max_file_size_bytes: 10_000_000,
            max_wall_timeout_ms: 60_000,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = BoxLimits::default();
        let acquire_timeout_ms: u64 = env_parse("POOL_ACQUIRE_TIMEOUT_MS", 0u64);
        Self {
            bind_addr: env_parse("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 2000))),
            pool_size: env_parse("POOL_SIZE", default_pool_size()).max(1),
            acquire_timeout: (acquire_timeout_ms > 0)
                .then(|| Duration::from_millis(acquire_timeout_ms)),
            workspace_root: env::var("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir().join("jobbox")),
            runtimes_path: env::var("RUNTIMES_PATH").ok().map(PathBuf::from),
            cgroup_root: env::var("CGROUP_ROOT").ok().map(PathBuf::from),
            box_uid_base: env_parse("BOX_UID_BASE", 60_000u32),
            allow_shared_uid: env_parse("ALLOW_SHARED_UID", false),
            box_limits: BoxLimits {
                output_max_bytes: env_parse("OUTPUT_MAX_BYTES", defaults.output_max_bytes),
                max_process_count: env_parse("MAX_PROCESS_COUNT", defaults.max_process_count),
                max_open_files: env_parse("MAX_OPEN_FILES", defaults.max_open_files),
                max_file_size_bytes: env_parse(
                    "MAX_FILE_SIZE_BYTES",
                    defaults.max_file_size_bytes,
                ),
                max_wall_timeout_ms: env_parse(
                    "MAX_WALL_TIMEOUT_MS",
                    defaults.max_wall_timeout_ms,
                )
                .max(1),
            },
            max_body_bytes: env_parse("MAX_BODY_BYTES", 4 * 1024 * 1024usize),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format: env_parse("LOG_FORMAT", LogFormat::Json),
        }
    }
}

fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "compact" | "text" => Ok(Self::Compact),
            _ => Err(format!("unsupported log format: {s}")),
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
