use std::{path::PathBuf, time::Duration};

const DEFAULT_STOP_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_KILL_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_READY_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_TAIL_POLL_MS: u64 = 500;
const DEFAULT_LOG_WAIT_RETRIES: u32 = 20;
const DEFAULT_MONITOR_INTERVAL_MS: u64 = 1_000;
const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_millis(name: &str, min: u64, max: u64, default: u64) -> Duration {
    Duration::from_millis(env_u64(name).map(|v| v.clamp(min, max)).unwrap_or(default))
}

/// Resolves `KILN_DATA_ROOT` (default `./data`) to an absolute path.
pub fn data_root() -> PathBuf {
    let raw = std::env::var("KILN_DATA_ROOT").unwrap_or_else(|_| "./data".to_string());
    let p = PathBuf::from(raw);
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // Don't fail if the directory doesn't exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

/// Supervisor tunables. Built from the environment by the binary and
/// constructed directly by tests.
#[derive(Debug, Clone)]
pub struct Settings {
    pub java_bin: String,
    pub stop_timeout: Duration,
    pub kill_timeout: Duration,
    pub ready_timeout: Duration,
    pub tail_poll: Duration,
    pub log_wait_retries: u32,
    pub monitor_interval: Duration,
    pub subscriber_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            java_bin: "java".to_string(),
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
            kill_timeout: Duration::from_millis(DEFAULT_KILL_TIMEOUT_MS),
            ready_timeout: Duration::from_millis(DEFAULT_READY_TIMEOUT_MS),
            tail_poll: Duration::from_millis(DEFAULT_TAIL_POLL_MS),
            log_wait_retries: DEFAULT_LOG_WAIT_RETRIES,
            monitor_interval: Duration::from_millis(DEFAULT_MONITOR_INTERVAL_MS),
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let java_bin = std::env::var("KILN_JAVA_BIN")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "java".to_string());

        Self {
            java_bin,
            stop_timeout: env_millis(
                "KILN_STOP_TIMEOUT_MS",
                1_000,
                10 * 60 * 1000,
                DEFAULT_STOP_TIMEOUT_MS,
            ),
            kill_timeout: env_millis("KILN_KILL_TIMEOUT_MS", 500, 60_000, DEFAULT_KILL_TIMEOUT_MS),
            ready_timeout: env_millis(
                "KILN_READY_TIMEOUT_MS",
                1_000,
                30 * 60 * 1000,
                DEFAULT_READY_TIMEOUT_MS,
            ),
            tail_poll: env_millis("KILN_TAIL_POLL_MS", 50, 10_000, DEFAULT_TAIL_POLL_MS),
            log_wait_retries: env_u64("KILN_LOG_WAIT_RETRIES")
                .map(|v| v.clamp(1, 1_000) as u32)
                .unwrap_or(DEFAULT_LOG_WAIT_RETRIES),
            monitor_interval: env_millis(
                "KILN_MONITOR_INTERVAL_MS",
                100,
                60_000,
                DEFAULT_MONITOR_INTERVAL_MS,
            ),
            subscriber_capacity: env_usize("KILN_SUBSCRIBER_CAPACITY")
                .map(|v| v.clamp(16, 65_536))
                .unwrap_or(DEFAULT_SUBSCRIBER_CAPACITY),
        }
    }
}
