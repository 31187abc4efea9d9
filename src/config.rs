use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PLUGINS_DIR: &str = "plugins";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// Resolved host settings. CLI flags win over environment variables, which
/// win over the defaults; `.env` files are loaded into the environment
/// before resolution happens.
#[derive(Debug, Clone)]
pub struct HostSettings {
    /// Directory holding one subdirectory per plugin.
    pub plugins_dir: PathBuf,
    /// Where rolling log files go; console-only when unset.
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
    /// How long each individual hook call may take.
    pub call_timeout: Duration,
}

impl HostSettings {
    pub fn resolve(
        plugins_dir: Option<PathBuf>,
        log_dir: Option<PathBuf>,
        log_level: Option<String>,
        call_timeout_secs: Option<u64>,
    ) -> Self {
        let env_path = |key: &str| env::var(key).ok().map(PathBuf::from);
        Self {
            plugins_dir: plugins_dir
                .or_else(|| env_path("QUIVER_PLUGINS_DIR"))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PLUGINS_DIR)),
            log_dir: log_dir.or_else(|| env_path("QUIVER_LOG_DIR")),
            log_level: log_level
                .or_else(|| env::var("QUIVER_LOG_LEVEL").ok())
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            call_timeout: Duration::from_secs(
                call_timeout_secs
                    .or_else(|| {
                        env::var("QUIVER_CALL_TIMEOUT_SECS").ok().and_then(|s| s.parse().ok())
                    })
                    .unwrap_or(DEFAULT_CALL_TIMEOUT_SECS),
            ),
        }
    }
}
