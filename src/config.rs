use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::geometry::Dimensions;
use crate::loop_detector::LoopConfig;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub host: String,
    pub port: u16,
    pub default_viewport: Dimensions,
    pub backend_timeout: Duration,
    pub settle_delay: Duration,
    pub max_wait: Duration,
    pub loop_detection: LoopConfig,
    pub headless: bool,
    pub chrome_executable: Option<PathBuf>,
    pub profile_root: PathBuf,
    pub desktop_session_at_boot: bool,
    pub allowed_origins: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8766,
            default_viewport: Dimensions::reference(),
            backend_timeout: Duration::from_secs(30),
            settle_delay: Duration::from_millis(150),
            max_wait: Duration::from_secs(100),
            loop_detection: LoopConfig::default(),
            headless: false,
            chrome_executable: None,
            profile_root: default_profile_root(),
            desktop_session_at_boot: true,
            allowed_origins: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env::var("TOOL_SERVER_HOST")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.host),
            port: env_parse("TOOL_SERVER_PORT", defaults.port),
            default_viewport: env_parse("TOOL_SERVER_VIEWPORT", defaults.default_viewport),
            backend_timeout: env_millis("TOOL_SERVER_BACKEND_TIMEOUT_MS", defaults.backend_timeout),
            settle_delay: env_millis("TOOL_SERVER_SETTLE_MS", defaults.settle_delay),
            max_wait: env_millis("TOOL_SERVER_MAX_WAIT_MS", defaults.max_wait),
            loop_detection: checked_loop_config(
                LoopConfig {
                    window: env_parse("TOOL_SERVER_LOOP_WINDOW", defaults.loop_detection.window),
                    capacity: env_parse("TOOL_SERVER_LOOP_HISTORY", defaults.loop_detection.capacity),
                    tolerance: env_parse("TOOL_SERVER_LOOP_TOLERANCE", defaults.loop_detection.tolerance),
                },
                defaults.loop_detection,
            ),
            headless: env_flag("TOOL_SERVER_HEADLESS", defaults.headless),
            chrome_executable: env::var("CHROME_BIN")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            profile_root: env::var("TOOL_SERVER_PROFILE_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.profile_root),
            desktop_session_at_boot: env_flag(
                "TOOL_SERVER_DESKTOP_SESSION",
                defaults.desktop_session_at_boot,
            ),
            allowed_origins: parse_list(&env::var("TOOL_SERVER_ALLOWED_ORIGINS").unwrap_or_default()),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_profile_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(env::temp_dir)
        .join("local-tool-server")
        .join("profiles")
}

fn env_flag(key: &str, default_val: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default_val,
    }
}

fn env_parse<T: FromStr>(key: &str, default_val: T) -> T {
    match env::var(key) {
        Ok(raw) => parse_or(key, &raw, default_val),
        Err(_) => default_val,
    }
}

fn parse_or<T: FromStr>(key: &str, raw: &str, default_val: T) -> T {
    match raw.trim().parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            warn!(key, value = raw, "invalid configuration value, using default");
            default_val
        }
    }
}

fn checked_loop_config(cfg: LoopConfig, default_val: LoopConfig) -> LoopConfig {
    if cfg.is_valid() {
        return cfg;
    }
    warn!(
        window = cfg.window,
        capacity = cfg.capacity,
        tolerance = cfg.tolerance,
        "loop detection needs history >= window >= 1, using defaults"
    );
    default_val
}

fn env_millis(key: &str, default_val: Duration) -> Duration {
    Duration::from_millis(env_parse(key, default_val.as_millis() as u64))
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
