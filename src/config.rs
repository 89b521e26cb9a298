use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 4520;

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

// ─── OnMissing policy ─────────────────────────────────────────────────────────

/// What a streaming update/delete does when a request names an unknown task id.
///
/// `skip` (default) applies the batch best-effort: the element is a silent
/// no-op and the stream continues. `error` fails the whole call with
/// NOT_FOUND at the first unknown id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnMissing {
    Skip,
    Error,
}

impl Default for OnMissing {
    fn default() -> Self {
        OnMissing::Skip
    }
}

impl std::str::FromStr for OnMissing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(OnMissing::Skip),
            "error" => Ok(OnMissing::Error),
            other => Err(format!("invalid on_missing value '{other}' (expected 'skip' or 'error')")),
        }
    }
}

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// WebSocket server port (default: 4520).
    port: Option<u16>,
    /// Bind address for the WebSocket server (default: "127.0.0.1").
    bind_address: Option<String>,
    /// Log level filter string, e.g. "debug", "info,taskd=trace" (default: "info").
    log: Option<String>,
    /// Log output format: "pretty" (default, human-readable) | "json" (structured).
    log_format: Option<String>,
    /// Static auth token override. When absent, the token is read from (or
    /// generated at) `{data_dir}/auth_token`.
    auth_token: Option<String>,
    /// Unknown-id policy for streaming update/delete: "skip" (default) | "error".
    on_missing: Option<OnMissing>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── TaskdConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TaskdConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    /// Bind address for the WebSocket server (TASKD_BIND env var, default: "127.0.0.1").
    pub bind_address: String,
    pub log: String,
    /// Log output format: "pretty" (default) | "json".
    pub log_format: String,
    /// Static auth token override. None = provision from `{data_dir}/auth_token`.
    pub auth_token: Option<String>,
    /// Unknown-id policy for streaming update/delete.
    pub on_missing: OnMissing,
}

impl TaskdConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        bind_address: Option<String>,
        on_missing: Option<OnMissing>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let bind_address = bind_address
            .or(std::env::var("TASKD_BIND").ok().filter(|s| !s.is_empty()))
            .or(toml.bind_address)
            .unwrap_or_else(default_bind_address);

        let log_format = std::env::var("TASKD_LOG_FORMAT")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.log_format)
            .unwrap_or_else(|| "pretty".to_string());

        let auth_token = std::env::var("TASKD_AUTH_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .or(toml.auth_token);

        let on_missing = on_missing
            .or(std::env::var("TASKD_ON_MISSING")
                .ok()
                .and_then(|s| s.parse().ok()))
            .or(toml.on_missing)
            .unwrap_or_default();

        Self {
            port,
            data_dir,
            bind_address,
            log,
            log_format,
            auth_token,
            on_missing,
        }
    }
}

fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TASKD_DATA_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("taskd");
        }
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            if !xdg.is_empty() {
                return PathBuf::from(xdg).join("taskd");
            }
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("taskd");
        }
    }

    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("taskd");
        }
    }

    PathBuf::from(".taskd")
}
