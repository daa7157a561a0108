use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_ENV: &str = "RECOMPOSABLE_CONFIG";
pub const CONFIG_NAMES: [&str; 2] = ["recomposable.json", ".recomposable.json"];

/// Manifests picked up from the working directory when none are configured
pub const DEFAULT_MANIFESTS: [&str; 4] = [
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Dashboard configuration (`recomposable.json`)
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Compose manifests; relative paths resolve against the config file's directory
    pub compose_files: Vec<PathBuf>,
    /// Bottom panel depth, also the initial tail length
    pub log_panel_lines: usize,
    pub status_poll_ms: u64,
    /// Stats and log pattern scan share this interval
    pub stats_poll_ms: u64,
    pub stats_buffer_size: usize,
    pub log_scan_patterns: Vec<String>,
    pub log_scan_lines: usize,
    pub tail_debounce_ms: u64,
    pub render_interval_ms: u64,
    /// Timeout for short synchronous queries (status, ids, discovery)
    pub query_timeout_ms: u64,
    pub no_cache: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            compose_files: Vec::new(),
            log_panel_lines: 30,
            status_poll_ms: 3000,
            stats_poll_ms: 5000,
            stats_buffer_size: 6,
            log_scan_patterns: vec!["error".into(), "warn".into()],
            log_scan_lines: 200,
            tail_debounce_ms: 500,
            render_interval_ms: 150,
            query_timeout_ms: 5000,
            no_cache: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl Config {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config =
            serde_json::from_str(&content).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?;

        if let Some(base) = path.parent() {
            config.compose_files = config
                .compose_files
                .into_iter()
                .map(|f| if f.is_relative() { base.join(f) } else { f })
                .collect();
        }
        config.validate()?;
        Ok(config)
    }

    /// Find the config file: an explicit path, then the environment variable,
    /// then the current directory and its parents. `Ok(None)` means defaults.
    pub fn discover(
        explicit: Option<&Path>,
        start_dir: &Path,
    ) -> Result<Option<(PathBuf, Self)>, ConfigError> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        Self::discover_from(explicit, from_env, start_dir)
    }

    fn discover_from(
        explicit: Option<&Path>,
        from_env: Option<PathBuf>,
        start_dir: &Path,
    ) -> Result<Option<(PathBuf, Self)>, ConfigError> {
        if let Some(path) = explicit.map(Path::to_path_buf).or(from_env) {
            if !path.exists() {
                return Err(ConfigError::NotFound(path));
            }
            let config = Self::load(&path)?;
            return Ok(Some((path, config)));
        }

        let mut dir = Some(start_dir);
        while let Some(current) = dir {
            for name in CONFIG_NAMES {
                let path = current.join(name);
                if path.is_file() {
                    tracing::debug!(path = %path.display(), "found config");
                    let config = Self::load(&path)?;
                    return Ok(Some((path, config)));
                }
            }
            dir = current.parent();
        }

        Ok(None)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&'static str, u64); 8] = [
            ("logPanelLines", self.log_panel_lines as u64),
            ("statusPollMs", self.status_poll_ms),
            ("statsPollMs", self.stats_poll_ms),
            ("statsBufferSize", self.stats_buffer_size as u64),
            ("logScanLines", self.log_scan_lines as u64),
            ("tailDebounceMs", self.tail_debounce_ms),
            ("renderIntervalMs", self.render_interval_ms),
            ("queryTimeoutMs", self.query_timeout_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.log_scan_patterns.iter().any(|p| p.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                field: "logScanPatterns",
                reason: "patterns must not be empty".into(),
            });
        }
        Ok(())
    }

    /// Manifests to supervise: `-f` flags win over the config, and with
    /// neither the first default manifest in `cwd` is used.
    pub fn resolve_manifests(&self, cli_files: &[PathBuf], cwd: &Path) -> Vec<PathBuf> {
        if !cli_files.is_empty() {
            return cli_files
                .iter()
                .map(|f| if f.is_relative() { cwd.join(f) } else { f.clone() })
                .collect();
        }
        if !self.compose_files.is_empty() {
            return self
                .compose_files
                .iter()
                .map(|f| if f.is_relative() { cwd.join(f) } else { f.clone() })
                .collect();
        }
        DEFAULT_MANIFESTS
            .iter()
            .map(|name| cwd.join(name))
            .find(|p| p.is_file())
            .into_iter()
            .collect()
    }

    pub fn status_poll(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms)
    }

    pub fn stats_poll(&self) -> Duration {
        Duration::from_millis(self.stats_poll_ms)
    }

    pub fn tail_debounce(&self) -> Duration {
        Duration::from_millis(self.tail_debounce_ms)
    }

    pub fn render_interval(&self) -> Duration {
        Duration::from_millis(self.render_interval_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}
