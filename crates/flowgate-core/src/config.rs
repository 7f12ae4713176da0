use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowgateError, Result};
use crate::types::OnError;

/// Top-level Flowgate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub gates: GateConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum nodes executing at once in engine-driven mode.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Live graphs kept in the registry before the oldest-updated is evicted.
    #[serde(default = "default_max_live_graphs")]
    pub max_live_graphs: usize,
    /// Fallback node timeout when neither node nor graph sets one.
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,
    #[serde(default)]
    pub default_max_retries: u32,
    #[serde(default)]
    pub default_on_error: OnError,
    #[serde(default = "default_workspace")]
    pub workspace: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            max_live_graphs: default_max_live_graphs(),
            default_timeout_ms: None,
            default_max_retries: 0,
            default_on_error: OnError::default(),
            workspace: default_workspace(),
        }
    }
}

/// Completion gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Evidence older than this is treated as missing.
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: u64,
    /// Tool suggested to produce guard (static-analysis) evidence.
    #[serde(default = "default_guard_tool")]
    pub guard_tool: String,
    /// Tool suggested to produce test evidence.
    #[serde(default = "default_test_tool")]
    pub test_tool: String,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_age_ms: default_max_age_ms(),
            guard_tool: default_guard_tool(),
            test_tool: default_test_tool(),
        }
    }
}

/// Snapshot / resume configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default)]
    pub enabled: bool,
    /// SQLite file for snapshots. Default: <workspace>/snapshots.db
    #[serde(default)]
    pub path: Option<String>,
}

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = graph events, 2 = node transitions, 3 = gate detail.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: None,
            level: default_log_level(),
        }
    }
}

fn default_concurrency_limit() -> usize { 4 }
fn default_max_live_graphs() -> usize { 64 }
fn default_workspace() -> String { "~/.flowgate".to_string() }
fn default_max_age_ms() -> u64 { 1_800_000 }
fn default_guard_tool() -> String { "code_lint".to_string() }
fn default_test_tool() -> String { "test_run".to_string() }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowgateError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse config text after expanding `${ENV_VAR}` references.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| FlowgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.concurrency_limit == 0 {
            return Err(FlowgateError::Config(
                "[engine].concurrency_limit must be >= 1".into(),
            ));
        }
        if self.engine.max_live_graphs == 0 {
            return Err(FlowgateError::Config(
                "[engine].max_live_graphs must be >= 1".into(),
            ));
        }
        if !(1..=3).contains(&self.log.level) {
            return Err(FlowgateError::Config(format!(
                "[log].level must be 1, 2 or 3 (got {})",
                self.log.level
            )));
        }
        Ok(())
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.engine.workspace)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        match self.snapshot.path {
            Some(ref p) => expand_home(p),
            None => self.workspace_dir().join("snapshots.db"),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        match self.log.log_dir {
            Some(ref p) => expand_home(p),
            None => self.workspace_dir().join("logs"),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep the reference verbatim when unset
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
