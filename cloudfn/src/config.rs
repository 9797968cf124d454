//! Configuration management
//!
//! Sources, lowest precedence first: built-in defaults, `cloudfn.toml` (or
//! the file named with `--config`), `CLOUDFN_*` environment variables using
//! `__` between sections (`CLOUDFN_SERVER__PORT=9000`), then CLI flags.

use anyhow::{bail, Context};
use cloudfn_functions::{ExecutorConfig, Runtime, ServiceLimits};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub runtime: RuntimeConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the per-function source directories
    pub functions_dir: PathBuf,
    /// Registry snapshot; relative paths are inside `functions_dir`
    pub snapshot_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            functions_dir: PathBuf::from("./functions"),
            snapshot_file: PathBuf::from("functions.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Parent of per-invocation directories; `<functions_dir>/.scratch` if unset
    pub scratch_dir: Option<PathBuf>,
    pub max_concurrent: usize,
    pub default_timeout: u64,
    pub default_memory: u32,
    pub max_timeout: u64,
    pub max_code_size_kb: usize,
    pub enabled_runtimes: Vec<String>,
    pub go_binary: String,
    pub node_binary: String,
    pub python_binary: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scratch_dir: None,
            max_concurrent: 10,
            default_timeout: 30,
            default_memory: 128,
            max_timeout: 900,
            max_code_size_kb: 1024,
            enabled_runtimes: Runtime::ALL.iter().map(|r| r.as_str().to_string()).collect(),
            go_binary: "go".to_string(),
            node_binary: "node".to_string(),
            python_binary: "python3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("cloudfn").required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("CLOUDFN")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("runtime.enabled_runtimes")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?;

        config
            .try_deserialize::<Config>()
            .context("invalid configuration")
    }

    /// Check invariants and create the working directories
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            bail!("server.port must not be 0");
        }
        if self.runtime.max_concurrent == 0 {
            bail!("runtime.max_concurrent must be at least 1");
        }
        if self.runtime.default_timeout == 0 {
            bail!("runtime.default_timeout must be at least 1");
        }
        if self.runtime.default_timeout > self.runtime.max_timeout {
            bail!(
                "runtime.default_timeout ({}) exceeds runtime.max_timeout ({})",
                self.runtime.default_timeout,
                self.runtime.max_timeout
            );
        }
        if !LOG_LEVELS.contains(&self.log.level.to_ascii_lowercase().as_str()) {
            bail!(
                "log.level must be one of {}, got '{}'",
                LOG_LEVELS.join(", "),
                self.log.level
            );
        }
        if self.enabled_runtimes()?.is_empty() {
            bail!("runtime.enabled_runtimes must name at least one runtime");
        }

        for dir in [&self.storage.functions_dir, &self.scratch_dir()] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        Ok(())
    }

    pub fn snapshot_path(&self) -> PathBuf {
        if self.storage.snapshot_file.is_absolute() {
            self.storage.snapshot_file.clone()
        } else {
            self.storage.functions_dir.join(&self.storage.snapshot_file)
        }
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.runtime
            .scratch_dir
            .clone()
            .unwrap_or_else(|| self.storage.functions_dir.join(".scratch"))
    }

    pub fn enabled_runtimes(&self) -> anyhow::Result<Vec<Runtime>> {
        self.runtime
            .enabled_runtimes
            .iter()
            .map(|name| {
                let name = name.trim();
                Runtime::from_str(name).with_context(|| format!("unknown runtime '{name}'"))
            })
            .collect()
    }

    pub fn service_limits(&self) -> anyhow::Result<ServiceLimits> {
        Ok(ServiceLimits {
            default_timeout: self.runtime.default_timeout,
            default_memory: self.runtime.default_memory,
            max_timeout: self.runtime.max_timeout,
            max_code_size_kb: self.runtime.max_code_size_kb,
            enabled_runtimes: self.enabled_runtimes()?,
        })
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            scratch_dir: self.scratch_dir(),
            max_concurrent: self.runtime.max_concurrent,
            go_binary: self.runtime.go_binary.clone(),
            node_binary: self.runtime.node_binary.clone(),
            python_binary: self.runtime.python_binary.clone(),
        }
    }
}
