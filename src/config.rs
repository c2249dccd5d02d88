use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the fronting listener accepts submissions on.
    pub listen: String,
    /// Downstream relay that receives scored mail.
    pub forward: ForwardConfig,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default = "default_backlog_factor")]
    pub backlog_factor: usize,
    #[serde(default = "default_queue_wait_seconds")]
    pub queue_wait_seconds: u64,
    #[serde(default)]
    pub kill_level: Option<f64>,
    #[serde(default)]
    pub max_size: Option<usize>,
    #[serde(default)]
    pub store_directory: Option<PathBuf>,
    #[serde(default)]
    pub forward_on_error: bool,
    /// Keep a `.killed` copy of messages dropped at the kill level.
    #[serde(default)]
    pub archive_killed: bool,
    #[serde(default)]
    pub spamd: SpamdConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub stats: StatsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_forward_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpamdConfig {
    #[serde(default = "default_spamd_host")]
    pub host: String,
    #[serde(default = "default_spamd_port")]
    pub port: u16,
    /// Fallback identity; each message is scored as its recipient.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_spamd_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub above: Option<f64>,
    #[serde(default)]
    pub addresses: HashSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_report_interval")]
    pub report_interval_minutes: u64,
    #[serde(default)]
    pub report_from: Option<String>,
    #[serde(default)]
    pub report_to: Option<String>,
}

fn default_threads() -> usize {
    4
}

fn default_backlog_factor() -> usize {
    5
}

fn default_queue_wait_seconds() -> u64 {
    10
}

fn default_forward_timeout() -> u64 {
    60
}

fn default_spamd_host() -> String {
    "localhost".to_string()
}

fn default_spamd_port() -> u16 {
    783
}

fn default_spamd_timeout() -> u64 {
    30
}

fn default_report_interval() -> u64 {
    60
}

impl Default for SpamdConfig {
    fn default() -> Self {
        SpamdConfig {
            host: default_spamd_host(),
            port: default_spamd_port(),
            user: None,
            timeout_seconds: default_spamd_timeout(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig {
            enabled: false,
            report_interval_minutes: default_report_interval(),
            report_from: None,
            report_to: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: "127.0.0.1:10025".to_string(),
            forward: ForwardConfig {
                host: "127.0.0.1".to_string(),
                port: 10026,
                timeout_seconds: default_forward_timeout(),
            },
            threads: default_threads(),
            backlog_factor: default_backlog_factor(),
            queue_wait_seconds: default_queue_wait_seconds(),
            kill_level: Some(50.0),
            max_size: Some(512_000),
            store_directory: Some(PathBuf::from("store")),
            forward_on_error: false,
            archive_killed: false,
            spamd: SpamdConfig::default(),
            filter: FilterConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

impl Config {
    /// Loads a YAML config. A relative `store_directory` is resolved against
    /// the directory holding the config file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {path}"))?;
        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration file: {path}"))?;

        if let Some(store) = config.store_directory.take() {
            config.store_directory = Some(resolve_relative(Path::new(path), store)?);
        }
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write configuration file: {path}"))?;
        Ok(())
    }

    /// Rejects configurations the relay must not start with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listen.trim().is_empty() {
            bail!("listen address is required");
        }
        if self.forward.host.trim().is_empty() || self.forward.port == 0 {
            bail!("forward host and port are required");
        }
        if self.threads == 0 {
            bail!("threads must be at least 1");
        }
        if self.backlog_factor == 0 {
            bail!("backlog_factor must be at least 1");
        }
        if self.queue_wait_seconds == 0 {
            bail!("queue_wait_seconds must be at least 1");
        }
        if self.stats.enabled {
            if self.stats.report_interval_minutes == 0 {
                bail!("stats.report_interval_minutes must be at least 1");
            }
            if self.stats.report_from.is_none() || self.stats.report_to.is_none() {
                bail!("stats.report_from and stats.report_to are required when stats are enabled");
            }
        }
        Ok(())
    }

    pub fn queue_capacity(&self) -> usize {
        self.threads * self.backlog_factor
    }

    pub fn queue_wait(&self) -> Duration {
        Duration::from_secs(self.queue_wait_seconds)
    }
}

fn resolve_relative(config_path: &Path, store: PathBuf) -> anyhow::Result<PathBuf> {
    if store.is_absolute() {
        return Ok(store);
    }
    let base = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let base = std::fs::canonicalize(&base)
        .with_context(|| format!("Failed to resolve config directory: {}", base.display()))?;
    Ok(base.join(store))
}
