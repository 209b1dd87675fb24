use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{clog_debug, Error, Result};

/// Default config file name, looked up in the repository root.
pub const CONFIG_FILE: &str = "cinecron.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub schedule: ScheduleConfig,
    pub prepare: PrepareConfig,
    pub task: TaskConfig,
    pub publish: PublishConfig,
    pub secrets: SecretsConfig,
    pub lock: LockConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
    pub run_on_start: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            run_on_start: true,
        }
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Runtime and dependency requirements checked before the task runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PrepareConfig {
    pub runtime: Option<String>,
    pub runtime_version: Option<String>,
    pub install: Vec<String>,
    pub dependencies: Vec<String>,
}

impl Default for PrepareConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            runtime_version: None,
            install: vec![
                "python3".to_string(),
                "-m".to_string(),
                "pip".to_string(),
                "install".to_string(),
            ],
            dependencies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskConfig {
    pub command: Vec<String>,
    pub timeout_secs: Option<u64>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            command: vec!["python3".to_string(), "update.py".to_string()],
            timeout_secs: None,
        }
    }
}

impl TaskConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PublishConfig {
    pub remote: String,
    /// Branch to publish; the currently checked-out branch when unset.
    pub branch: Option<String>,
    pub author_name: String,
    pub author_email: String,
    pub message: String,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            branch: None,
            author_name: "Abhishek Verma".to_string(),
            author_email: "abhishekverma@users.noreply.github.com".to_string(),
            message: "Update fetched data".to_string(),
        }
    }
}

/// Names of the environment variables secrets are read from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecretsConfig {
    pub bot_token_var: String,
    pub recipient_var: String,
    pub push_token_var: String,
    /// Fail preparation when the task secrets are absent.
    pub require_task_secrets: bool,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            bot_token_var: "TELEGRAM_BOT_TOKEN".to_string(),
            recipient_var: "TELEGRAM_USER_ID".to_string(),
            push_token_var: "GITHUB_TOKEN".to_string(),
            require_task_secrets: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    pub wait_secs: u64,
    pub poll_millis: u64,
    /// Warn when another run has held the lock longer than this.
    pub warn_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_secs: 600,
            poll_millis: 250,
            warn_after_secs: 3600,
        }
    }
}

impl LockConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_millis)
    }

    pub fn warn_after(&self) -> Duration {
        Duration::from_secs(self.warn_after_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub file: Option<String>,
}

impl LogConfig {
    pub fn file_path(&self) -> Option<PathBuf> {
        self.file.as_deref().map(expand_tilde)
    }
}

impl Config {
    pub fn default_path(repo: &Path) -> PathBuf {
        repo.join(CONFIG_FILE)
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config = Self::parse(&fs::read_to_string(path)?)?;
        clog_debug!(
            "Config loaded: interval={}s task={:?} remote={} branch={:?}",
            config.schedule.interval_secs,
            config.task.command,
            config.publish.remote,
            config.publish.branch
        );
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.task.command.is_empty() {
            return Err(Error::Validation("task.command cannot be empty".to_string()));
        }
        if self.schedule.interval_secs == 0 {
            return Err(Error::Validation(
                "schedule.interval_secs must be greater than zero".to_string(),
            ));
        }
        if !self.prepare.dependencies.is_empty() && self.prepare.install.is_empty() {
            return Err(Error::Validation(
                "prepare.install is required when prepare.dependencies is set".to_string(),
            ));
        }
        if self.publish.remote.trim().is_empty() {
            return Err(Error::Validation("publish.remote cannot be empty".to_string()));
        }
        if self.publish.author_name.trim().is_empty() || self.publish.author_email.trim().is_empty()
        {
            return Err(Error::Validation(
                "publish.author_name and publish.author_email are required".to_string(),
            ));
        }
        if self.lock.poll_millis == 0 {
            return Err(Error::Validation("lock.poll_millis must be greater than zero".to_string()));
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
