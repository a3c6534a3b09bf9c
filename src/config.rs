use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gate::GateType;
use crate::{tglog_debug, Error, Result};

pub const DEFAULT_PERMISSION_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_QUESTION_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_PLAN_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 3600;
pub const DEFAULT_REAP_INTERVAL_SECS: u64 = 300;
const DEFAULT_WORKING_ROOT: &str = "/root";

/// How tool calls that normally need a human are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Shell and file-mutating tools wait for a human.
    #[default]
    Default,
    /// File edits are auto-allowed; shell commands still wait.
    AcceptEdits,
    /// Permission and question gates resolve without a human.
    /// Plan review still waits.
    TrustAll,
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionMode::Default => write!(f, "default"),
            PermissionMode::AcceptEdits => write!(f, "accept_edits"),
            PermissionMode::TrustAll => write!(f, "trust_all"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default = "default_permission_timeout")]
    pub permission_timeout_secs: u64,
    #[serde(default = "default_question_timeout")]
    pub question_timeout_secs: u64,
    #[serde(default = "default_plan_timeout")]
    pub plan_timeout_secs: u64,
    /// Working directory used when a task request does not name one.
    #[serde(default = "default_working_root")]
    pub working_root: PathBuf,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

fn default_permission_timeout() -> u64 {
    DEFAULT_PERMISSION_TIMEOUT_SECS
}

fn default_question_timeout() -> u64 {
    DEFAULT_QUESTION_TIMEOUT_SECS
}

fn default_plan_timeout() -> u64 {
    DEFAULT_PLAN_TIMEOUT_SECS
}

fn default_working_root() -> PathBuf {
    PathBuf::from(DEFAULT_WORKING_ROOT)
}

fn default_session_ttl() -> u64 {
    DEFAULT_SESSION_TTL_SECS
}

fn default_reap_interval() -> u64 {
    DEFAULT_REAP_INTERVAL_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            permission_mode: PermissionMode::default(),
            permission_timeout_secs: DEFAULT_PERMISSION_TIMEOUT_SECS,
            question_timeout_secs: DEFAULT_QUESTION_TIMEOUT_SECS,
            plan_timeout_secs: DEFAULT_PLAN_TIMEOUT_SECS,
            working_root: default_working_root(),
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            reap_interval_secs: DEFAULT_REAP_INTERVAL_SECS,
        }
    }
}

impl Config {
    pub fn taskgate_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".taskgate"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::taskgate_dir()?.join("taskgate.toml"))
    }

    /// How long a gate of the given type waits for a human.
    pub fn gate_timeout(&self, gate: GateType) -> Duration {
        let secs = match gate {
            GateType::Permission => self.permission_timeout_secs,
            GateType::Question => self.question_timeout_secs,
            GateType::Plan => self.plan_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tglog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            tglog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        tglog_debug!(
            "Config loaded: mode={}, timeouts={}/{}/{}s, working_root={}",
            config.permission_mode,
            config.permission_timeout_secs,
            config.question_timeout_secs,
            config.plan_timeout_secs,
            config.working_root.display()
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::taskgate_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        tglog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Reject zero timeouts, which would resolve every gate to its default.
    pub fn validate(&self) -> Result<()> {
        for (name, secs) in [
            ("permission_timeout_secs", self.permission_timeout_secs),
            ("question_timeout_secs", self.question_timeout_secs),
            ("plan_timeout_secs", self.plan_timeout_secs),
            ("reap_interval_secs", self.reap_interval_secs),
        ] {
            if secs == 0 {
                return Err(Error::Validation(format!("{} must be positive", name)));
            }
        }
        if !self.working_root.is_absolute() {
            return Err(Error::Validation(format!(
                "working_root must be absolute: {}",
                self.working_root.display()
            )));
        }
        Ok(())
    }
}
