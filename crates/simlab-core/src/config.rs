use crate::error::{Result, SimlabError};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "simlab.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimlabConfig {
    /// `memory://`, `file://<dir>` or a bare directory path.
    pub store: String,
    pub results_root: PathBuf,
    pub workers: usize,
    pub supervisor: SupervisorConfig,
}

impl Default for SimlabConfig {
    fn default() -> Self {
        Self {
            store: "file://.simlab/store".to_string(),
            results_root: PathBuf::from("results"),
            workers: 1,
            supervisor: SupervisorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    pub poll_interval_ms: u64,
    pub default_timeout_secs: u64,
    pub panic_marker: String,
    /// Console output file, relative to the run output directory.
    pub console_log: String,
    pub panic_tail_bytes: u64,
    pub checkpoint_name: String,
    pub archive_name: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            default_timeout_secs: 15 * 60,
            panic_marker: "Kernel panic".to_string(),
            console_log: "system.pc.com_1.device".to_string(),
            panic_tail_bytes: 1000,
            checkpoint_name: "info.json".to_string(),
            archive_name: "results.zip".to_string(),
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl SimlabConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: SimlabConfig =
            serde_yaml::from_str(raw).map_err(|e| SimlabError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            SimlabError::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// An explicit path must exist; otherwise `simlab.yaml` in the current
    /// directory is used when present, and defaults apply when it is not.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let candidate = Path::new(DEFAULT_CONFIG_FILE);
                if candidate.is_file() {
                    Self::load(candidate)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.store.trim().is_empty() {
            return Err(SimlabError::Config("store must not be empty".into()));
        }
        if self.workers == 0 {
            return Err(SimlabError::Config("workers must be at least 1".into()));
        }
        if self.supervisor.poll_interval_ms == 0 {
            return Err(SimlabError::Config(
                "supervisor.poll_interval_ms must be positive".into(),
            ));
        }
        if self.supervisor.panic_marker.is_empty() {
            return Err(SimlabError::Config(
                "supervisor.panic_marker must not be empty".into(),
            ));
        }
        if self.supervisor.archive_name == self.supervisor.checkpoint_name {
            return Err(SimlabError::Config(
                "archive_name and checkpoint_name must differ".into(),
            ));
        }
        Ok(())
    }
}
