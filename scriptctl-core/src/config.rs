pub mod loader;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;

use crate::backoff::{BackoffPolicy, JitterMode};
use crate::{ScriptDefinition, ScriptId};

pub use loader::ConfigLoader;

pub const CONFIG_FILE_NAME: &str = "scriptctl.json";
pub const DEFAULT_LOG_MAX_BYTES: u64 = 5 * 1024 * 1024;
pub const DEFAULT_LOG_MAX_FILES: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub factor: f64,
    pub max_delay_ms: u64,
    pub jitter: JitterMode,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            factor: 2.0,
            max_delay_ms: 30_000,
            jitter: JitterMode::None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub logs_path: Option<PathBuf>,
    pub tick_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub backoff: BackoffSettings,
    pub log_max_bytes: u64,
    pub log_max_files: u32,
    pub notifications_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            logs_path: None,
            tick_interval_ms: 2000,
            probe_timeout_ms: 1500,
            backoff: BackoffSettings::default(),
            log_max_bytes: DEFAULT_LOG_MAX_BYTES,
            log_max_files: DEFAULT_LOG_MAX_FILES,
            notifications_enabled: true,
        }
    }
}

impl Settings {
    /// Configured log directory, or the per-user default when unset or blank.
    pub fn logs_dir(&self) -> PathBuf {
        match &self.logs_path {
            Some(path) if !path.as_os_str().to_string_lossy().trim().is_empty() => path.clone(),
            _ => default_logs_dir(),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(10))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.max(1))
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new()
            .with_multiplier(self.backoff.factor)
            .with_max_delay(Duration::from_millis(self.backoff.max_delay_ms))
            .with_jitter(self.backoff.jitter)
    }
}

pub fn default_home_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("SCRIPTCTL_HOME") {
        return PathBuf::from(home);
    }
    match std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        Some(home) => PathBuf::from(home).join(".scriptctl"),
        None => std::env::temp_dir().join("scriptctl"),
    }
}

pub fn default_logs_dir() -> PathBuf {
    default_home_dir().join("logs")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scripts: Vec<ScriptDefinition>,
    #[serde(default)]
    pub settings: Settings,
}

impl Config {
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen = HashSet::new();
        for script in &self.scripts {
            if !seen.insert(&script.id) {
                return Err(crate::Error::Config(format!(
                    "Duplicate script id: {}",
                    script.id
                )));
            }
            if script.command.trim().is_empty() {
                return Err(crate::Error::Config(format!(
                    "Script {} has an empty command",
                    script.id
                )));
            }
        }
        Ok(())
    }

    pub fn from_json(content: &str) -> crate::Result<Self> {
        let config: Config = serde_json::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn script(&self, id: &ScriptId) -> Option<&ScriptDefinition> {
        self.scripts.iter().find(|s| &s.id == id)
    }
}

/// Point-in-time source of script definitions.
pub trait ScriptProvider: Send + Sync {
    fn scripts(&self) -> Vec<ScriptDefinition>;

    fn script(&self, id: &ScriptId) -> Option<ScriptDefinition> {
        self.scripts().into_iter().find(|s| &s.id == id)
    }
}

/// Fixed in-memory script list.
#[derive(Debug, Default)]
pub struct StaticScripts {
    scripts: RwLock<Vec<ScriptDefinition>>,
}

impl StaticScripts {
    pub fn new(scripts: Vec<ScriptDefinition>) -> Self {
        Self {
            scripts: RwLock::new(scripts),
        }
    }

    /// Replaces the definition with the same id, or appends it.
    pub fn upsert(&self, script: ScriptDefinition) {
        let mut scripts = self.scripts.write();
        match scripts.iter_mut().find(|s| s.id == script.id) {
            Some(existing) => *existing = script,
            None => scripts.push(script),
        }
    }
}

impl ScriptProvider for StaticScripts {
    fn scripts(&self) -> Vec<ScriptDefinition> {
        self.scripts.read().clone()
    }
}

pub struct ConfigWatcher {
    path: PathBuf,
    current: ArcSwap<Config>,
    checksum: Arc<RwLock<Vec<u8>>>,
}

impl ConfigWatcher {
    pub async fn new(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = Self::load_config(&path).await?;
        let checksum = Self::compute_checksum(&path).await?;

        Ok(Self {
            path,
            current: ArcSwap::new(Arc::new(config)),
            checksum: Arc::new(RwLock::new(checksum)),
        })
    }

    async fn load_config(path: &Path) -> crate::Result<Config> {
        let content = fs::read_to_string(path).await?;
        Config::from_json(&content)
    }

    async fn compute_checksum(path: &Path) -> crate::Result<Vec<u8>> {
        let content = fs::read(path).await?;
        let mut hasher = Sha256::new();
        hasher.update(&content);
        Ok(hasher.finalize().to_vec())
    }

    /// Reloads when the file content changed. An unparsable edit keeps the
    /// previous config and surfaces the error.
    pub async fn check_reload(&self) -> crate::Result<bool> {
        let new_checksum = Self::compute_checksum(&self.path).await?;
        let current_checksum = self.checksum.read().clone();

        if new_checksum != current_checksum {
            let new_config = Self::load_config(&self.path).await?;
            self.current.store(Arc::new(new_config));
            *self.checksum.write() = new_checksum;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn get(&self) -> Arc<Config> {
        self.current.load_full()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScriptProvider for ConfigWatcher {
    fn scripts(&self) -> Vec<ScriptDefinition> {
        self.current.load().scripts.clone()
    }
}
