use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BACKOFF_MS: u64 = 1000;
pub const DEFAULT_MAX_RETRIES: i64 = 5;

#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScriptId(String);

impl ScriptId {
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        let sanitized = Self::sanitize(&id);
        if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
            return Err(crate::Error::InvalidScriptId(id));
        }
        Ok(Self(sanitized))
    }

    fn sanitize(id: &str) -> String {
        id.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect::<String>()
            .trim_matches('-')
            .to_string()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScriptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ScriptId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<ScriptId> for String {
    fn from(id: ScriptId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    #[serde(rename = "always")]
    Always,
    #[default]
    #[serde(rename = "on-crash")]
    OnCrash,
    #[serde(rename = "never")]
    Never,
}

impl RestartPolicy {
    /// Whether an unrequested exit with `code` should be followed by a restart.
    /// A missing code (killed by a signal) counts as a crash.
    pub fn restarts_after(self, code: Option<i32>) -> bool {
        match self {
            Self::Always => true,
            Self::OnCrash => code != Some(0),
            Self::Never => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub url: Option<String>,
}

impl HealthCheck {
    pub fn is_empty(&self) -> bool {
        self.port.is_none() && self.url.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScriptDefinition {
    pub id: ScriptId,
    pub name: String,
    pub description: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub auto_start: bool,
    pub restart_policy: RestartPolicy,
    pub backoff_ms: u64,
    pub max_retries: i64,
    pub health_check: Option<HealthCheck>,
}

impl ScriptDefinition {
    pub fn new(id: ScriptId, command: impl Into<String>) -> Self {
        Self {
            name: id.to_string(),
            id,
            description: None,
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            auto_start: false,
            restart_policy: RestartPolicy::default(),
            backoff_ms: DEFAULT_BACKOFF_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            health_check: None,
        }
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// `max_retries < 0` means unlimited.
    pub fn retry_budget_allows(&self, retries: u32) -> bool {
        self.max_retries < 0 || i64::from(retries) < self.max_retries
    }

    pub fn health_check(&self) -> Option<&HealthCheck> {
        self.health_check.as_ref().filter(|h| !h.is_empty())
    }
}

// Raw deserialization struct for ScriptDefinition
#[derive(Debug, Deserialize)]
struct ScriptDefinitionRaw {
    pub id: ScriptId,
    pub name: Option<String>,
    pub description: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    pub cwd: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    pub auto_start: Option<bool>,
    pub restart_policy: Option<RestartPolicy>,
    pub backoff_ms: Option<u64>,
    pub max_retries: Option<i64>,
    pub health_check: Option<HealthCheck>,
}

impl<'de> Deserialize<'de> for ScriptDefinition {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        ScriptDefinitionRaw::deserialize(deserializer).map(Into::into)
    }
}

impl From<ScriptDefinitionRaw> for ScriptDefinition {
    fn from(raw: ScriptDefinitionRaw) -> Self {
        // Without explicit args the command string carries them
        let (command, args) = if let Some(args) = raw.args {
            (raw.command, args)
        } else {
            match shell_words::split(&raw.command) {
                Ok(parts) if !parts.is_empty() => {
                    let command = parts[0].clone();
                    let args = parts.into_iter().skip(1).collect();
                    (command, args)
                }
                _ => (raw.command, Vec::new()),
            }
        };

        ScriptDefinition {
            name: raw.name.unwrap_or_else(|| raw.id.to_string()),
            id: raw.id,
            description: raw.description,
            command,
            args,
            cwd: raw.cwd,
            env: raw.env.unwrap_or_default(),
            auto_start: raw.auto_start.unwrap_or(false),
            restart_policy: raw.restart_policy.unwrap_or_default(),
            backoff_ms: raw.backoff_ms.unwrap_or(DEFAULT_BACKOFF_MS),
            max_retries: raw.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            health_check: raw.health_check,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeStatus {
    Stopped,
    Starting,
    Running,
    Crashed,
    Restarting,
}

impl RuntimeStatus {
    pub fn allowed_next(self) -> &'static [RuntimeStatus] {
        use RuntimeStatus::*;
        match self {
            Stopped => &[Starting],
            Starting => &[Running, Stopped, Crashed],
            Running => &[Stopped, Crashed, Restarting],
            Crashed => &[Starting, Restarting, Stopped],
            Restarting => &[Starting, Stopped],
        }
    }

    pub fn can_transition_to(self, next: RuntimeStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Crashed => "crashed",
            Self::Restarting => "restarting",
        }
    }
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time, read-only view of one managed script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub script_id: ScriptId,
    pub pid: Option<u32>,
    pub status: RuntimeStatus,
    /// Epoch milliseconds of the last transition into `starting`.
    pub start_time: Option<u64>,
    pub uptime_ms: Option<u64>,
    pub cpu_percent: Option<f32>,
    #[serde(rename = "memMB")]
    pub mem_mb: Option<f64>,
    pub last_exit_code: Option<i32>,
    pub retries: u32,
    pub healthy: Option<bool>,
    pub backoff_ms: u64,
    pub next_restart_delay_ms: Option<u64>,
}
