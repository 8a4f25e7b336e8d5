mod rotation;
mod writer;

pub use rotation::{LogRotation, RotationConfig, backup_index};
pub use writer::{LogWriter, LogWriterConfig};

use dashmap::DashMap;
use scriptctl_core::{Result, ScriptId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, error, trace, warn};

/// Selector naming a script's live log file.
pub const CURRENT: &str = "current";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMeta {
    pub file: String,
    pub size: u64,
    pub mtime_ms: u64,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub base_dir: PathBuf,
    pub max_file_size: u64,
    pub max_files: u32,
    pub buffer_size: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            base_dir: scriptctl_core::config::default_logs_dir(),
            max_file_size: scriptctl_core::config::DEFAULT_LOG_MAX_BYTES,
            max_files: scriptctl_core::config::DEFAULT_LOG_MAX_FILES,
            buffer_size: 8192,
        }
    }
}

impl LogConfig {
    pub fn from_settings(settings: &scriptctl_core::Settings) -> Self {
        Self {
            base_dir: settings.logs_dir(),
            max_file_size: settings.log_max_bytes,
            max_files: settings.log_max_files.max(1),
            ..Default::default()
        }
    }
}

/// Per-script rotating log files under one directory.
#[derive(Debug, Clone)]
pub struct LogManager {
    writers: Arc<DashMap<ScriptId, Arc<LogWriter>>>,
    config: LogConfig,
}

impl LogManager {
    pub fn new(config: LogConfig) -> Self {
        debug!(
            "Creating LogManager with base_dir: {:?}, max_file_size: {}, max_files: {}",
            config.base_dir, config.max_file_size, config.max_files
        );
        Self {
            writers: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.config.base_dir
    }

    fn file_name(script_id: &ScriptId) -> String {
        format!("{}.log", script_id)
    }

    pub fn log_path(&self, script_id: &ScriptId) -> PathBuf {
        self.config.base_dir.join(Self::file_name(script_id))
    }

    pub fn get_writer(&self, script_id: &ScriptId) -> Arc<LogWriter> {
        if let Some(writer) = self.writers.get(script_id) {
            trace!("Using existing log writer for script: {}", script_id);
            return writer.clone();
        }

        self.writers
            .entry(script_id.clone())
            .or_insert_with(|| {
                debug!("Creating log writer for script: {}", script_id);
                Arc::new(LogWriter::new(LogWriterConfig {
                    path: self.log_path(script_id),
                    rotation: RotationConfig {
                        max_bytes: self.config.max_file_size,
                        max_files: self.config.max_files,
                    },
                    buffer_size: self.config.buffer_size,
                }))
            })
            .clone()
    }

    /// Appends `text` to the script's current log, rotating first when needed.
    pub async fn write(&self, script_id: &ScriptId, text: &str) -> Result<()> {
        let writer = self.get_writer(script_id);
        writer.write(text.as_bytes()).await.map_err(|e| {
            error!("Failed to write log for {} at {:?}: {}", script_id, writer.path(), e);
            e
        })
    }

    /// Flushes and releases the script's stream.
    pub async fn close(&self, script_id: &ScriptId) {
        if let Some((_, writer)) = self.writers.remove(script_id)
            && let Err(e) = writer.close().await
        {
            warn!("Failed to close log for {}: {}", script_id, e);
        }
    }

    pub async fn close_all(&self) {
        let ids: Vec<ScriptId> = self.writers.iter().map(|w| w.key().clone()).collect();
        for id in ids {
            self.close(&id).await;
        }
    }

    /// Current and rotated files, newest first.
    pub async fn list(&self, script_id: &ScriptId) -> Result<Vec<LogMeta>> {
        let base_name = Self::file_name(script_id);
        let mut entries = match tokio::fs::read_dir(&self.config.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut metas = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file = entry.file_name().to_string_lossy().into_owned();
            let Some(index) = backup_index(&base_name, &file) else {
                continue;
            };
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let mtime_ms = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            metas.push((
                index,
                LogMeta {
                    file,
                    size: metadata.len(),
                    mtime_ms,
                },
            ));
        }

        // Same-millisecond writes fall back to rotation order
        metas.sort_by(|(ia, a), (ib, b)| b.mtime_ms.cmp(&a.mtime_ms).then(ia.cmp(ib)));
        Ok(metas.into_iter().map(|(_, meta)| meta).collect())
    }

    /// Contents of `selector` ("current" or one of the names from [`list`](Self::list)).
    /// Anything outside the script's own files reads as empty.
    pub async fn read(&self, script_id: &ScriptId, selector: &str) -> Result<String> {
        let base_name = Self::file_name(script_id);
        let file = if selector == CURRENT {
            base_name.as_str()
        } else {
            selector
        };

        if !Self::is_own_file(&base_name, file) {
            warn!(
                "Rejected log read outside {} for script {}: {:?}",
                base_name, script_id, selector
            );
            return Ok(String::new());
        }

        if file == base_name
            && let Some(writer) = self.writers.get(script_id).map(|w| w.clone())
        {
            writer.flush().await?;
        }

        match tokio::fs::read(self.config.base_dir.join(file)).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Last `lines` lines of the current log.
    pub async fn tail(&self, script_id: &ScriptId, lines: usize) -> Result<Vec<String>> {
        let content = self.read(script_id, CURRENT).await?;
        let all: Vec<&str> = content.lines().collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].iter().map(|l| l.to_string()).collect())
    }

    /// The current file or one of its numbered backups, nothing else.
    fn is_own_file(base_name: &str, file: &str) -> bool {
        backup_index(base_name, file).is_some()
    }
}
