use std::path::{Path, PathBuf};
use tokio::fs as tokio_fs;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct RotationConfig {
    /// Size ceiling of the current file in bytes.
    pub max_bytes: u64,
    /// Files kept in total, the current one included.
    pub max_files: u32,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_bytes: 5 * 1024 * 1024,
            max_files: 5,
        }
    }
}

/// Numbered rotation: `name.log` -> `name.log.1` -> ... -> `name.log.{max_files - 1}`.
#[derive(Debug, Clone, Copy)]
pub struct LogRotation {
    config: RotationConfig,
}

impl LogRotation {
    pub fn new(config: RotationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> RotationConfig {
        self.config
    }

    /// True when appending `incoming` bytes would push a non-empty file past the ceiling.
    pub fn should_rotate(&self, current_size: u64, incoming: u64) -> bool {
        current_size > 0 && current_size.saturating_add(incoming) > self.config.max_bytes
    }

    fn retained_backups(&self) -> u32 {
        self.config.max_files.saturating_sub(1)
    }

    pub fn backup_path(log_path: &Path, index: u32) -> PathBuf {
        let mut name = log_path.as_os_str().to_os_string();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    /// Shifts backups up one slot and moves the current file to `.1`.
    /// The caller must have released its handle on `log_path`.
    pub async fn rotate(&self, log_path: &Path) -> scriptctl_core::Result<()> {
        let keep = self.retained_backups();

        if keep == 0 {
            if tokio_fs::try_exists(log_path).await? {
                tokio_fs::remove_file(log_path).await?;
            }
            self.sweep(log_path, 1).await?;
            return Ok(());
        }

        let oldest = Self::backup_path(log_path, keep);
        if tokio_fs::try_exists(&oldest).await? {
            tokio_fs::remove_file(&oldest).await?;
        }

        for index in (1..keep).rev() {
            let from = Self::backup_path(log_path, index);
            if tokio_fs::try_exists(&from).await? {
                let to = Self::backup_path(log_path, index + 1);
                if let Err(e) = tokio_fs::rename(&from, &to).await {
                    warn!("Failed to shift {:?} to {:?}: {}", from, to, e);
                }
            }
        }

        if tokio_fs::try_exists(log_path).await? {
            let first = Self::backup_path(log_path, 1);
            match tokio_fs::rename(log_path, &first).await {
                Ok(_) => {}
                Err(_) if cfg!(windows) => {
                    // Windows refuses to rename a file another handle still holds
                    tokio_fs::copy(log_path, &first).await?;
                    tokio_fs::write(log_path, b"").await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.sweep(log_path, keep + 1).await?;
        debug!("Rotated {:?} (keeping {} backups)", log_path, keep);
        Ok(())
    }

    /// Removes numbered backups at index `from` and above.
    async fn sweep(&self, log_path: &Path, from: u32) -> scriptctl_core::Result<()> {
        let (Some(parent), Some(file_name)) = (log_path.parent(), log_path.file_name()) else {
            return Ok(());
        };
        let prefix = format!("{}.", file_name.to_string_lossy());

        let mut entries = match tokio_fs::read_dir(parent).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(index) = name
                .strip_prefix(&prefix)
                .and_then(|suffix| suffix.parse::<u32>().ok())
            else {
                continue;
            };
            if index >= from {
                let _ = tokio_fs::remove_file(entry.path()).await;
            }
        }
        Ok(())
    }
}

/// Numbered backup index of `file_name` relative to `base_name`, `Some(0)` for the file itself.
pub fn backup_index(base_name: &str, file_name: &str) -> Option<u32> {
    if file_name == base_name {
        return Some(0);
    }
    file_name
        .strip_prefix(base_name)?
        .strip_prefix('.')?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_rotate() {
        let rotation = LogRotation::new(RotationConfig {
            max_bytes: 100,
            max_files: 5,
        });

        assert!(!rotation.should_rotate(0, 500));
        assert!(!rotation.should_rotate(50, 50));
        assert!(rotation.should_rotate(50, 51));
        assert!(rotation.should_rotate(100, 1));
    }

    #[test]
    fn test_backup_index() {
        assert_eq!(backup_index("web.log", "web.log"), Some(0));
        assert_eq!(backup_index("web.log", "web.log.3"), Some(3));
        assert_eq!(backup_index("web.log", "web.log.x"), None);
        assert_eq!(backup_index("web.log", "web.logs"), None);
        assert_eq!(backup_index("web.log", "api.log.1"), None);
    }

    #[tokio::test]
    async fn test_rotate_shifts_backups() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("job.log");
        let rotation = LogRotation::new(RotationConfig {
            max_bytes: 10,
            max_files: 3,
        });

        for round in 0..4 {
            std::fs::write(&log, format!("round {}", round)).unwrap();
            rotation.rotate(&log).await.unwrap();
        }

        assert!(!log.exists());
        assert_eq!(
            std::fs::read_to_string(LogRotation::backup_path(&log, 1)).unwrap(),
            "round 3"
        );
        assert_eq!(
            std::fs::read_to_string(LogRotation::backup_path(&log, 2)).unwrap(),
            "round 2"
        );
        assert!(!LogRotation::backup_path(&log, 3).exists());
    }

    #[tokio::test]
    async fn test_rotate_sweeps_stale_backups() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("job.log");
        std::fs::write(&log, "current").unwrap();
        std::fs::write(LogRotation::backup_path(&log, 9), "stale").unwrap();

        LogRotation::new(RotationConfig::default())
            .rotate(&log)
            .await
            .unwrap();

        assert!(!LogRotation::backup_path(&log, 9).exists());
        assert!(LogRotation::backup_path(&log, 1).exists());
    }
}
