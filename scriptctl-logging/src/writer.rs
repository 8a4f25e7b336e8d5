use crate::{LogRotation, RotationConfig};
use scriptctl_core::Result;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct LogWriterConfig {
    pub path: PathBuf,
    pub rotation: RotationConfig,
    pub buffer_size: usize,
}

struct OpenFile {
    file: BufWriter<File>,
    size: u64,
}

/// Append stream for one script's current log file.
///
/// The file is opened on first write and reopened after rotation or
/// [`close`](Self::close). Writes are applied in call order.
pub struct LogWriter {
    path: PathBuf,
    rotation: LogRotation,
    buffer_size: usize,
    state: Mutex<Option<OpenFile>>,
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter")
            .field("path", &self.path)
            .field("rotation", &self.rotation)
            .field("state", &"<Mutex<BufWriter>>")
            .finish()
    }
}

impl LogWriter {
    pub fn new(config: LogWriterConfig) -> Self {
        Self {
            path: config.path,
            rotation: LogRotation::new(config.rotation),
            buffer_size: config.buffer_size.max(1),
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self) -> Result<OpenFile> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let size = file.metadata().await?.len();
        trace!("Opened log file {:?} at {} bytes", self.path, size);
        Ok(OpenFile {
            file: BufWriter::with_capacity(self.buffer_size, file),
            size,
        })
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(self.open().await?);
        }

        let needs_rotation = state
            .as_ref()
            .is_some_and(|open| self.rotation.should_rotate(open.size, data.len() as u64));
        if needs_rotation {
            if let Some(mut open) = state.take() {
                open.file.flush().await?;
            }
            self.rotation.rotate(&self.path).await?;
            debug!("Rotated log {:?}", self.path);
            *state = Some(self.open().await?);
        }

        let Some(open) = state.as_mut() else {
            return Ok(());
        };
        open.file.write_all(data).await?;
        open.file.flush().await?;
        open.size += data.len() as u64;
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        if let Some(open) = self.state.lock().await.as_mut() {
            open.file.flush().await?;
        }
        Ok(())
    }

    /// Flushes and releases the file handle. A later write reopens it.
    pub async fn close(&self) -> Result<()> {
        if let Some(mut open) = self.state.lock().await.take() {
            open.file.flush().await?;
            open.file.get_mut().sync_all().await?;
        }
        Ok(())
    }

    /// Size of the current file as tracked by this writer.
    pub async fn current_size(&self) -> Option<u64> {
        self.state.lock().await.as_ref().map(|open| open.size)
    }
}
