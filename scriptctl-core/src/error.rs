use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Process spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Script {0} not found")]
    ScriptNotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid script id: {0}")]
    InvalidScriptId(String),

    #[error("Supervisor error: {0}")]
    Supervisor(String),

    #[error("Signal handling error: {0}")]
    Signal(String),

    #[error("Canceled")]
    Canceled,

    #[cfg(unix)]
    #[error("Unix error: {0}")]
    Unix(#[from] nix::errno::Errno),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ScriptNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
