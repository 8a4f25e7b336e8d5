use super::{CONFIG_FILE_NAME, Config};
use std::path::{Path, PathBuf};

/// Config loader with auto-discovery
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            search_paths: vec![
                PathBuf::from("."),
                PathBuf::from("./config"),
                std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
                super::default_home_dir(),
            ],
        }
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Searches only the given directories.
    pub fn with_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            search_paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    /// First `scriptctl.json` found in the search paths.
    pub fn discover(&self) -> Option<PathBuf> {
        self.search_paths
            .iter()
            .map(|dir| dir.join(CONFIG_FILE_NAME))
            .find(|candidate| candidate.is_file())
    }

    /// Auto-discover and load config; an empty config when nothing is found.
    pub async fn load(&self) -> crate::Result<Config> {
        match self.discover() {
            Some(path) => self.load_file(&path).await,
            None => {
                tracing::debug!("No {} found in {:?}", CONFIG_FILE_NAME, self.search_paths);
                Ok(Config::default())
            }
        }
    }

    /// Load a specific config file
    pub async fn load_file(&self, path: &Path) -> crate::Result<Config> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            crate::Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Config::from_json(&content)
    }
}
