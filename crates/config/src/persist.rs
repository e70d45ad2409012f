//! Write-back of runtime endpoint state into the configuration file.
//!
//! The file is rewritten on OAuth token refresh and on rate-limit state
//! change, via an atomic temp-file-then-rename with a `.backup` copy of
//! the prior contents.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context as _;

use crate::{Config, EndpointConfig};

/// Serializes the live configuration back to disk.
pub struct ConfigPersister {
    path: PathBuf,
    current: Mutex<Config>,
}

impl ConfigPersister {
    /// Create a persister over the loaded configuration.
    pub fn new(path: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            path: path.into(),
            current: Mutex::new(config),
        }
    }

    /// Apply `update` to the named endpoint entry and rewrite the file.
    pub fn update_endpoint(
        &self,
        name: &str,
        update: impl FnOnce(&mut EndpointConfig),
    ) -> anyhow::Result<()> {
        let snapshot = {
            let mut config = self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let Some(endpoint) = config.endpoints.iter_mut().find(|e| e.name == name) else {
                anyhow::bail!("endpoint '{name}' not present in configuration");
            };
            update(endpoint);
            config.clone()
        };

        let serialized = serde_yaml::to_string(&snapshot).context("failed to serialize configuration")?;
        write_atomic(&self.path, &serialized)
    }
}

fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));

    if path.exists() {
        let mut backup = path.as_os_str().to_owned();
        backup.push(".backup");
        std::fs::copy(path, PathBuf::from(backup))
            .with_context(|| format!("failed to back up {}", path.display()))?;
    }

    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file next to {}", path.display()))?;
    temp.write_all(contents.as_bytes())
        .context("failed to write configuration")?;
    temp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;

    Ok(())
}
