use crate::auth::Credential;
use anyhow::{Context, Result};
use directories::BaseDirs;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Durable copy of the last issued credential, reused across restarts.
#[derive(Clone, Debug)]
pub struct CredentialFile {
    path: PathBuf,
}

impl CredentialFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data_dir>/finchat/credential.json`, or a relative fallback without a home directory.
    pub fn default_location() -> Self {
        let path = match BaseDirs::new() {
            Some(base) => base.data_dir().join("finchat").join("credential.json"),
            None => PathBuf::from(".finchat").join("credential.json"),
        };
        Self::new(path)
    }

    /// A fresh path under the system temp directory.
    #[cfg(any(test, feature = "testkit"))]
    pub fn in_temp_dir() -> Self {
        let mut path = std::env::temp_dir();
        path.push(format!("finchat-{}", uuid::Uuid::new_v4()));
        path.push("credential.json");
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<Credential>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        let credential = serde_json::from_str(&contents)
            .with_context(|| format!("invalid credential file {}", self.path.display()))?;
        Ok(Some(credential))
    }

    pub fn save(&self, credential: &Credential) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let staging = self.path.with_extension("json.tmp");
        let serialized = serde_json::to_vec_pretty(credential)?;
        let mut file = File::create(&staging)?;
        file.write_all(&serialized)?;
        file.sync_all()?;
        fs::rename(&staging, &self.path)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", self.path.display())),
        }
    }
}
