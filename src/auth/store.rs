use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::AuthError;

/// Opaque secret persistence keyed by name.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, AuthError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), AuthError>;
    async fn delete(&self, key: &str) -> Result<(), AuthError>;
}

/// Secrets kept in a single JSON object file, readable only by the owner.
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>, AuthError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                AuthError::Store(format!("failed to parse {}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(AuthError::Store(format!(
                "failed to read {}: {e}",
                self.path.display()
            ))),
        }
    }

    async fn write_all(&self, secrets: &BTreeMap<String, String>) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AuthError::Store(format!("failed to create {}: {e}", parent.display())))?;
        }
        let json = serde_json::to_string_pretty(secrets)
            .map_err(|e| AuthError::Store(e.to_string()))?;
        let write_failed =
            |e: std::io::Error| AuthError::Store(format!("failed to write {}: {e}", self.path.display()));
        let mut file = private_file_options()
            .open(&self.path)
            .await
            .map_err(write_failed)?;
        file.write_all(json.as_bytes()).await.map_err(write_failed)?;
        file.flush().await.map_err(write_failed)?;
        // A file left over from an older run keeps its mode on open.
        restrict_permissions(&self.path).await
    }
}

// Owner-only from the moment of creation on unix.
fn private_file_options() -> tokio::fs::OpenOptions {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    options
}

#[cfg(unix)]
async fn restrict_permissions(path: &std::path::Path) -> Result<(), AuthError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| AuthError::Store(format!("failed to restrict {}: {e}", path.display())))
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &std::path::Path) -> Result<(), AuthError> {
    Ok(())
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AuthError> {
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), AuthError> {
        let mut secrets = self.read_all().await?;
        secrets.insert(key.to_string(), value.to_string());
        self.write_all(&secrets).await
    }

    async fn delete(&self, key: &str) -> Result<(), AuthError> {
        let mut secrets = self.read_all().await?;
        if secrets.remove(key).is_some() {
            self.write_all(&secrets).await?;
        }
        Ok(())
    }
}
