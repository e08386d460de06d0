use std::path::{Path, PathBuf};

use keyrot_core::{AccountId, KeyMaterialSource, LocalUsername, RotationError};
use tracing::debug;

/// Public keys stored as `<directory>/<account_id>/<file_template>`, where
/// `{username}` in the template is replaced by the local username.
#[derive(Debug, Clone)]
pub struct FileKeySource {
    directory: PathBuf,
    file_template: String,
}

impl FileKeySource {
    pub fn new(directory: impl Into<PathBuf>, file_template: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            file_template: file_template.into(),
        }
    }

    /// Where the key for this account/user is expected.
    pub fn key_path(&self, account_id: &AccountId, local_username: &LocalUsername) -> PathBuf {
        let file = self
            .file_template
            .replace("{username}", local_username.as_str())
            .replace("{account_id}", account_id.as_str());
        self.directory.join(account_id.as_str()).join(file)
    }
}

#[async_trait::async_trait]
impl KeyMaterialSource for FileKeySource {
    async fn public_key(
        &self,
        account_id: &AccountId,
        local_username: &LocalUsername,
    ) -> Result<String, RotationError> {
        let path = self.key_path(account_id, local_username);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                debug!(path = %path.display(), "public key read");
                String::from_utf8(bytes).map_err(|_| {
                    RotationError::InvalidKeyMaterial(format!("{} is not UTF-8", display(&path)))
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RotationError::KeyNotFound {
                account_id: account_id.to_string(),
                local_username: local_username.to_string(),
            }),
            Err(e) => Err(RotationError::SecretRetrieval(format!(
                "cannot read {}: {e}",
                display(&path)
            ))),
        }
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}
