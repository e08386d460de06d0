use std::path::PathBuf;

use keyrot_core::{AdminIdentity, AdminIdentitySource, RotationError};
use tracing::debug;
use zeroize::Zeroizing;

/// Loads the admin private key from disk.
///
/// With `json_field` set the file is a JSON secret document and the key is
/// the string stored under that field (e.g. `{"key": "-----BEGIN …"}`).
#[derive(Debug, Clone)]
pub struct FileIdentitySource {
    path: PathBuf,
    json_field: Option<String>,
    passphrase_env: Option<String>,
}

impl FileIdentitySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            json_field: None,
            passphrase_env: None,
        }
    }

    pub fn with_json_field(mut self, field: Option<String>) -> Self {
        self.json_field = field;
        self
    }

    pub fn with_passphrase_env(mut self, var: Option<String>) -> Self {
        self.passphrase_env = var;
        self
    }

    fn extract(&self, raw: &str) -> Result<Zeroizing<String>, RotationError> {
        let Some(field) = &self.json_field else {
            return Ok(Zeroizing::new(raw.to_string()));
        };
        let doc: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
            RotationError::SecretRetrieval(format!(
                "{} is not a JSON document: line {} column {}",
                self.path.display(),
                e.line(),
                e.column()
            ))
        })?;
        doc.get(field)
            .and_then(serde_json::Value::as_str)
            .map(|key| Zeroizing::new(key.to_string()))
            .ok_or_else(|| {
                RotationError::SecretRetrieval(format!(
                    "{} has no string field {field:?}",
                    self.path.display()
                ))
            })
    }
}

#[async_trait::async_trait]
impl AdminIdentitySource for FileIdentitySource {
    async fn admin_identity(&self) -> Result<AdminIdentity, RotationError> {
        crate::warn_if_exposed(&self.path, "admin identity file");

        let raw = Zeroizing::new(tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            RotationError::SecretRetrieval(format!("cannot read {}: {e}", self.path.display()))
        })?);
        let private_key = self.extract(&raw)?;

        let passphrase = match &self.passphrase_env {
            Some(var) => Some(Zeroizing::new(std::env::var(var).map_err(|_| {
                RotationError::SecretRetrieval(format!("passphrase variable {var} is not set"))
            })?)),
            None => None,
        };

        debug!(path = %self.path.display(), encrypted = passphrase.is_some(), "admin identity loaded");
        Ok(AdminIdentity {
            private_key,
            passphrase,
        })
    }
}
