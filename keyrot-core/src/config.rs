use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RotationError;
use crate::model::{ManagedTag, UserRecord};
use crate::roster::{ColumnMap, RosterEncoding, RosterFormat};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: HostConfig,
    pub identity: IdentityConfig,
    pub roster: RosterConfig,
    pub keys: KeysConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl Config {
    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<(), RotationError> {
        if self.host.hostname.trim().is_empty() {
            return Err(RotationError::Config("host.hostname is empty".to_string()));
        }
        if self.host.admin_user.trim().is_empty() {
            return Err(RotationError::Config("host.admin_user is empty".to_string()));
        }
        if self.host.host_key_policy == HostKeyPolicy::Pinned
            && self.host.host_key_fingerprints.is_empty()
        {
            return Err(RotationError::Config(
                "host_key_policy = \"pinned\" requires host.host_key_fingerprints".to_string(),
            ));
        }
        if self.rotation.workers == 0 {
            return Err(RotationError::Config("rotation.workers must be at least 1".to_string()));
        }
        if self.rotation.command_timeout_secs == 0 {
            return Err(RotationError::Config(
                "rotation.command_timeout_secs must be at least 1".to_string(),
            ));
        }
        if !self.rotation.authorized_keys_template.starts_with('/') {
            return Err(RotationError::Config(
                "rotation.authorized_keys_template must be an absolute path".to_string(),
            ));
        }
        if self.notify.kind == NotifyKind::Command && self.notify.program.is_none() {
            return Err(RotationError::Config(
                "notify.kind = \"command\" requires notify.program".to_string(),
            ));
        }
        Ok(())
    }
}

/// How the channel decides whether to trust the remote host key.
///
/// There is deliberately no default: the config must name a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Accept only keys whose SHA-256 fingerprint is listed.
    Pinned,
    /// Accept only keys already present in a known_hosts file.
    KnownHosts,
    /// Accept any key, recording it in known_hosts.  Logged loudly.
    TrustOnFirstUse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub admin_user: String,
    pub host_key_policy: HostKeyPolicy,
    /// `SHA256:…` fingerprints accepted under [`HostKeyPolicy::Pinned`].
    #[serde(default)]
    pub host_key_fingerprints: Vec<String>,
    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl HostConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub private_key_path: PathBuf,
    /// When set, the key file is a JSON document and the PEM lives in this field.
    #[serde(default)]
    pub json_field: Option<String>,
    /// Environment variable holding the key passphrase, if the key is encrypted.
    #[serde(default)]
    pub passphrase_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterConfig {
    pub path: PathBuf,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_encoding")]
    pub encoding: RosterEncoding,
    #[serde(flatten)]
    pub columns: ColumnMap,
}

impl RosterConfig {
    pub fn format(&self) -> RosterFormat {
        RosterFormat {
            delimiter: self.delimiter,
            encoding: self.encoding,
            columns: self.columns.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysConfig {
    pub directory: PathBuf,
    #[serde(default = "default_key_file_template")]
    pub file_template: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Any failed user makes the process exit non-zero.
    Fatal,
    /// Failed users are reported but the process exits zero.
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    #[serde(default = "default_tag_template")]
    pub tag_template: String,
    #[serde(default = "default_authorized_keys_template")]
    pub authorized_keys_template: String,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_failure_policy")]
    pub failure_policy: FailurePolicy,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            tag_template: default_tag_template(),
            authorized_keys_template: default_authorized_keys_template(),
            command_timeout_secs: default_command_timeout_secs(),
            workers: default_workers(),
            failure_policy: default_failure_policy(),
        }
    }
}

impl RotationConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn tag_for(&self, user: &UserRecord) -> Result<ManagedTag, RotationError> {
        ManagedTag::parse(&render_template(&self.tag_template, user, None))
    }

    /// The remote authorized_keys path for `user`.
    ///
    /// Rejects rendered paths with `..` components or characters outside the
    /// portable filename set.
    pub fn authorized_keys_path(&self, user: &UserRecord) -> Result<String, RotationError> {
        let path = render_template(&self.authorized_keys_template, user, None);
        let bad_char = path
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-')));
        if bad_char || path.split('/').any(|seg| seg == "..") || !path.starts_with('/') {
            return Err(RotationError::InvalidRecord(format!(
                "authorized_keys path {path:?} is not an absolute portable path"
            )));
        }
        Ok(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyKind {
    /// Log the notice instead of delivering it.
    Log,
    /// Pipe the message to an external program (e.g. `sendmail`).
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_notify_kind")]
    pub kind: NotifyKind,
    #[serde(default)]
    pub program: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_sender")]
    pub sender: String,
    #[serde(default = "default_subject_template")]
    pub subject_template: String,
    #[serde(default = "default_body_template")]
    pub body_template: String,
    #[serde(default)]
    pub attachment: Option<PathBuf>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            kind: default_notify_kind(),
            program: None,
            args: Vec::new(),
            sender: default_sender(),
            subject_template: default_subject_template(),
            body_template: default_body_template(),
            attachment: None,
        }
    }
}

/// Substitute `{username}`, `{account_id}`, `{email}` and, when given,
/// `{outcome}` in `template`.  Unknown placeholders are left as-is.
pub fn render_template(template: &str, user: &UserRecord, outcome: Option<&str>) -> String {
    let mut out = template
        .replace("{username}", user.local_username.as_str())
        .replace("{account_id}", user.account_id.as_str())
        .replace("{email}", &user.email);
    if let Some(outcome) = outcome {
        out = out.replace("{outcome}", outcome);
    }
    out
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_delimiter() -> char {
    ','
}

fn default_encoding() -> RosterEncoding {
    RosterEncoding::Utf8
}

fn default_key_file_template() -> String {
    "jump_host_name_{username}.pub".to_string()
}

fn default_tag_template() -> String {
    "{username}@remote".to_string()
}

fn default_authorized_keys_template() -> String {
    "/home/{username}/.ssh/authorized_keys".to_string()
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_workers() -> usize {
    1
}

fn default_failure_policy() -> FailurePolicy {
    FailurePolicy::Fatal
}

fn default_notify_kind() -> NotifyKind {
    NotifyKind::Log
}

fn default_sender() -> String {
    "no-reply@localhost".to_string()
}

fn default_subject_template() -> String {
    "SSH key rotation - {username}".to_string()
}

fn default_body_template() -> String {
    "A new SSH key pair for user {username} has been generated and is {outcome} \
on the jump host.\n\nDownload the private key jump_host_name_{username} from the \
{account_id} key store and update your SSH connection settings to use it.\n"
        .to_string()
}
