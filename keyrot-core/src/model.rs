//! Roster records, managed key material and reconciliation outcomes.

use serde::{Deserialize, Serialize};
use ssh_key::PublicKey;

use crate::error::{FailureKind, RotationError};

/// Longest account name accepted by common `useradd` implementations.
const MAX_USERNAME_LEN: usize = 32;

/// A remote OS account name restricted to the portable username grammar
/// (`[a-z_][a-z0-9_.-]*`, at most 32 bytes).
///
/// Construction is the only place the grammar is checked; every command the
/// reconciler builds takes a `LocalUsername`, never a raw string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct LocalUsername(String);

impl LocalUsername {
    pub fn parse(raw: &str) -> Result<Self, RotationError> {
        let invalid = |why: &str| RotationError::InvalidRecord(format!("username {raw:?} {why}"));

        if raw.is_empty() {
            return Err(invalid("is empty"));
        }
        if raw.len() > MAX_USERNAME_LEN {
            return Err(invalid("is longer than 32 characters"));
        }
        let mut chars = raw.chars();
        if let Some(first) = chars.next()
            && !(first.is_ascii_lowercase() || first == '_')
        {
            return Err(invalid("must start with a lowercase letter or underscore"));
        }
        if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-')) {
            return Err(invalid("contains characters outside [a-z0-9_.-]"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LocalUsername {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Namespace identifier used to locate a user's key material.
///
/// Used as a single path segment by storage collaborators, so separators and
/// dot-only names are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn parse(raw: &str) -> Result<Self, RotationError> {
        if raw.is_empty()
            || raw == "."
            || raw == ".."
            || raw.contains(['/', '\\', '\0'])
            || raw.chars().any(char::is_control)
        {
            return Err(RotationError::InvalidRecord(format!(
                "account id {raw:?} is not a valid path segment"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One roster row.  Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    /// 1-based physical row in the roster (the header is row 1).
    pub row: usize,
    pub account_id: AccountId,
    pub local_username: LocalUsername,
    pub email: String,
}

/// The comment marker that identifies the system-managed authorized_keys line.
///
/// Restricted to `[A-Za-z0-9._@+-]` so it is always a single
/// whitespace-free field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManagedTag(String);

impl ManagedTag {
    pub fn parse(raw: &str) -> Result<Self, RotationError> {
        if raw.is_empty()
            || !raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '+' | '-'))
        {
            return Err(RotationError::InvalidRecord(format!(
                "managed tag {raw:?} must be non-empty and use only [A-Za-z0-9._@+-]"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `line` is an authorized_keys entry carrying this tag: its last
    /// whitespace-separated field equals the tag exactly.
    pub fn marks(&self, line: &str) -> bool {
        line.split_whitespace().next_back() == Some(self.0.as_str())
    }
}

impl std::fmt::Display for ManagedTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated public key re-serialised with the managed tag as its comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyMaterial {
    tag: ManagedTag,
    line: String,
    fingerprint: String,
}

impl PublicKeyMaterial {
    /// Parse an OpenSSH public key and replace its comment with `tag`.
    ///
    /// Options prefixes, multiple lines and anything `ssh-key` cannot parse
    /// are rejected.
    pub fn new(raw: &str, tag: ManagedTag) -> Result<Self, RotationError> {
        let trimmed = raw.trim();
        if trimmed.contains(['\n', '\r']) {
            return Err(RotationError::InvalidKeyMaterial(
                "public key spans more than one line".to_string(),
            ));
        }
        let mut key = PublicKey::from_openssh(trimmed)
            .map_err(|e| RotationError::InvalidKeyMaterial(e.to_string()))?;
        key.set_comment(tag.as_str());
        let line = key
            .to_openssh()
            .map_err(|e| RotationError::InvalidKeyMaterial(e.to_string()))?;
        let fingerprint = key.fingerprint(ssh_key::HashAlg::Sha256).to_string();
        Ok(Self {
            tag,
            line,
            fingerprint,
        })
    }

    pub fn tag(&self) -> &ManagedTag {
        &self.tag
    }

    /// The exact authorized_keys line to write.
    pub fn line(&self) -> &str {
        &self.line
    }

    /// `SHA256:…` fingerprint, safe to log.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Why a user was left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    AlreadyCurrent,
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::AlreadyCurrent => "already-current",
            Self::Cancelled => "cancelled",
        })
    }
}

/// The outcome without its payload, as reported in the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Replaced,
    Appended,
    Skipped,
    Failed,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replaced => "replaced",
            Self::Appended => "appended",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Per-user result of reconciliation.
///
/// `Replaced` and `Appended` are only produced after the post-write probe
/// confirmed the file content and mode.
#[derive(Debug)]
pub enum ReconciliationOutcome {
    Replaced,
    Appended,
    Skipped(SkipReason),
    Failed(RotationError),
}

impl ReconciliationOutcome {
    /// Whether a write was applied and verified.
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Replaced | Self::Appended)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Replaced => OutcomeKind::Replaced,
            Self::Appended => OutcomeKind::Appended,
            Self::Skipped(_) => OutcomeKind::Skipped,
            Self::Failed(_) => OutcomeKind::Failed,
        }
    }

    pub fn label(&self) -> &'static str {
        self.kind().as_str()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Failed(e) => Some(e.kind()),
            _ => None,
        }
    }
}
