//! Error taxonomy for a rotation run.
//!
//! Run-level errors (`MalformedRoster`, `Connection`, `Config`) abort the whole
//! run.  Everything else is caught at the reconciler boundary and turned into
//! a per-user [`ReconciliationOutcome::Failed`][crate::ReconciliationOutcome].

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum RotationError {
    #[error("malformed roster at row {row}: {reason}")]
    MalformedRoster { row: usize, reason: String },

    #[error("cannot open channel to {host}: {reason}")]
    Connection { host: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("public key not found for {account_id}/{local_username}")]
    KeyNotFound {
        account_id: String,
        local_username: String,
    },

    #[error("secret retrieval failed: {0}")]
    SecretRetrieval(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("{step} exited with status {exit_code}: {stderr}")]
    CommandExecution {
        step: Step,
        exit_code: u32,
        stderr: String,
    },

    #[error("{step} did not complete within {}s", after.as_secs())]
    Timeout { step: Step, after: Duration },

    #[error("could not restrict authorized_keys mode: {0}")]
    Permission(String),

    #[error("{count} lines carry the managed tag; refusing to pick one")]
    AmbiguousState { count: usize },

    #[error("post-write verification mismatch: {0}")]
    VerificationMismatch(String),

    #[error("notification failed: {0}")]
    Notification(String),

    #[error("channel error during {step}: {source}")]
    Channel {
        step: Step,
        #[source]
        source: ChannelError,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RotationError {
    /// Machine-readable classification used in the run summary.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::MalformedRoster { .. } => FailureKind::MalformedRoster,
            Self::Connection { .. } => FailureKind::Connection,
            Self::Config(_) => FailureKind::Config,
            Self::KeyNotFound { .. } => FailureKind::KeyNotFound,
            Self::SecretRetrieval(_) => FailureKind::SecretRetrieval,
            Self::InvalidRecord(_) => FailureKind::InvalidRecord,
            Self::InvalidKeyMaterial(_) => FailureKind::InvalidKeyMaterial,
            Self::CommandExecution { .. } | Self::Channel { .. } => FailureKind::CommandExecution,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Permission(_) => FailureKind::Permission,
            Self::AmbiguousState { .. } => FailureKind::AmbiguousState,
            Self::VerificationMismatch(_) => FailureKind::VerificationMismatch,
            Self::Notification(_) => FailureKind::Notification,
            Self::Other(_) => FailureKind::Other,
        }
    }

    /// Whether this error aborts the whole run rather than a single user.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(
            self,
            Self::MalformedRoster { .. } | Self::Connection { .. } | Self::Config(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MalformedRoster,
    Connection,
    Config,
    KeyNotFound,
    SecretRetrieval,
    InvalidRecord,
    InvalidKeyMaterial,
    CommandExecution,
    Timeout,
    Permission,
    AmbiguousState,
    VerificationMismatch,
    Notification,
    Other,
}

impl FailureKind {
    /// Failures that suggest the credential file may be in a corrupted state.
    pub fn is_high_priority(self) -> bool {
        matches!(self, Self::VerificationMismatch | Self::AmbiguousState)
    }
}

/// The reconciler step a remote command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Probe,
    Replace,
    Append,
    Chmod,
    Verify,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Probe => "probe",
            Self::Replace => "replace",
            Self::Append => "append",
            Self::Chmod => "chmod",
            Self::Verify => "verify",
        })
    }
}

/// Transport-level failure of a single remote command.
#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("ssh transport error: {0}")]
    Transport(String),
}
