//! Key Reconciler.
//!
//! Brings one user's authorized_keys file into agreement with the new key:
//!
//! ```text
//! Start ─► Probing ─┬─► Replace ─┐
//!                   ├─► Append ──┼─► chmod 600 ─► Verified | Failed
//!                   ├─► Skipped (already current, nothing written)
//!                   └─► Failed  (ambiguous: >1 tagged line)
//! ```
//!
//! Every command runs through [`Reconciler::run`], which bounds it with the
//! configured timeout and turns a non-zero exit into a typed error.  All
//! errors are returned as [`ReconciliationOutcome::Failed`]; nothing here
//! aborts the run.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::command::AccountCommands;
use crate::error::{RotationError, Step};
use crate::model::{PublicKeyMaterial, ReconciliationOutcome, SkipReason, UserRecord};
use crate::{CommandOutput, RemoteChannel, RemoteCommand};

/// Mode the managed file must have after any write.
const OWNER_RW: u32 = 0o600;

/// authorized_keys as seen by a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    /// Permission bits, or `None` when the file does not exist.
    pub mode: Option<u32>,
    pub lines: Vec<String>,
}

impl FileState {
    /// Parse the output of [`PROBE_SCRIPT`][crate::command::PROBE_SCRIPT].
    pub fn from_probe(stdout: &str) -> Result<Self, RotationError> {
        let (first, rest) = stdout.split_once('\n').unwrap_or((stdout, ""));
        if first.trim() == "absent" {
            return Ok(Self {
                mode: None,
                lines: Vec::new(),
            });
        }
        let mode = u32::from_str_radix(first.trim(), 8).map_err(|_| {
            RotationError::Other(anyhow::anyhow!(
                "unexpected probe output: first line {first:?} is not an octal mode"
            ))
        })?;
        Ok(Self {
            mode: Some(mode & 0o7777),
            lines: rest.lines().map(str::to_string).collect(),
        })
    }

    fn tagged<'a>(&'a self, key: &'a PublicKeyMaterial) -> impl Iterator<Item = (usize, &'a String)> {
        self.lines
            .iter()
            .enumerate()
            .filter(move |(_, line)| key.tag().marks(line))
    }
}

/// What a probe decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    Replace { index: usize },
    Append,
    Current,
}

fn plan(state: &FileState, key: &PublicKeyMaterial) -> Result<Plan, RotationError> {
    let tagged: Vec<(usize, &String)> = state.tagged(key).collect();
    match tagged.as_slice() {
        [] => Ok(Plan::Append),
        [(_, line)] if line.trim_end() == key.line() => Ok(Plan::Current),
        [(index, _)] => Ok(Plan::Replace { index: *index }),
        many => Err(RotationError::AmbiguousState { count: many.len() }),
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    command_timeout: Duration,
}

impl Reconciler {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    /// Reconcile `user`'s authorized_keys at `path` with `key`.
    ///
    /// The whole probe→apply→verify sequence runs on `channel` without
    /// yielding it to anyone else.
    pub async fn reconcile(
        &self,
        channel: &mut dyn RemoteChannel,
        user: &UserRecord,
        path: &str,
        key: &PublicKeyMaterial,
    ) -> ReconciliationOutcome {
        match self.try_reconcile(channel, user, path, key).await {
            Ok(outcome) => outcome,
            Err(e) => ReconciliationOutcome::Failed(e),
        }
    }

    async fn try_reconcile(
        &self,
        channel: &mut dyn RemoteChannel,
        user: &UserRecord,
        path: &str,
        key: &PublicKeyMaterial,
    ) -> Result<ReconciliationOutcome, RotationError> {
        let username = &user.local_username;
        let commands = AccountCommands::new(username, path);

        let before = self.probe(channel, &commands, Step::Probe).await?;
        let plan = plan(&before, key)?;
        debug!(user = %username, ?plan, mode = ?before.mode, lines = before.lines.len(), "probed authorized_keys");

        let outcome = match plan {
            Plan::Current => {
                if let Some(mode) = before.mode
                    && mode != OWNER_RW
                {
                    warn!(
                        user = %username,
                        mode = %format!("{mode:o}"),
                        "managed key is current but authorized_keys mode is not 600"
                    );
                }
                return Ok(ReconciliationOutcome::Skipped(SkipReason::AlreadyCurrent));
            }
            Plan::Replace { .. } => {
                self.run(channel, Step::Replace, commands.replace(key)).await?;
                ReconciliationOutcome::Replaced
            }
            Plan::Append => {
                self.run(channel, Step::Append, commands.append(key)).await?;
                ReconciliationOutcome::Appended
            }
        };

        match self.run(channel, Step::Chmod, commands.chmod()).await {
            Ok(_) => {}
            Err(RotationError::CommandExecution { stderr, exit_code, .. }) => {
                return Err(RotationError::Permission(format!(
                    "chmod exited with status {exit_code}: {stderr}"
                )));
            }
            Err(e) => return Err(e),
        }

        let after = self.probe(channel, &commands, Step::Verify).await?;
        verify(&before, &after, plan, key)?;

        info!(
            user = %username,
            outcome = outcome.label(),
            fingerprint = key.fingerprint(),
            "authorized_keys updated"
        );
        Ok(outcome)
    }

    async fn probe(
        &self,
        channel: &mut dyn RemoteChannel,
        commands: &AccountCommands<'_>,
        step: Step,
    ) -> Result<FileState, RotationError> {
        let out = self.run(channel, step, commands.probe()).await?;
        FileState::from_probe(&out.stdout)
    }

    /// Execute one command with the per-command timeout.
    async fn run(
        &self,
        channel: &mut dyn RemoteChannel,
        step: Step,
        command: RemoteCommand,
    ) -> Result<CommandOutput, RotationError> {
        let out = tokio::time::timeout(self.command_timeout, channel.execute(&command))
            .await
            .map_err(|_| RotationError::Timeout {
                step,
                after: self.command_timeout,
            })?
            .map_err(|source| RotationError::Channel { step, source })?;

        if !out.success() {
            return Err(RotationError::CommandExecution {
                step,
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out)
    }
}

/// Check the post-write state against what the plan intended.
fn verify(
    before: &FileState,
    after: &FileState,
    plan: Plan,
    key: &PublicKeyMaterial,
) -> Result<(), RotationError> {
    let mismatch = |why: String| Err(RotationError::VerificationMismatch(why));

    let tagged: Vec<(usize, &String)> = after.tagged(key).collect();
    let [(tagged_index, tagged_line)] = tagged.as_slice() else {
        return mismatch(format!(
            "expected exactly one tagged line, found {}",
            tagged.len()
        ));
    };
    if tagged_line.trim_end() != key.line() {
        return mismatch("tagged line does not match the new key".to_string());
    }
    match after.mode {
        Some(OWNER_RW) => {}
        Some(mode) => return mismatch(format!("mode is {mode:o}, expected 600")),
        None => return mismatch("file is absent after write".to_string()),
    }

    match plan {
        Plan::Replace { index } => {
            if after.lines.len() != before.lines.len() || *tagged_index != index {
                return mismatch("replace changed the line layout".to_string());
            }
            let others_kept = before
                .lines
                .iter()
                .zip(&after.lines)
                .enumerate()
                .all(|(i, (old, new))| i == index || old == new);
            if !others_kept {
                return mismatch("replace altered unrelated lines".to_string());
            }
        }
        Plan::Append => {
            let kept = &after.lines[..before.lines.len().min(after.lines.len())];
            if after.lines.len() != before.lines.len() + 1 || kept != before.lines.as_slice() {
                return mismatch("append did not preserve existing lines".to_string());
            }
        }
        Plan::Current => {}
    }
    Ok(())
}
