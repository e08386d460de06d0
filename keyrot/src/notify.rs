//! Rotation notices.
//!
//! `log` only records the notice; `command` pipes an RFC 5322 message to an
//! external program such as `sendmail -t -i`.  The recipient address is
//! appended as the final argument and never passes through a shell.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use keyrot_core::config::{NotifyConfig, NotifyKind};
use keyrot_core::{Notice, Notifier, RotationError, UserRecord};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Upper bound on one delivery program run.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Environment variable that carries the attachment path to the program.
pub const ATTACHMENT_ENV: &str = "KEYROT_ATTACHMENT";

pub fn build(config: &NotifyConfig) -> Result<Arc<dyn Notifier>> {
    match config.kind {
        NotifyKind::Log => Ok(Arc::new(LogNotifier)),
        NotifyKind::Command => {
            let program = config
                .program
                .clone()
                .ok_or_else(|| anyhow!("notify.kind = \"command\" requires notify.program"))?;
            Ok(Arc::new(CommandNotifier {
                program,
                args: config.args.clone(),
                sender: config.sender.clone(),
                timeout: DELIVERY_TIMEOUT,
            }))
        }
    }
}

/// Records the notice in the log instead of sending it.
#[derive(Debug)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user: &UserRecord, notice: &Notice) -> Result<(), RotationError> {
        info!(
            user = %user.local_username,
            to = %user.email,
            subject = %notice.subject,
            attachment = ?notice.attachment,
            "rotation notice (log only)"
        );
        Ok(())
    }
}

#[derive(Debug)]
pub struct CommandNotifier {
    program: PathBuf,
    args: Vec<String>,
    sender: String,
    timeout: Duration,
}

impl CommandNotifier {
    fn message(&self, to: &str, notice: &Notice) -> String {
        format!(
            "From: {}\nTo: {to}\nSubject: {}\nContent-Type: text/plain; charset=utf-8\n\n{}\n",
            self.sender, notice.subject, notice.body
        )
    }

    async fn deliver(&self, to: &str, notice: &Notice) -> Result<(), RotationError> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .arg(to)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = &notice.attachment {
            command.env(ATTACHMENT_ENV, path);
        }

        let mut child = command.spawn().map_err(|e| {
            RotationError::Notification(format!("cannot start {}: {e}", self.program.display()))
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(self.message(to, notice).as_bytes())
                .await
                .map_err(|e| RotationError::Notification(format!("writing message: {e}")))?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                RotationError::Notification(format!(
                    "{} did not finish within {}s",
                    self.program.display(),
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| RotationError::Notification(e.to_string()))?;

        if !output.status.success() {
            return Err(RotationError::Notification(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Reject addresses that could be read as an option or inject headers.
fn check_recipient(email: &str) -> Result<(), RotationError> {
    let plausible = !email.is_empty()
        && !email.starts_with('-')
        && email.contains('@')
        && !email.chars().any(|c| c.is_whitespace() || c.is_control());
    if plausible {
        Ok(())
    } else {
        Err(RotationError::Notification(format!(
            "refusing to deliver to address {email:?}"
        )))
    }
}

#[async_trait::async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, user: &UserRecord, notice: &Notice) -> Result<(), RotationError> {
        check_recipient(&user.email)?;
        self.deliver(&user.email, notice).await?;
        debug!(user = %user.local_username, program = %self.program.display(), "notice delivered");
        Ok(())
    }
}
