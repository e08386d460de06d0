//! Structured remote commands.
//!
//! A [`RemoteCommand`] is an argv vector.  Channels that can only carry a
//! command *line* (SSH `exec`) render it with [`RemoteCommand::to_shell_line`],
//! which single-quotes every element, so no element can introduce a second
//! command.
//!
//! The reconciler's remote work is done by the fixed scripts below.  Per-user
//! values reach a script only as positional parameters (`"$1"`) or as
//! environment variables set through `env NAME=value`; they are never part of
//! the script text itself.

use std::borrow::Cow;

use crate::model::{LocalUsername, PublicKeyMaterial};

/// Environment variable carrying the managed tag into [`REPLACE_SCRIPT`].
pub const TAG_ENV: &str = "KEYROT_TAG";
/// Environment variable carrying the new key line into the write scripts.
pub const LINE_ENV: &str = "KEYROT_LINE";

/// Prints the octal mode and the content of `$1`, or `absent`.
pub const PROBE_SCRIPT: &str = r#"f="$1"
if [ -e "$f" ]; then
  stat -c '%a' -- "$f" || exit 1
  cat -- "$f" || exit 1
else
  echo absent
fi"#;

/// Rewrites `$1` through a same-directory temp file, swapping every line whose
/// last field equals `$KEYROT_TAG` for `$KEYROT_LINE`.
pub const REPLACE_SCRIPT: &str = r#"set -e
f="$1"
tmp="$(mktemp -- "$f.keyrot.XXXXXX")"
trap 'rm -f -- "$tmp"' EXIT
awk '{ if (NF > 0 && $NF == ENVIRON["KEYROT_TAG"]) print ENVIRON["KEYROT_LINE"]; else print }' "$f" > "$tmp"
chmod 600 -- "$tmp"
mv -f -- "$tmp" "$f"
trap - EXIT"#;

/// Appends `$KEYROT_LINE` to `$1`, adding a separating newline if the file
/// does not already end with one.  Never truncates.
pub const APPEND_SCRIPT: &str = r#"set -e
f="$1"
umask 077
mkdir -p -- "$(dirname -- "$f")"
if [ -s "$f" ] && [ -n "$(tail -c 1 -- "$f")" ]; then
  printf '\n' >> "$f"
fi
printf '%s\n' "$KEYROT_LINE" >> "$f""#;

/// Owner read/write only.
pub const MANAGED_MODE: &str = "600";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    argv: Vec<String>,
}

impl RemoteCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            argv: vec![program.into()],
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Render as a POSIX shell command line with every element quoted.
    pub fn to_shell_line(&self) -> String {
        self.argv
            .iter()
            .map(|a| quote(a))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Quote one argv element.  Empty strings become `''` so they survive as an
/// argument.
fn quote(arg: &str) -> Cow<'_, str> {
    if arg.is_empty() {
        return Cow::Borrowed("''");
    }
    shell_escape::unix::escape(Cow::Borrowed(arg))
}

/// Builds the commands the reconciler runs as a target account.
///
/// Every command is wrapped in `sudo -n -H -u <user> --` so it executes with
/// the target account's privileges, never the admin identity's.
#[derive(Debug, Clone)]
pub struct AccountCommands<'a> {
    user: &'a LocalUsername,
    path: &'a str,
}

impl<'a> AccountCommands<'a> {
    pub fn new(user: &'a LocalUsername, authorized_keys_path: &'a str) -> Self {
        Self {
            user,
            path: authorized_keys_path,
        }
    }

    pub fn probe(&self) -> RemoteCommand {
        self.elevate(script(PROBE_SCRIPT, self.path))
    }

    pub fn replace(&self, key: &PublicKeyMaterial) -> RemoteCommand {
        self.elevate(with_env(
            &[(TAG_ENV, key.tag().as_str()), (LINE_ENV, key.line())],
            script(REPLACE_SCRIPT, self.path),
        ))
    }

    pub fn append(&self, key: &PublicKeyMaterial) -> RemoteCommand {
        self.elevate(with_env(
            &[(LINE_ENV, key.line())],
            script(APPEND_SCRIPT, self.path),
        ))
    }

    pub fn chmod(&self) -> RemoteCommand {
        self.elevate(
            RemoteCommand::new("chmod")
                .arg(MANAGED_MODE)
                .arg("--")
                .arg(self.path),
        )
    }

    fn elevate(&self, inner: RemoteCommand) -> RemoteCommand {
        RemoteCommand::new("sudo")
            .args(["-n", "-H", "-u", self.user.as_str(), "--"])
            .args(inner.argv)
    }
}

fn script(body: &str, path: &str) -> RemoteCommand {
    // `sh` fills `$0`; the path is `$1`.
    RemoteCommand::new("sh").args(["-c", body, "sh", path])
}

fn with_env(vars: &[(&str, &str)], inner: RemoteCommand) -> RemoteCommand {
    RemoteCommand::new("env")
        .args(vars.iter().map(|(k, v)| format!("{k}={v}")))
        .args(inner.argv)
}
