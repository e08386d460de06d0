//! In-memory stand-ins for the remote host and collaborators.
//!
//! [`FakeChannel`] interprets the argv that [`AccountCommands`] builds
//! (`sudo … sh -c SCRIPT sh PATH`, optionally behind `env K=V`) against a
//! shared file map, so reconciler and orchestrator tests exercise the real
//! command construction.
//!
//! [`AccountCommands`]: crate::command::AccountCommands

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::command::{APPEND_SCRIPT, LINE_ENV, PROBE_SCRIPT, REPLACE_SCRIPT, TAG_ENV};
use crate::{
    AccountId, ChannelConnector, ChannelError, CommandOutput, KeyMaterialSource, LocalUsername,
    Notice, Notifier, RemoteChannel, RemoteCommand, RosterSource, RotationError, UserRecord,
};

pub const KEY_A: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIDjlDE7M0qxmBVk3SfXqXh8C2l+U85rltVy6JDolkQFz old@laptop";
pub const KEY_B: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAINDy2MyWfMA5L0W39D2ERE99SxGWmKbNq6raL6Dtprcp x";

pub fn user(row: usize, name: &str) -> UserRecord {
    UserRecord {
        row,
        account_id: AccountId::parse(&format!("acct-{name}")).unwrap(),
        local_username: LocalUsername::parse(name).unwrap(),
        email: format!("{name}@example.com"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Probe,
    Replace,
    Append,
    Chmod,
}

#[derive(Debug, Clone)]
enum Effect {
    Exit { code: u32, stderr: String },
    Hang,
    /// Report success without touching the file.
    NoOp,
}

#[derive(Debug, Clone)]
pub struct Fault {
    user: String,
    op: FakeOp,
    effect: Effect,
}

impl Fault {
    pub fn exit(user: &str, op: FakeOp, code: u32, stderr: &str) -> Self {
        Self {
            user: user.to_string(),
            op,
            effect: Effect::Exit {
                code,
                stderr: stderr.to_string(),
            },
        }
    }

    pub fn hang(user: &str, op: FakeOp) -> Self {
        Self {
            user: user.to_string(),
            op,
            effect: Effect::Hang,
        }
    }

    pub fn noop(user: &str, op: FakeOp) -> Self {
        Self {
            user: user.to_string(),
            op,
            effect: Effect::NoOp,
        }
    }
}

#[derive(Default)]
struct State {
    files: HashMap<String, (String, u32)>,
    commands: Vec<RemoteCommand>,
    /// (user, op, channel id)
    ops: Vec<(String, FakeOp, usize)>,
    faults: Vec<Fault>,
    opened: usize,
    closed: usize,
}

/// Shared state of the simulated host.  Clones observe the same files.
#[derive(Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<State>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_file(&self, path: &str, content: &str, mode: u32) {
        self.lock()
            .files
            .insert(path.to_string(), (content.to_string(), mode));
    }

    pub fn file(&self, path: &str) -> Option<(String, u32)> {
        self.lock().files.get(path).cloned()
    }

    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    pub fn channel(&self) -> FakeChannel {
        let mut state = self.lock();
        let id = state.opened;
        state.opened += 1;
        FakeChannel {
            host: self.clone(),
            id,
            closed: false,
        }
    }

    /// Every operation attempted, in order.
    pub fn ops(&self) -> Vec<FakeOp> {
        self.lock().ops.iter().map(|(_, op, _)| *op).collect()
    }

    pub fn ops_for(&self, user: &str) -> Vec<FakeOp> {
        self.lock()
            .ops
            .iter()
            .filter(|(u, _, _)| u == user)
            .map(|(_, op, _)| *op)
            .collect()
    }

    /// Ids of the channels that ran `user`'s commands, deduplicated.
    pub fn channels_for(&self, user: &str) -> HashSet<usize> {
        self.lock()
            .ops
            .iter()
            .filter(|(u, _, _)| u == user)
            .map(|(_, _, id)| *id)
            .collect()
    }

    /// Ids of every channel that ran at least one command.
    pub fn busy_channels(&self) -> HashSet<usize> {
        self.lock().ops.iter().map(|(_, _, id)| *id).collect()
    }

    pub fn commands(&self) -> Vec<RemoteCommand> {
        self.lock().commands.clone()
    }

    pub fn opened(&self) -> usize {
        self.lock().opened
    }

    pub fn closed(&self) -> usize {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Run one command against the file map.  `None` means the command hangs.
    fn apply(&self, channel: usize, command: &RemoteCommand) -> Option<CommandOutput> {
        let mut state = self.lock();
        state.commands.push(command.clone());

        let parsed = match Parsed::from_argv(command.argv()) {
            Ok(parsed) => parsed,
            Err(why) => return Some(exit(2, why)),
        };
        state.ops.push((parsed.user.clone(), parsed.op, channel));

        let fault = state
            .faults
            .iter()
            .find(|f| f.user == parsed.user && f.op == parsed.op)
            .map(|f| f.effect.clone());
        match fault {
            Some(Effect::Hang) => return None,
            Some(Effect::NoOp) => {
                let stdout = if parsed.op == FakeOp::Probe { "absent\n" } else { "" };
                return Some(CommandOutput {
                    stdout: stdout.to_string(),
                    ..CommandOutput::default()
                });
            }
            Some(Effect::Exit { code, stderr }) => return Some(exit(code, &stderr)),
            None => {}
        }

        if !parsed.path.starts_with(&format!("/home/{}/", parsed.user)) {
            return Some(exit(1, "Permission denied"));
        }

        let files = &mut state.files;
        let out = match parsed.op {
            FakeOp::Probe => match files.get(&parsed.path) {
                Some((content, mode)) => CommandOutput {
                    stdout: format!("{mode:o}\n{content}"),
                    ..CommandOutput::default()
                },
                None => CommandOutput {
                    stdout: "absent\n".to_string(),
                    ..CommandOutput::default()
                },
            },
            FakeOp::Replace => {
                let Some((content, _)) = files.get(&parsed.path) else {
                    return Some(exit(2, "awk: cannot open file"));
                };
                let tag = parsed.env.get(TAG_ENV).cloned().unwrap_or_default();
                let line = parsed.env.get(LINE_ENV).cloned().unwrap_or_default();
                let rewritten: String = content
                    .lines()
                    .map(|l| {
                        if l.split_whitespace().next_back() == Some(tag.as_str()) {
                            format!("{line}\n")
                        } else {
                            format!("{l}\n")
                        }
                    })
                    .collect();
                files.insert(parsed.path.clone(), (rewritten, 0o600));
                CommandOutput::default()
            }
            FakeOp::Append => {
                let line = parsed.env.get(LINE_ENV).cloned().unwrap_or_default();
                let entry = files
                    .entry(parsed.path.clone())
                    .or_insert_with(|| (String::new(), 0o600));
                if !entry.0.is_empty() && !entry.0.ends_with('\n') {
                    entry.0.push('\n');
                }
                entry.0.push_str(&line);
                entry.0.push('\n');
                CommandOutput::default()
            }
            FakeOp::Chmod => match files.get_mut(&parsed.path) {
                Some(entry) => {
                    entry.1 = 0o600;
                    CommandOutput::default()
                }
                None => exit(1, "chmod: No such file or directory"),
            },
        };
        Some(out)
    }
}

fn exit(code: u32, stderr: &str) -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: code,
    }
}

struct Parsed {
    user: String,
    op: FakeOp,
    path: String,
    env: HashMap<String, String>,
}

impl Parsed {
    fn from_argv(argv: &[String]) -> Result<Self, &'static str> {
        let [sudo, n, h, u, user, dashes, rest @ ..] = argv else {
            return Err("not a sudo command");
        };
        if [sudo, n, h, u, dashes].map(String::as_str) != ["sudo", "-n", "-H", "-u", "--"] {
            return Err("unexpected sudo flags");
        }

        let mut env = HashMap::new();
        let mut rest = rest;
        if rest.first().map(String::as_str) == Some("env") {
            rest = &rest[1..];
            while let Some((k, v)) = rest.first().and_then(|a| a.split_once('=')) {
                env.insert(k.to_string(), v.to_string());
                rest = &rest[1..];
            }
        }

        match rest {
            [sh, c, body, zero, path] if sh == "sh" && c == "-c" && zero == "sh" => {
                let op = match body.as_str() {
                    b if b == PROBE_SCRIPT => FakeOp::Probe,
                    b if b == REPLACE_SCRIPT => FakeOp::Replace,
                    b if b == APPEND_SCRIPT => FakeOp::Append,
                    _ => return Err("unknown script"),
                };
                Ok(Self {
                    user: user.clone(),
                    op,
                    path: path.clone(),
                    env,
                })
            }
            [chmod, mode, dd, path] if chmod == "chmod" && mode == "600" && dd == "--" => Ok(Self {
                user: user.clone(),
                op: FakeOp::Chmod,
                path: path.clone(),
                env,
            }),
            _ => Err("unrecognised command"),
        }
    }
}

pub struct FakeChannel {
    host: FakeHost,
    id: usize,
    closed: bool,
}

#[async_trait::async_trait]
impl RemoteChannel for FakeChannel {
    async fn execute(&mut self, command: &RemoteCommand) -> Result<CommandOutput, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        // A real channel awaits the network; give other workers a turn.
        tokio::task::yield_now().await;
        // The lock is released inside `apply`, before any await.
        match self.host.apply(self.id, command) {
            Some(out) => Ok(out),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        self.closed = true;
        self.host.lock().closed += 1;
        Ok(())
    }
}

pub struct FakeConnector {
    pub host: FakeHost,
    /// Refuse connections once this many have succeeded.
    pub fail_after: Option<usize>,
}

impl FakeConnector {
    pub fn new(host: FakeHost) -> Self {
        Self {
            host,
            fail_after: None,
        }
    }
}

#[async_trait::async_trait]
impl ChannelConnector for FakeConnector {
    fn host(&self) -> &str {
        "jump.example"
    }

    async fn connect(&self) -> Result<Box<dyn RemoteChannel>, RotationError> {
        if let Some(limit) = self.fail_after
            && self.host.opened() >= limit
        {
            return Err(RotationError::Connection {
                host: self.host().to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(Box::new(self.host.channel()))
    }
}

pub struct FakeRoster(pub String);

#[async_trait::async_trait]
impl RosterSource for FakeRoster {
    async fn fetch(&self) -> Result<Vec<u8>, RotationError> {
        Ok(self.0.clone().into_bytes())
    }
}

/// Public keys keyed by local username.
#[derive(Default)]
pub struct FakeKeys(pub HashMap<String, String>);

impl FakeKeys {
    pub fn with(mut self, user: &str, key: &str) -> Self {
        self.0.insert(user.to_string(), key.to_string());
        self
    }
}

#[async_trait::async_trait]
impl KeyMaterialSource for FakeKeys {
    async fn public_key(
        &self,
        account_id: &AccountId,
        local_username: &LocalUsername,
    ) -> Result<String, RotationError> {
        self.0
            .get(local_username.as_str())
            .cloned()
            .ok_or_else(|| RotationError::KeyNotFound {
                account_id: account_id.to_string(),
                local_username: local_username.to_string(),
            })
    }
}

#[derive(Default)]
pub struct FakeNotifier {
    pub sent: Mutex<Vec<(String, Notice)>>,
    pub failing: HashSet<String>,
}

impl FakeNotifier {
    pub fn failing_for(user: &str) -> Self {
        Self {
            failing: HashSet::from([user.to_string()]),
            ..Self::default()
        }
    }

    pub fn recipients(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(u, _)| u.clone()).collect()
    }
}

#[async_trait::async_trait]
impl Notifier for FakeNotifier {
    async fn notify(&self, user: &UserRecord, notice: &Notice) -> Result<(), RotationError> {
        let name = user.local_username.to_string();
        if self.failing.contains(&name) {
            return Err(RotationError::Notification("smtp relay unavailable".to_string()));
        }
        self.sent.lock().unwrap().push((name, notice.clone()));
        Ok(())
    }
}
