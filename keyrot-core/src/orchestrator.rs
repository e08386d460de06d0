//! Rotation Orchestrator.
//!
//! One run: open the channel, load the roster, reconcile every user, notify
//! the ones whose key actually changed, close every channel.  Channel and
//! roster failures abort the run; everything per-user ends up in the
//! [`RunSummary`].

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::config::{NotifyConfig, RotationConfig, render_template};
use crate::model::{PublicKeyMaterial, ReconciliationOutcome, SkipReason, UserRecord};
use crate::reconcile::Reconciler;
use crate::roster::{self, RosterFormat};
use crate::summary::{RunSummary, UserReport};
use crate::{
    ChannelConnector, KeyMaterialSource, Notice, Notifier, RemoteChannel, RosterSource,
    RotationError,
};

/// External systems a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn ChannelConnector>,
    pub roster: Arc<dyn RosterSource>,
    pub keys: Arc<dyn KeyMaterialSource>,
    pub notifier: Arc<dyn Notifier>,
}

/// Subject/body templates for the rotation notice.
#[derive(Debug, Clone)]
pub struct NoticeTemplate {
    pub subject: String,
    pub body: String,
    pub attachment: Option<PathBuf>,
}

impl From<&NotifyConfig> for NoticeTemplate {
    fn from(config: &NotifyConfig) -> Self {
        Self {
            subject: config.subject_template.clone(),
            body: config.body_template.clone(),
            attachment: config.attachment.clone(),
        }
    }
}

impl NoticeTemplate {
    fn render(&self, user: &UserRecord, outcome: &ReconciliationOutcome) -> Notice {
        Notice {
            subject: render_template(&self.subject, user, Some(outcome.label())),
            body: render_template(&self.body, user, Some(outcome.label())),
            attachment: self.attachment.clone(),
        }
    }
}

pub struct Orchestrator {
    collaborators: Collaborators,
    roster_format: RosterFormat,
    rotation: RotationConfig,
    notice: NoticeTemplate,
    reconciler: Reconciler,
}

impl Orchestrator {
    pub fn new(
        collaborators: Collaborators,
        roster_format: RosterFormat,
        rotation: RotationConfig,
        notice: NoticeTemplate,
    ) -> Self {
        let reconciler = Reconciler::new(rotation.command_timeout());
        Self {
            collaborators,
            roster_format,
            rotation,
            notice,
            reconciler,
        }
    }

    /// Load and validate the roster without touching the remote host.
    pub async fn load_roster(&self) -> Result<Vec<UserRecord>, RotationError> {
        let raw = self.collaborators.roster.fetch().await?;
        let users = roster::parse(&raw, &self.roster_format)?;
        info!(users = users.len(), "roster loaded");
        Ok(users)
    }

    /// Execute one rotation pass.
    ///
    /// Setting `cancel` to `true` stops the run before the next user; users
    /// not yet started are reported as `Skipped(cancelled)`.  Every channel
    /// opened is closed exactly once before this returns, including on error.
    pub async fn run(&self, cancel: watch::Receiver<bool>) -> Result<RunSummary, RotationError> {
        let started_at = Utc::now();
        let host = self.collaborators.connector.host().to_string();

        info!(%host, "opening channel");
        let first = self.collaborators.connector.connect().await?;
        let mut channels = vec![first];

        let result = self.run_on(&mut channels, &cancel).await;

        for (worker, channel) in channels.iter_mut().enumerate() {
            if let Err(e) = channel.close().await {
                warn!(worker, error = %e, "failed to close channel");
            }
        }
        debug!(count = channels.len(), "channels closed");

        let (reports, cancelled) = result?;
        let summary = RunSummary::new(host, started_at, reports, cancelled);
        let c = &summary.counts;
        info!(
            replaced = c.replaced,
            appended = c.appended,
            skipped = c.skipped,
            failed = c.failed,
            cancelled,
            "rotation run finished"
        );
        Ok(summary)
    }

    async fn run_on(
        &self,
        channels: &mut Vec<Box<dyn RemoteChannel>>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<(Vec<UserReport>, bool), RotationError> {
        let users = self.load_roster().await?;

        let wanted = self.rotation.workers.clamp(1, users.len().max(1));
        while channels.len() < wanted {
            match self.collaborators.connector.connect().await {
                Ok(channel) => channels.push(channel),
                Err(e) => {
                    warn!(
                        error = %e,
                        workers = channels.len(),
                        "could not open additional worker channel; continuing with fewer workers"
                    );
                    break;
                }
            }
        }

        let queue = Mutex::new(VecDeque::from(users));
        let per_worker = join_all(
            channels
                .iter_mut()
                .enumerate()
                .map(|(worker, channel)| self.worker(worker, channel.as_mut(), &queue, cancel)),
        )
        .await;

        let mut reports: Vec<UserReport> = per_worker.into_iter().flatten().collect();
        let remaining = queue.into_inner();
        if !remaining.is_empty() {
            warn!(remaining = remaining.len(), "run cancelled; remaining users skipped");
        }
        let cancelled_outcome = ReconciliationOutcome::Skipped(SkipReason::Cancelled);
        reports.extend(
            remaining
                .iter()
                .map(|user| UserReport::new(user, &cancelled_outcome)),
        );

        Ok((reports, *cancel.borrow()))
    }

    /// Pull users off the shared queue until it is empty or the run is
    /// cancelled.  A user's whole probe→verify sequence runs on this
    /// worker's channel.
    async fn worker(
        &self,
        worker: usize,
        channel: &mut dyn RemoteChannel,
        queue: &Mutex<VecDeque<UserRecord>>,
        cancel: &watch::Receiver<bool>,
    ) -> Vec<UserReport> {
        let mut reports = Vec::new();
        loop {
            if *cancel.borrow() {
                debug!(worker, "cancellation requested");
                break;
            }
            let Some(user) = queue.lock().await.pop_front() else {
                break;
            };
            reports.push(self.process(worker, channel, &user).await);
        }
        reports
    }

    async fn process(
        &self,
        worker: usize,
        channel: &mut dyn RemoteChannel,
        user: &UserRecord,
    ) -> UserReport {
        let outcome = match self.prepare(user).await {
            Ok((path, key)) => {
                debug!(worker, user = %user.local_username, fingerprint = key.fingerprint(), "reconciling");
                self.reconciler.reconcile(channel, user, &path, &key).await
            }
            Err(e) => ReconciliationOutcome::Failed(e),
        };

        match &outcome {
            ReconciliationOutcome::Failed(e) if e.kind().is_high_priority() => error!(
                user = %user.local_username,
                row = user.row,
                kind = ?e.kind(),
                "HIGH PRIORITY: {e}"
            ),
            ReconciliationOutcome::Failed(e) => warn!(
                user = %user.local_username,
                row = user.row,
                kind = ?e.kind(),
                "rotation failed: {e}"
            ),
            ReconciliationOutcome::Skipped(reason) => {
                info!(user = %user.local_username, %reason, "skipped")
            }
            ReconciliationOutcome::Replaced | ReconciliationOutcome::Appended => {}
        }

        let mut report = UserReport::new(user, &outcome);
        if outcome.is_verified() {
            let notice = self.notice.render(user, &outcome);
            match self.collaborators.notifier.notify(user, &notice).await {
                Ok(()) => report.notified = true,
                Err(e) => {
                    warn!(user = %user.local_username, error = %e, "notification failed; key change stands");
                    report.notification_error = Some(e.to_string());
                }
            }
        }
        report
    }

    /// Resolve the remote path and the tagged key for `user`.
    async fn prepare(&self, user: &UserRecord) -> Result<(String, PublicKeyMaterial), RotationError> {
        let tag = self.rotation.tag_for(user)?;
        let path = self.rotation.authorized_keys_path(user)?;
        let raw = self
            .collaborators
            .keys
            .public_key(&user.account_id, &user.local_username)
            .await?;
        let key = PublicKeyMaterial::new(&raw, tag)?;
        Ok((path, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{APPEND_SCRIPT, PROBE_SCRIPT, REPLACE_SCRIPT};
    use crate::config::FailurePolicy;
    use crate::summary::{EXIT_CANCELLED, EXIT_OK, EXIT_USER_FAILURE};
    use crate::testing::{
        FakeConnector, FakeHost, FakeKeys, FakeNotifier, FakeOp, FakeRoster, Fault, KEY_A, KEY_B,
    };
    use crate::{FailureKind, ManagedTag, OutcomeKind};

    const HEADER: &str = "aws_username,linux_username,email\n";

    fn roster_of(names: &[&str]) -> String {
        let mut roster = HEADER.to_string();
        for name in names {
            roster.push_str(&format!("acct-{name},{name},{name}@example.com\n"));
        }
        roster
    }

    fn keys_for(names: &[&str], key: &str) -> FakeKeys {
        names
            .iter()
            .fold(FakeKeys::default(), |keys, name| keys.with(name, key))
    }

    fn path(name: &str) -> String {
        format!("/home/{name}/.ssh/authorized_keys")
    }

    fn tagged(name: &str, key: &str) -> String {
        PublicKeyMaterial::new(key, ManagedTag::parse(&format!("{name}@remote")).unwrap())
            .unwrap()
            .line()
            .to_string()
    }

    struct Harness {
        host: FakeHost,
        notifier: Arc<FakeNotifier>,
        orchestrator: Orchestrator,
    }

    fn orchestrator(
        connector: FakeConnector,
        roster: String,
        keys: FakeKeys,
        notifier: Arc<dyn Notifier>,
        rotation: RotationConfig,
    ) -> Orchestrator {
        Orchestrator::new(
            Collaborators {
                connector: Arc::new(connector),
                roster: Arc::new(FakeRoster(roster)),
                keys: Arc::new(keys),
                notifier,
            },
            RosterFormat::default(),
            rotation,
            NoticeTemplate::from(&NotifyConfig::default()),
        )
    }

    fn harness(names: &[&str], key: &str, rotation: RotationConfig) -> Harness {
        let host = FakeHost::new();
        let notifier = Arc::new(FakeNotifier::default());
        let orchestrator = orchestrator(
            FakeConnector::new(host.clone()),
            roster_of(names),
            keys_for(names, key),
            notifier.clone(),
            rotation,
        );
        Harness {
            host,
            notifier,
            orchestrator,
        }
    }

    fn not_cancelled() -> watch::Receiver<bool> {
        let (_tx, rx) = watch::channel(false);
        rx
    }

    #[tokio::test]
    async fn second_run_skips_everyone_and_changes_nothing() {
        let names = ["alice", "bob", "carol"];
        let h = harness(&names, KEY_A, RotationConfig::default());
        h.host.put_file(&path("bob"), "ssh-rsa AAAAx laptop\n", 0o644);
        h.host
            .put_file(&path("carol"), &format!("{}\n", tagged("carol", KEY_B)), 0o600);

        let first = h.orchestrator.run(not_cancelled()).await.unwrap();
        assert_eq!(first.counts.appended, 2);
        assert_eq!(first.counts.replaced, 1);
        let snapshot: Vec<_> = names.iter().map(|n| h.host.file(&path(n))).collect();

        let second = h.orchestrator.run(not_cancelled()).await.unwrap();
        assert_eq!(second.counts.skipped, 3);
        assert!(
            second
                .users
                .iter()
                .all(|u| u.skip_reason == Some(SkipReason::AlreadyCurrent))
        );
        let after: Vec<_> = names.iter().map(|n| h.host.file(&path(n))).collect();
        assert_eq!(snapshot, after);
        assert_eq!(second.exit_code(FailurePolicy::Fatal), EXIT_OK);
    }

    #[tokio::test]
    async fn one_failing_user_does_not_stop_the_others() {
        let names = ["alice", "bob", "carol"];
        let h = harness(&names, KEY_A, RotationConfig::default());
        h.host
            .inject(Fault::exit("bob", FakeOp::Append, 1, "No space left on device"));

        let summary = h.orchestrator.run(not_cancelled()).await.unwrap();
        assert_eq!(summary.counts.appended, 2);
        assert_eq!(summary.counts.failed, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].local_username, "bob");
        assert_eq!(summary.failures[0].kind, FailureKind::CommandExecution);
        assert!(h.host.file(&path("alice")).is_some());
        assert!(h.host.file(&path("carol")).is_some());
        assert_eq!(summary.exit_code(FailurePolicy::Fatal), EXIT_USER_FAILURE);
        assert_eq!(summary.exit_code(FailurePolicy::Warn), EXIT_OK);
        assert_eq!(h.notifier.recipients(), vec!["alice", "carol"]);
    }

    #[tokio::test]
    async fn only_changed_users_are_notified() {
        let names = ["alice", "bob"];
        let h = harness(&names, KEY_A, RotationConfig::default());
        h.host
            .put_file(&path("bob"), &format!("{}\n", tagged("bob", KEY_A)), 0o600);

        let summary = h.orchestrator.run(not_cancelled()).await.unwrap();
        assert_eq!(h.notifier.recipients(), vec!["alice"]);
        let sent = h.notifier.sent.lock().unwrap();
        assert_eq!(sent[0].1.subject, "SSH key rotation - alice");
        assert!(summary.users[0].notified);
        assert!(!summary.users[1].notified);
    }

    #[tokio::test]
    async fn notification_failure_keeps_the_new_key() {
        let host = FakeHost::new();
        let orchestrator = orchestrator(
            FakeConnector::new(host.clone()),
            roster_of(&["alice"]),
            keys_for(&["alice"], KEY_A),
            Arc::new(FakeNotifier::failing_for("alice")),
            RotationConfig::default(),
        );

        let summary = orchestrator.run(not_cancelled()).await.unwrap();
        let alice = &summary.users[0];
        assert_eq!(alice.outcome, OutcomeKind::Appended);
        assert!(!alice.notified);
        assert!(alice.notification_error.as_deref().unwrap().contains("smtp"));
        assert_eq!(summary.counts.failed, 0);
        let (content, _) = host.file(&path("alice")).unwrap();
        assert!(content.contains(&tagged("alice", KEY_A)));
    }

    #[tokio::test]
    async fn ambiguous_file_is_reported_high_priority_and_untouched() {
        let h = harness(&["alice"], KEY_A, RotationConfig::default());
        let old = tagged("alice", KEY_B);
        let original = format!("{old}\n{old}\n");
        h.host.put_file(&path("alice"), &original, 0o600);

        let summary = h.orchestrator.run(not_cancelled()).await.unwrap();
        assert_eq!(summary.users[0].kind, Some(FailureKind::AmbiguousState));
        assert!(summary.users[0].high_priority);
        assert_eq!(h.host.file(&path("alice")).unwrap().0, original);
        assert!(h.notifier.recipients().is_empty());
    }

    #[tokio::test]
    async fn missing_key_fails_only_that_user() {
        let host = FakeHost::new();
        let orchestrator = orchestrator(
            FakeConnector::new(host.clone()),
            roster_of(&["alice", "bob"]),
            keys_for(&["alice"], KEY_A),
            Arc::new(FakeNotifier::default()),
            RotationConfig::default(),
        );

        let summary = orchestrator.run(not_cancelled()).await.unwrap();
        assert_eq!(summary.counts.appended, 1);
        assert_eq!(summary.users[1].kind, Some(FailureKind::KeyNotFound));
        assert!(host.ops_for("bob").is_empty());
    }

    #[tokio::test]
    async fn connection_failure_aborts_the_run() {
        let host = FakeHost::new();
        let mut connector = FakeConnector::new(host.clone());
        connector.fail_after = Some(0);
        let orchestrator = orchestrator(
            connector,
            roster_of(&["alice"]),
            keys_for(&["alice"], KEY_A),
            Arc::new(FakeNotifier::default()),
            RotationConfig::default(),
        );

        let err = orchestrator.run(not_cancelled()).await.unwrap_err();
        assert!(matches!(err, RotationError::Connection { .. }));
        assert!(err.is_fatal_to_run());
        assert!(host.commands().is_empty());
    }

    #[tokio::test]
    async fn malformed_roster_aborts_and_still_closes_the_channel() {
        let host = FakeHost::new();
        let orchestrator = orchestrator(
            FakeConnector::new(host.clone()),
            format!("{HEADER}acct-alice,alice\n"),
            keys_for(&["alice"], KEY_A),
            Arc::new(FakeNotifier::default()),
            RotationConfig::default(),
        );

        let err = orchestrator.run(not_cancelled()).await.unwrap_err();
        match err {
            RotationError::MalformedRoster { row, .. } => assert_eq!(row, 2),
            other => panic!("expected malformed roster, got {other:?}"),
        }
        assert_eq!(host.opened(), 1);
        assert_eq!(host.closed(), 1);
        assert!(host.commands().is_empty());
    }

    #[tokio::test]
    async fn duplicate_user_rows_abort_before_any_command() {
        let host = FakeHost::new();
        let orchestrator = orchestrator(
            FakeConnector::new(host.clone()),
            format!("{HEADER}acct-one,alice,alice@example.com\nacct-two,alice,alice@example.com\n"),
            keys_for(&["alice"], KEY_A),
            Arc::new(FakeNotifier::default()),
            RotationConfig {
                workers: 2,
                ..RotationConfig::default()
            },
        );

        let err = orchestrator.run(not_cancelled()).await.unwrap_err();
        assert!(matches!(err, RotationError::MalformedRoster { row: 3, .. }), "{err:?}");
        assert!(host.commands().is_empty());
        assert_eq!(host.closed(), host.opened());
    }

    #[tokio::test]
    async fn cancelled_before_start_touches_nobody() {
        let h = harness(&["alice", "bob"], KEY_A, RotationConfig::default());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let summary = h.orchestrator.run(rx).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.counts.skipped, 2);
        assert!(
            summary
                .users
                .iter()
                .all(|u| u.skip_reason == Some(SkipReason::Cancelled))
        );
        assert!(h.host.commands().is_empty());
        assert_eq!(h.host.closed(), h.host.opened());
        assert_eq!(summary.exit_code(FailurePolicy::Warn), EXIT_CANCELLED);
    }

    /// Requests cancellation as soon as the first notice goes out.
    struct CancelOnNotify(watch::Sender<bool>);

    #[async_trait::async_trait]
    impl Notifier for CancelOnNotify {
        async fn notify(&self, _user: &UserRecord, _notice: &Notice) -> Result<(), RotationError> {
            let _ = self.0.send(true);
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancellation_mid_run_skips_the_rest() {
        let host = FakeHost::new();
        let (tx, rx) = watch::channel(false);
        let names = ["alice", "bob", "carol"];
        let orchestrator = orchestrator(
            FakeConnector::new(host.clone()),
            roster_of(&names),
            keys_for(&names, KEY_A),
            Arc::new(CancelOnNotify(tx)),
            RotationConfig::default(),
        );

        let summary = orchestrator.run(rx).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.users[0].outcome, OutcomeKind::Appended);
        assert_eq!(summary.users[1].skip_reason, Some(SkipReason::Cancelled));
        assert_eq!(summary.users[2].skip_reason, Some(SkipReason::Cancelled));
        assert!(host.ops_for("bob").is_empty());
        assert_eq!(host.closed(), 1);
    }

    #[tokio::test]
    async fn workers_each_get_a_channel_and_keep_users_atomic() {
        let names = ["alice", "bob", "carol", "dave", "erin"];
        let rotation = RotationConfig {
            workers: 3,
            ..RotationConfig::default()
        };
        let h = harness(&names, KEY_A, rotation);

        let summary = h.orchestrator.run(not_cancelled()).await.unwrap();
        assert_eq!(summary.counts.appended, 5);
        assert_eq!(h.host.opened(), 3);
        assert_eq!(h.host.closed(), 3);
        assert!(
            h.host.busy_channels().len() > 1,
            "only channels {:?} did any work",
            h.host.busy_channels()
        );
        for name in names {
            assert_eq!(
                h.host.ops_for(name),
                vec![FakeOp::Probe, FakeOp::Append, FakeOp::Chmod, FakeOp::Probe]
            );
            assert_eq!(h.host.channels_for(name).len(), 1, "{name} spread across channels");
        }
        let rows: Vec<usize> = summary.users.iter().map(|u| u.row).collect();
        assert_eq!(rows, vec![2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn worker_channel_failure_falls_back_to_fewer_workers() {
        let host = FakeHost::new();
        let mut connector = FakeConnector::new(host.clone());
        connector.fail_after = Some(1);
        let names = ["alice", "bob"];
        let orchestrator = orchestrator(
            connector,
            roster_of(&names),
            keys_for(&names, KEY_A),
            Arc::new(FakeNotifier::default()),
            RotationConfig {
                workers: 4,
                ..RotationConfig::default()
            },
        );

        let summary = orchestrator.run(not_cancelled()).await.unwrap();
        assert_eq!(summary.counts.appended, 2);
        assert_eq!(host.opened(), 1);
        assert_eq!(host.closed(), 1);
    }

    #[tokio::test]
    async fn hung_user_times_out_and_run_continues() {
        let names = ["alice", "bob"];
        let rotation = RotationConfig {
            command_timeout_secs: 1,
            ..RotationConfig::default()
        };
        let h = harness(&names, KEY_A, rotation);
        h.host.inject(Fault::hang("alice", FakeOp::Append));

        let summary = h.orchestrator.run(not_cancelled()).await.unwrap();
        assert_eq!(summary.users[0].kind, Some(FailureKind::Timeout));
        assert_eq!(summary.users[1].outcome, OutcomeKind::Appended);
    }

    #[tokio::test]
    async fn hostile_values_never_change_the_commands() {
        let hostile = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIDjlDE7M0qxmBVk3SfXqXh8C2l+U85rltVy6JDolkQFz $(rm${IFS}-rf${IFS}/);reboot";
        let host = FakeHost::new();
        let orchestrator = orchestrator(
            FakeConnector::new(host.clone()),
            format!("{HEADER}acct$(reboot),alice,\"a@example.com; rm -rf ~\"\n"),
            FakeKeys::default().with("alice", hostile),
            Arc::new(FakeNotifier::default()),
            RotationConfig::default(),
        );

        let summary = orchestrator.run(not_cancelled()).await.unwrap();
        assert_eq!(summary.users[0].outcome, OutcomeKind::Appended);

        let scripts = [PROBE_SCRIPT, REPLACE_SCRIPT, APPEND_SCRIPT];
        for command in host.commands() {
            let argv = command.argv();
            assert_eq!(&argv[..6], &["sudo", "-n", "-H", "-u", "alice", "--"].map(String::from));
            assert!(argv.iter().all(|a| !a.contains("$(rm") && !a.contains("rm -rf") && !a.contains("reboot")));
            let script = argv.iter().find(|a| a.contains('\n'));
            if let Some(script) = script {
                assert!(scripts.contains(&script.as_str()));
            }
        }
        let (content, _) = host.file(&path("alice")).unwrap();
        assert!(content.trim_end().ends_with(" alice@remote"));
    }

    #[tokio::test]
    async fn hostile_username_aborts_at_the_roster() {
        let host = FakeHost::new();
        let orchestrator = orchestrator(
            FakeConnector::new(host.clone()),
            format!("{HEADER}acct,alice; rm -rf /,a@example.com\n"),
            FakeKeys::default(),
            Arc::new(FakeNotifier::default()),
            RotationConfig::default(),
        );

        let err = orchestrator.run(not_cancelled()).await.unwrap_err();
        assert!(matches!(err, RotationError::MalformedRoster { row: 2, .. }));
        assert!(host.commands().is_empty());
        assert_eq!(host.closed(), 1);
    }
}
