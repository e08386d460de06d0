//! Run summary: per-user outcomes, counts and the process exit status.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::FailurePolicy;
use crate::error::FailureKind;
use crate::model::{OutcomeKind, ReconciliationOutcome, SkipReason, UserRecord};

pub const EXIT_OK: i32 = 0;
/// At least one user failed under [`FailurePolicy::Fatal`].
pub const EXIT_USER_FAILURE: i32 = 1;
/// Configuration, connection or roster failure; nothing was reconciled.
pub const EXIT_RUN_ERROR: i32 = 2;
/// Interrupted by SIGINT/SIGTERM (128 + SIGINT).
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub replaced: usize,
    pub appended: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserReport {
    pub row: usize,
    pub account_id: String,
    pub local_username: String,
    pub outcome: OutcomeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub high_priority: bool,
    pub notified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_error: Option<String>,
}

impl UserReport {
    pub fn new(user: &UserRecord, outcome: &ReconciliationOutcome) -> Self {
        let (skip_reason, kind, reason) = match outcome {
            ReconciliationOutcome::Skipped(why) => (Some(*why), None, None),
            ReconciliationOutcome::Failed(e) => (None, Some(e.kind()), Some(e.to_string())),
            ReconciliationOutcome::Replaced | ReconciliationOutcome::Appended => (None, None, None),
        };
        Self {
            row: user.row,
            account_id: user.account_id.to_string(),
            local_username: user.local_username.to_string(),
            outcome: outcome.kind(),
            skip_reason,
            high_priority: kind.is_some_and(FailureKind::is_high_priority),
            kind,
            reason,
            notified: false,
            notification_error: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.kind.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureEntry {
    pub local_username: String,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub host: String,
    pub counts: Counts,
    pub cancelled: bool,
    pub users: Vec<UserReport>,
    pub failures: Vec<FailureEntry>,
}

impl RunSummary {
    /// Build the summary from reports; `users` is sorted into roster order.
    pub fn new(
        host: impl Into<String>,
        started_at: DateTime<Utc>,
        mut users: Vec<UserReport>,
        cancelled: bool,
    ) -> Self {
        users.sort_by_key(|u| u.row);

        let mut counts = Counts::default();
        let mut failures = Vec::new();
        for user in &users {
            match user.outcome {
                OutcomeKind::Replaced => counts.replaced += 1,
                OutcomeKind::Appended => counts.appended += 1,
                OutcomeKind::Skipped => counts.skipped += 1,
                OutcomeKind::Failed => counts.failed += 1,
            }
            if let (Some(kind), Some(reason)) = (user.kind, &user.reason) {
                failures.push(FailureEntry {
                    local_username: user.local_username.clone(),
                    kind,
                    reason: reason.clone(),
                });
            }
        }

        Self {
            started_at,
            finished_at: Utc::now(),
            host: host.into(),
            counts,
            cancelled,
            users,
            failures,
        }
    }

    pub fn exit_code(&self, policy: FailurePolicy) -> i32 {
        if self.cancelled {
            EXIT_CANCELLED
        } else if self.counts.failed > 0 && policy == FailurePolicy::Fatal {
            EXIT_USER_FAILURE
        } else {
            EXIT_OK
        }
    }

    /// Human-readable table, one line per user followed by the totals.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:>4}  {:<20} {:<24} {:<10} DETAIL",
            "ROW", "USER", "ACCOUNT", "OUTCOME"
        );
        for u in &self.users {
            let detail = match (&u.reason, u.skip_reason, &u.notification_error) {
                (Some(reason), _, _) if u.high_priority => format!("[HIGH PRIORITY] {reason}"),
                (Some(reason), _, _) => reason.clone(),
                (None, Some(why), _) => why.to_string(),
                (None, None, Some(err)) => format!("notification failed: {err}"),
                (None, None, None) if u.notified => "notified".to_string(),
                (None, None, None) => String::new(),
            };
            let _ = writeln!(
                out,
                "{:>4}  {:<20} {:<24} {:<10} {}",
                u.row, u.local_username, u.account_id, u.outcome, detail
            );
        }
        let c = &self.counts;
        let _ = writeln!(
            out,
            "\n{}: {} replaced, {} appended, {} skipped, {} failed{}",
            self.host,
            c.replaced,
            c.appended,
            c.skipped,
            c.failed,
            if self.cancelled { " (cancelled)" } else { "" }
        );
        out
    }
}
