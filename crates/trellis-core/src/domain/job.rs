//! Job definitions and job runs.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{JobId, JobRunId};
use super::state::JobRunStatus;

/// A recurring job: a cron expression plus a schedule cursor.
///
/// Design:
/// - `next_due_at` is the start of the next slot to activate. It only moves
///   when an activation commits.
/// - `lease_until` is set only while an activation is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub description: Option<String>,
    pub cron_expr: String,
    pub next_due_at: DateTime<Utc>,
    pub lease_until: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId, def: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: def.name,
            description: def.description,
            cron_expr: def.cron_expr,
            next_due_at: def.next_due_at,
            lease_until: None,
            enabled: def.enabled,
            created_at: now,
            updated_at: now,
        }
    }

    /// Enabled, due, and not held by an unexpired activation lease.
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self.next_due_at <= now
            && self.lease_until.is_none_or(|until| until <= now)
    }

    pub fn claim(&mut self, lease_until: DateTime<Utc>, now: DateTime<Utc>) {
        self.lease_until = Some(lease_until);
        self.updated_at = now;
    }

    /// Move the cursor to the next slot and drop the activation lease.
    pub fn advance(&mut self, next_due_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.next_due_at = next_due_at;
        self.lease_until = None;
        self.updated_at = now;
    }

    /// Apply a catalog definition to an existing job. An in-flight lease is kept.
    pub fn redefine(&mut self, def: NewJob, now: DateTime<Utc>) {
        self.description = def.description;
        self.cron_expr = def.cron_expr;
        self.next_due_at = def.next_due_at;
        self.enabled = def.enabled;
        self.updated_at = now;
    }
}

/// Input to `JobRepository::upsert`, keyed by `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub name: String,
    pub description: Option<String>,
    pub cron_expr: String,
    pub next_due_at: DateTime<Utc>,
    pub enabled: bool,
}

/// Logical identity of one job execution for one schedule slot.
///
/// Derived from the slot start, never from wall-clock time, so every
/// activation attempt for the same slot computes the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunKey(String);

impl RunKey {
    pub fn for_slot(slot_start: DateTime<Utc>) -> Self {
        Self(slot_start.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One execution of a job. `(job_id, run_key)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: JobRunId,
    pub job_id: JobId,
    pub run_key: RunKey,
    pub status: JobRunStatus,
    pub deadline_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl JobRun {
    pub fn new(
        id: JobRunId,
        job_id: JobId,
        run_key: RunKey,
        status: JobRunStatus,
        deadline_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            job_id,
            run_key,
            status,
            deadline_at,
            started_at: None,
            finished_at: None,
            created_at: now,
        }
    }

    /// CREATED -> RUNNING. Returns false if the run had already started.
    pub fn mark_started(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != JobRunStatus::Created {
            return false;
        }
        self.status = JobRunStatus::Running;
        self.started_at = Some(now);
        true
    }

    /// -> DONE or FAILED. Returns false if the run was already terminal.
    pub fn mark_finished(&mut self, success: bool, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = if success {
            JobRunStatus::Done
        } else {
            JobRunStatus::Failed
        };
        self.finished_at = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    fn job(next_due_at: DateTime<Utc>) -> Job {
        Job::new(
            JobId::from_ulid(Ulid::new()),
            NewJob {
                name: "nightly".into(),
                description: None,
                cron_expr: "*/5 * * * *".into(),
                next_due_at,
                enabled: true,
            },
            at(0, 0, 0),
        )
    }

    #[test]
    fn run_key_is_the_slot_start() {
        let key = RunKey::for_slot(at(12, 0, 0));

        assert_eq!(key.as_str(), "2024-01-01T12:00:00Z");
        assert_eq!(key, RunKey::for_slot(at(12, 0, 0)));
    }

    #[test]
    fn due_job_respects_enabled_and_lease() {
        let mut job = job(at(12, 0, 0));

        assert!(!job.is_due_at(at(11, 59, 59)));
        assert!(job.is_due_at(at(12, 0, 0)));

        job.claim(at(12, 0, 5), at(12, 0, 0));
        assert!(!job.is_due_at(at(12, 0, 4)));
        assert!(job.is_due_at(at(12, 0, 5)));

        job.enabled = false;
        assert!(!job.is_due_at(at(13, 0, 0)));
    }

    #[test]
    fn advance_clears_the_lease() {
        let mut job = job(at(12, 0, 0));
        job.claim(at(12, 0, 5), at(12, 0, 0));

        job.advance(at(12, 5, 0), at(12, 0, 1));

        assert_eq!(job.next_due_at, at(12, 5, 0));
        assert_eq!(job.lease_until, None);
    }

    #[test]
    fn job_run_lifecycle_is_guarded() {
        let mut run = JobRun::new(
            JobRunId::from_ulid(Ulid::new()),
            JobId::from_ulid(Ulid::new()),
            RunKey::for_slot(at(12, 0, 0)),
            JobRunStatus::Created,
            None,
            at(12, 0, 0),
        );

        assert!(run.mark_started(at(12, 0, 1)));
        assert!(!run.mark_started(at(12, 0, 2)));
        assert_eq!(run.started_at, Some(at(12, 0, 1)));

        assert!(run.mark_finished(true, at(12, 1, 0)));
        assert!(!run.mark_finished(false, at(12, 2, 0)));
        assert_eq!(run.status, JobRunStatus::Done);
        assert_eq!(run.finished_at, Some(at(12, 1, 0)));
    }
}
