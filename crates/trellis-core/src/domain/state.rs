//! Run statuses.
//!
//! # TaskRun transitions
//! - BLOCKED -> READY: promotion, once `done_cnt` reaches `pre_cnt`
//! - READY -> RUNNING: claim
//! - RUNNING -> DONE: success
//! - RUNNING -> READY: retry with backoff, or lease recovery by maintenance
//! - RUNNING -> FAILED: retry budget exhausted
//!
//! Terminal statuses have no outgoing transitions in-core.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskRunStatus {
    /// Waiting for predecessors.
    Blocked,
    Ready,
    /// Claimed under a lease.
    Running,
    Done,
    Failed,
    Skipped,
    Cancelled,
    Expired,
}

impl TaskRunStatus {
    pub const ALL: [TaskRunStatus; 8] = [
        Self::Blocked,
        Self::Ready,
        Self::Running,
        Self::Done,
        Self::Failed,
        Self::Skipped,
        Self::Cancelled,
        Self::Expired,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done | Self::Failed | Self::Skipped | Self::Cancelled | Self::Expired
        )
    }

    /// Finished task runs become eligible for archival after the retention TTL.
    pub fn is_archivable(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobRunStatus {
    Created,
    Running,
    Done,
    Failed,
    Cancelled,
    Expired,
}

impl JobRunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done | Self::Failed | Self::Cancelled | Self::Expired
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TaskRunStatus::Blocked, false)]
    #[case(TaskRunStatus::Ready, false)]
    #[case(TaskRunStatus::Running, false)]
    #[case(TaskRunStatus::Done, true)]
    #[case(TaskRunStatus::Failed, true)]
    #[case(TaskRunStatus::Cancelled, true)]
    fn task_run_terminal_statuses(#[case] status: TaskRunStatus, #[case] terminal: bool) {
        assert_eq!(status.is_terminal(), terminal);
    }

    #[test]
    fn only_done_and_failed_are_archivable() {
        let archivable: Vec<_> = TaskRunStatus::ALL
            .into_iter()
            .filter(|s| s.is_archivable())
            .collect();

        assert_eq!(archivable, vec![TaskRunStatus::Done, TaskRunStatus::Failed]);
    }

    #[test]
    fn statuses_serialize_in_upper_case() {
        assert_eq!(
            serde_json::to_string(&TaskRunStatus::Ready).unwrap(),
            "\"READY\""
        );
        assert_eq!(
            serde_json::to_string(&JobRunStatus::Created).unwrap(),
            "\"CREATED\""
        );
    }
}
