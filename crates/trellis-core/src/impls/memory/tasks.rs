//! Task, TaskDependency and TaskRun tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::table::Access;
use super::{MemoryStore, MemoryTx};
use crate::domain::{
    DoneCountIncrement, JobId, JobRunId, NewTask, Task, TaskDependency, TaskId, TaskRun,
    TaskRunId, TaskRunStatus, WorkerId,
};
use crate::ports::{StoreResult, TaskDependencyRepository, TaskRepository, TaskRunRepository};

/// Collapse "row absent" into `default` for guarded single-row writes.
fn or_absent<R>(access: Access<Option<R>>, default: R) -> Access<R> {
    match access {
        Access::Ready(result) => Access::Ready(result.unwrap_or(default)),
        Access::Blocked => Access::Blocked,
    }
}

#[async_trait]
impl TaskRepository<MemoryTx> for MemoryStore {
    async fn find_by_job_and_name(
        &self,
        tx: &mut MemoryTx,
        job_id: JobId,
        name: &str,
    ) -> StoreResult<Option<Task>> {
        self.read(tx, |tables, tx| {
            tables
                .tasks
                .find(tx, |task| task.job_id == job_id && task.name == name)
        })
    }

    async fn find_all_by_job(&self, tx: &mut MemoryTx, job_id: JobId) -> StoreResult<Vec<Task>> {
        self.read(tx, |tables, tx| tables.tasks.filter(tx, |task| task.job_id == job_id))
    }

    async fn find_by_id(&self, tx: &mut MemoryTx, task_id: TaskId) -> StoreResult<Option<Task>> {
        self.read(tx, |tables, tx| tables.tasks.get(&task_id, tx).cloned())
    }

    async fn upsert(&self, tx: &mut MemoryTx, def: NewTask, now: DateTime<Utc>) -> StoreResult<Task> {
        let new_id = self.ids().task_id();
        self.write(tx, |tables, tx| {
            let existing = match tables
                .tasks
                .find_unique(tx, |task| task.job_id == def.job_id && task.name == def.name)
            {
                Access::Ready(existing) => existing,
                Access::Blocked => return Access::Blocked,
            };
            if let Some(id) = existing {
                let updated = tables.tasks.update(&id, tx, |task| {
                    task.redefine(def.clone(), now);
                    task.clone()
                });
                match updated {
                    Access::Ready(Some(task)) => return Access::Ready(task),
                    Access::Ready(None) => {}
                    Access::Blocked => return Access::Blocked,
                }
            }
            let task = Task::new(new_id, def.clone(), now);
            match tables.tasks.insert(new_id, tx, task.clone()) {
                Access::Ready(()) => Access::Ready(task),
                Access::Blocked => Access::Blocked,
            }
        })
        .await
    }
}

#[async_trait]
impl TaskDependencyRepository<MemoryTx> for MemoryStore {
    async fn add(&self, tx: &mut MemoryTx, pre: TaskId, post: TaskId) -> StoreResult<bool> {
        let edge = TaskDependency {
            pre_task_id: pre,
            post_task_id: post,
        };
        self.write(tx, |tables, tx| tables.dependencies.insert_if_absent(edge, tx, edge))
            .await
    }

    async fn remove(&self, tx: &mut MemoryTx, pre: TaskId, post: TaskId) -> StoreResult<bool> {
        let edge = TaskDependency {
            pre_task_id: pre,
            post_task_id: post,
        };
        self.write(tx, |tables, tx| tables.dependencies.delete(&edge, tx))
            .await
    }

    async fn find_predecessors(&self, tx: &mut MemoryTx, post: TaskId) -> StoreResult<Vec<TaskId>> {
        self.read(tx, |tables, tx| {
            tables
                .dependencies
                .iter(tx)
                .filter(|(_, edge)| edge.post_task_id == post)
                .map(|(_, edge)| edge.pre_task_id)
                .collect()
        })
    }

    async fn find_successors(&self, tx: &mut MemoryTx, pre: TaskId) -> StoreResult<Vec<TaskId>> {
        self.read(tx, |tables, tx| {
            tables
                .dependencies
                .iter(tx)
                .filter(|(_, edge)| edge.pre_task_id == pre)
                .map(|(_, edge)| edge.post_task_id)
                .collect()
        })
    }
}

#[async_trait]
impl TaskRunRepository<MemoryTx> for MemoryStore {
    async fn claim_ready(
        &self,
        tx: &mut MemoryTx,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        worker_id: Option<WorkerId>,
    ) -> StoreResult<Option<TaskRun>> {
        self.write(tx, |tables, tx| {
            Access::Ready(tables.task_runs.claim_first(
                tx,
                |run| run.is_claimable_at(now),
                |run| run.available_at,
                |run| {
                    run.claim(lease_until, worker_id, now);
                    run.clone()
                },
            ))
        })
        .await
    }

    async fn heartbeat(
        &self,
        tx: &mut MemoryTx,
        id: TaskRunId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.write(tx, |tables, tx| {
            or_absent(
                tables
                    .task_runs
                    .update(&id, tx, |run| run.extend_lease(lease_until, now)),
                false,
            )
        })
        .await
    }

    async fn mark_done(&self, tx: &mut MemoryTx, id: TaskRunId, now: DateTime<Utc>) -> StoreResult<bool> {
        self.write(tx, |tables, tx| {
            or_absent(tables.task_runs.update(&id, tx, |run| run.complete(now)), false)
        })
        .await
    }

    async fn retry_with_backoff(
        &self,
        tx: &mut MemoryTx,
        id: TaskRunId,
        attempt: u32,
        available_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.write(tx, |tables, tx| {
            or_absent(
                tables.task_runs.update(&id, tx, |run| {
                    run.attempt == attempt && run.schedule_retry(available_at, error, now)
                }),
                false,
            )
        })
        .await
    }

    async fn mark_failed(
        &self,
        tx: &mut MemoryTx,
        id: TaskRunId,
        attempt: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.write(tx, |tables, tx| {
            or_absent(
                tables
                    .task_runs
                    .update(&id, tx, |run| run.attempt == attempt && run.fail(error, now)),
                false,
            )
        })
        .await
    }

    async fn increment_done_count(
        &self,
        tx: &mut MemoryTx,
        id: TaskRunId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DoneCountIncrement>> {
        // Waits for the row lock: a concurrent incrementer must finish first,
        // so every increment sees the previous one's count.
        self.write(tx, |tables, tx| {
            tables.task_runs.update(&id, tx, |run| {
                let promoted = run.record_predecessor_done(now);
                DoneCountIncrement {
                    task_run: run.clone(),
                    promoted,
                }
            })
        })
        .await
    }

    async fn find_by_id(&self, tx: &mut MemoryTx, id: TaskRunId) -> StoreResult<Option<TaskRun>> {
        self.read(tx, |tables, tx| tables.task_runs.get(&id, tx).cloned())
    }

    async fn find_all_by_run(&self, tx: &mut MemoryTx, run_id: JobRunId) -> StoreResult<Vec<TaskRun>> {
        self.read(tx, |tables, tx| {
            tables.task_runs.filter(tx, |run| run.job_run_id == run_id)
        })
    }

    async fn find_by_run_and_task(
        &self,
        tx: &mut MemoryTx,
        run_id: JobRunId,
        task_id: TaskId,
    ) -> StoreResult<Option<TaskRun>> {
        self.read(tx, |tables, tx| {
            tables
                .task_runs
                .find(tx, |run| run.job_run_id == run_id && run.task_id == task_id)
        })
    }

    async fn create_or_reset(
        &self,
        tx: &mut MemoryTx,
        run_id: JobRunId,
        task_id: TaskId,
        indegree: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<TaskRun> {
        let new_id = self.ids().task_run_id();
        self.write(tx, |tables, tx| {
            let existing = match tables
                .task_runs
                .find_unique(tx, |run| run.job_run_id == run_id && run.task_id == task_id)
            {
                Access::Ready(existing) => existing,
                Access::Blocked => return Access::Blocked,
            };
            if let Some(id) = existing {
                let reset = tables.task_runs.update(&id, tx, |run| {
                    run.reset(indegree, now);
                    run.clone()
                });
                match reset {
                    Access::Ready(Some(run)) => return Access::Ready(run),
                    Access::Ready(None) => {}
                    Access::Blocked => return Access::Blocked,
                }
            }
            let run = TaskRun::prepared(new_id, run_id, task_id, indegree, now);
            match tables.task_runs.insert(new_id, tx, run.clone()) {
                Access::Ready(()) => Access::Ready(run),
                Access::Blocked => Access::Blocked,
            }
        })
        .await
    }

    async fn recover_expired_leases(
        &self,
        tx: &mut MemoryTx,
        now: DateTime<Utc>,
        available_at: DateTime<Utc>,
        reason: &str,
    ) -> StoreResult<usize> {
        self.write(tx, |tables, tx| {
            Access::Ready(tables.task_runs.update_unlocked_where(
                tx,
                |run| run.lease_expired_at(now),
                |run| run.recover_expired(available_at, reason, now),
            ))
        })
        .await
    }

    async fn promote_unblocked(&self, tx: &mut MemoryTx, now: DateTime<Utc>) -> StoreResult<usize> {
        self.write(tx, |tables, tx| {
            Access::Ready(tables.task_runs.update_unlocked_where(
                tx,
                |run| run.status == TaskRunStatus::Blocked && run.done_cnt >= run.pre_cnt,
                |run| run.promote_if_unblocked(now),
            ))
        })
        .await
    }

    async fn archive_finished_older_than(
        &self,
        tx: &mut MemoryTx,
        threshold: DateTime<Utc>,
    ) -> StoreResult<usize> {
        self.write(tx, |tables, tx| {
            Access::Ready(
                tables
                    .task_runs
                    .delete_unlocked_where(tx, |run| run.finished_before(threshold)),
            )
        })
        .await
    }

    async fn normalize_availability(
        &self,
        tx: &mut MemoryTx,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<usize> {
        self.write(tx, |tables, tx| {
            Access::Ready(tables.task_runs.update_unlocked_where(
                tx,
                |run| {
                    run.status == TaskRunStatus::Ready
                        && run.available_at.is_none_or(|at| at < min || at > max)
                },
                |run| run.clamp_availability(min, max, now),
            ))
        })
        .await
    }
}
