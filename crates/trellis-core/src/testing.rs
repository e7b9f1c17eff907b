//! Unit test fixtures shared by the service modules.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::domain::{Job, JobRun, JobRunStatus, NewJob, NewTask, RunKey, Task};
use crate::impls::MemoryStore;
use crate::ports::{Clock, ManualClock, StorePorts, TransactionManager};

pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub ports: StorePorts<MemoryStore>,
}

impl Harness {
    pub fn new(now: DateTime<Utc>) -> Self {
        let clock = Arc::new(ManualClock::new(now));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        Self {
            ports: StorePorts::from_store(store.clone()),
            clock,
            store,
        }
    }

    /// Commit a job with `tasks` and `(pre, post)` edges between them.
    /// Returned tasks follow the order of `tasks`.
    pub async fn define_job(
        &self,
        name: &str,
        cron_expr: &str,
        next_due_at: DateTime<Utc>,
        tasks: &[&str],
        edges: &[(&str, &str)],
    ) -> (Job, Vec<Task>) {
        let now = self.clock.now();
        let mut tx = self.store.begin().await.unwrap();
        let job = self
            .ports
            .jobs
            .upsert(
                &mut tx,
                NewJob {
                    name: name.into(),
                    description: None,
                    cron_expr: cron_expr.into(),
                    next_due_at,
                    enabled: true,
                },
                now,
            )
            .await
            .unwrap();

        let mut created = Vec::new();
        for task_name in tasks {
            let indegree = edges.iter().filter(|(_, post)| post == task_name).count();
            let task = self
                .ports
                .tasks
                .upsert(
                    &mut tx,
                    NewTask {
                        job_id: job.id,
                        name: (*task_name).into(),
                        handler_key: (*task_name).into(),
                        indegree: indegree as u32,
                    },
                    now,
                )
                .await
                .unwrap();
            created.push(task);
        }
        let by_name = |name: &str| created.iter().find(|t| t.name == name).unwrap().id;
        for (pre, post) in edges {
            self.ports
                .dependencies
                .add(&mut tx, by_name(*pre), by_name(*post))
                .await
                .unwrap();
        }
        self.store.commit(tx).await.unwrap();
        (job, created)
    }

    /// Commit a CREATED run of `job` for the slot at `slot`.
    pub async fn create_run(&self, job: &Job, slot: DateTime<Utc>) -> JobRun {
        let mut tx = self.store.begin().await.unwrap();
        let run = self
            .ports
            .job_runs
            .upsert(
                &mut tx,
                job.id,
                &RunKey::for_slot(slot),
                JobRunStatus::Created,
                None,
                self.clock.now(),
            )
            .await
            .unwrap();
        self.store.commit(tx).await.unwrap();
        run
    }
}
