//! Catalog - declarative job and task definitions.
//!
//! Definitions are validated as a whole (unique names, known dependencies,
//! acyclic graphs, parsable cron expressions) before anything is written,
//! then registered in one unit of work.

pub mod dependency;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use self::dependency::DependencyGraph;
use crate::app::unit_of_work::TransactionBoundary;
use crate::domain::{CronError, Job, NewJob, NewTask, SchedulerError, StoreError};
use crate::ports::{Clock, CronCalculator, StorePorts, TransactionManager};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogDef {
    #[serde(default)]
    pub jobs: Vec<JobDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub cron: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub tasks: Vec<TaskDef>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDef {
    pub name: String,
    /// Handler key; defaults to the task name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl TaskDef {
    pub fn handler_key(&self) -> &str {
        self.handler.as_deref().unwrap_or(&self.name)
    }

    /// `depends_on` without repeats, in a stable order.
    fn predecessors(&self) -> BTreeSet<&str> {
        self.depends_on.iter().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("job `{0}` is defined more than once")]
    DuplicateJob(String),

    #[error("job `{job}` defines task `{task}` more than once")]
    DuplicateTask { job: String, task: String },

    #[error("task `{job}.{task}` depends on unknown task `{depends_on}`")]
    UnknownDependency {
        job: String,
        task: String,
        depends_on: String,
    },

    #[error("job `{job}` has a dependency cycle: {}", path.join(" -> "))]
    Cycle { job: String, path: Vec<String> },

    #[error("job `{job}`: {source}")]
    Schedule {
        job: String,
        #[source]
        source: CronError,
    },

    #[error(transparent)]
    Store(#[from] SchedulerError),
}

impl From<StoreError> for CatalogError {
    fn from(err: StoreError) -> Self {
        Self::Store(err.into())
    }
}

impl JobDef {
    /// The dependency graph, or the first structural problem found.
    pub fn dependency_graph(&self) -> Result<DependencyGraph, CatalogError> {
        let mut names = HashSet::new();
        for task in &self.tasks {
            if !names.insert(task.name.as_str()) {
                return Err(CatalogError::DuplicateTask {
                    job: self.name.clone(),
                    task: task.name.clone(),
                });
            }
        }

        let mut graph = DependencyGraph::new();
        for task in &self.tasks {
            for pre in task.predecessors() {
                if !names.contains(pre) {
                    return Err(CatalogError::UnknownDependency {
                        job: self.name.clone(),
                        task: task.name.clone(),
                        depends_on: pre.to_owned(),
                    });
                }
                graph.add_dependency(&task.name, pre);
            }
        }
        if let Some(path) = graph.detect_cycle() {
            return Err(CatalogError::Cycle {
                job: self.name.clone(),
                path,
            });
        }
        Ok(graph)
    }
}

impl CatalogDef {
    pub fn validate(&self, cron: &dyn CronCalculator) -> Result<(), CatalogError> {
        let mut names = HashSet::new();
        for job in &self.jobs {
            if !names.insert(job.name.as_str()) {
                return Err(CatalogError::DuplicateJob(job.name.clone()));
            }
            cron.validate(&job.cron).map_err(|source| CatalogError::Schedule {
                job: job.name.clone(),
                source,
            })?;
            job.dependency_graph()?;
        }
        Ok(())
    }
}

/// Writes a validated catalog into the store.
pub struct CatalogRegistrar<M: TransactionManager> {
    ports: StorePorts<M>,
    boundary: TransactionBoundary<M>,
    clock: Arc<dyn Clock>,
    cron: Arc<dyn CronCalculator>,
    zone: FixedOffset,
}

impl<M: TransactionManager> CatalogRegistrar<M> {
    pub fn new(
        ports: StorePorts<M>,
        clock: Arc<dyn Clock>,
        cron: Arc<dyn CronCalculator>,
        zone: FixedOffset,
    ) -> Self {
        Self {
            boundary: TransactionBoundary::new(ports.transactions.clone()),
            ports,
            clock,
            cron,
            zone,
        }
    }

    /// Upsert every job, task and dependency edge of `catalog`.
    ///
    /// A job whose cron expression is unchanged keeps its cursor; a new or
    /// rescheduled job starts at the first occurrence after now. Edges no
    /// longer declared are removed. Tasks no longer declared are kept (and
    /// reported) since runs may still reference them.
    pub async fn register(&self, catalog: &CatalogDef) -> Result<Vec<Job>, CatalogError> {
        catalog.validate(self.cron.as_ref())?;

        let mut uow = self.boundary.requires_new().await?;
        let now = self.clock.now();
        let mut registered = Vec::with_capacity(catalog.jobs.len());

        for def in &catalog.jobs {
            let existing = self.ports.jobs.find_by_name(uow.tx()?, &def.name).await?;
            let next_due_at = match existing {
                Some(job) if job.cron_expr == def.cron => job.next_due_at,
                _ => self.first_slot(def, now)?,
            };
            let job = self
                .ports
                .jobs
                .upsert(
                    uow.tx()?,
                    NewJob {
                        name: def.name.clone(),
                        description: def.description.clone(),
                        cron_expr: def.cron.clone(),
                        next_due_at,
                        enabled: def.enabled,
                    },
                    now,
                )
                .await?;

            let mut task_ids = Vec::with_capacity(def.tasks.len());
            for task in &def.tasks {
                let stored = self
                    .ports
                    .tasks
                    .upsert(
                        uow.tx()?,
                        NewTask {
                            job_id: job.id,
                            name: task.name.clone(),
                            handler_key: task.handler_key().to_owned(),
                            indegree: task.predecessors().len() as u32,
                        },
                        now,
                    )
                    .await?;
                task_ids.push((task.name.as_str(), stored.id));
            }
            let id_of = |name: &str| task_ids.iter().find(|(n, _)| *n == name).map(|(_, id)| *id);

            for task in &def.tasks {
                let Some(post) = id_of(&task.name) else { continue };
                let wanted: BTreeSet<_> = task.predecessors().into_iter().filter_map(id_of).collect();
                let current = self.ports.dependencies.find_predecessors(uow.tx()?, post).await?;
                for stale in current.iter().filter(|pre| !wanted.contains(*pre)) {
                    self.ports.dependencies.remove(uow.tx()?, *stale, post).await?;
                }
                for pre in wanted {
                    self.ports.dependencies.add(uow.tx()?, pre, post).await?;
                }
            }

            let stored = self.ports.tasks.find_all_by_job(uow.tx()?, job.id).await?;
            let undeclared: Vec<_> = stored
                .iter()
                .filter(|task| id_of(&task.name).is_none())
                .map(|task| task.name.as_str())
                .collect();
            if !undeclared.is_empty() {
                warn!(job = %def.name, tasks = ?undeclared, "stored tasks are no longer declared");
            }

            info!(
                job = %job.id,
                name = %job.name,
                tasks = def.tasks.len(),
                next_due_at = %job.next_due_at,
                "job registered"
            );
            registered.push(job);
        }
        uow.commit().await?;
        Ok(registered)
    }

    fn first_slot(&self, def: &JobDef, now: DateTime<Utc>) -> Result<DateTime<Utc>, CatalogError> {
        self.cron
            .next_after(now, &def.cron, self.zone)
            .map_err(|source| CatalogError::Schedule {
                job: def.name.clone(),
                source,
            })
    }
}
