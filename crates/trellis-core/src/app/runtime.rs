use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{Task, TaskRun};

/// What a handler gets to see about the work it runs.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task: Task,
    pub task_run: TaskRun,
}

impl TaskContext {
    pub fn handler_key(&self) -> &str {
        &self.task.handler_key
    }

    pub fn attempt(&self) -> u32 {
        self.task_run.attempt
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("no handler registered for `{0}`")]
    NotRegistered(String),

    /// The handler ran and failed. Recorded as the run's `last_error`.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("a handler is already registered for `{0}`")]
pub struct DuplicateHandler(pub String);

/// A handler for one `handler_key`.
///
/// Handlers may run more than once for the same task run (a lease can
/// expire while a slow handler is still going), so they should be
/// idempotent.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: &TaskContext) -> Result<(), HandlerError>;
}

/// Registry of handlers (handler_key -> handler).
///
/// Design:
/// - Built during initialization (mutable).
/// - Used during runtime (immutable, shared behind `Arc`).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        handler_key: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), DuplicateHandler> {
        let handler_key = handler_key.into();
        if self.handlers.contains_key(&handler_key) {
            return Err(DuplicateHandler(handler_key));
        }
        self.handlers.insert(handler_key, handler);
        Ok(())
    }

    pub fn get(&self, handler_key: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(handler_key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Runtime executes a claimed task run by dispatching to its handler.
#[derive(Clone)]
pub struct Runtime {
    registry: Arc<HandlerRegistry>,
}

impl Runtime {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// A missing handler is a failure like any other, so the run retries
    /// (and eventually fails) instead of sitting RUNNING.
    pub async fn execute(&self, ctx: &TaskContext) -> Result<(), HandlerError> {
        let handler = self
            .registry
            .get(ctx.handler_key())
            .ok_or_else(|| HandlerError::NotRegistered(ctx.handler_key().to_owned()))?;

        handler.handle(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobId, JobRunId, NewTask, TaskId, TaskRunId};
    use crate::testing::at;
    use ulid::Ulid;

    struct OkHandler;

    #[async_trait]
    impl TaskHandler for OkHandler {
        async fn handle(&self, _ctx: &TaskContext) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl TaskHandler for FailingHandler {
        async fn handle(&self, ctx: &TaskContext) -> Result<(), HandlerError> {
            Err(HandlerError::failed(format!("attempt {} failed", ctx.attempt())))
        }
    }

    fn ctx(handler_key: &str) -> TaskContext {
        let task_id = TaskId::from_ulid(Ulid::new());
        let task = Task::new(
            task_id,
            NewTask {
                job_id: JobId::from_ulid(Ulid::new()),
                name: "t".into(),
                handler_key: handler_key.into(),
                indegree: 0,
            },
            at(12, 0, 0),
        );
        let task_run = TaskRun::prepared(
            TaskRunId::from_ulid(Ulid::new()),
            JobRunId::from_ulid(Ulid::new()),
            task_id,
            0,
            at(12, 0, 0),
        );
        TaskContext { task, task_run }
    }

    #[tokio::test]
    async fn runtime_executes_registered_handler() {
        let mut reg = HandlerRegistry::new();
        reg.register("ok", Arc::new(OkHandler)).unwrap();
        reg.register("fail", Arc::new(FailingHandler)).unwrap();

        let rt = Runtime::new(Arc::new(reg));

        rt.execute(&ctx("ok")).await.unwrap();
        assert_eq!(
            rt.execute(&ctx("fail")).await.unwrap_err(),
            HandlerError::failed("attempt 1 failed")
        );
    }

    #[tokio::test]
    async fn runtime_errors_when_handler_missing() {
        let rt = Runtime::new(Arc::new(HandlerRegistry::new()));

        let err = rt.execute(&ctx("missing")).await.unwrap_err();

        assert_eq!(err.to_string(), "no handler registered for `missing`");
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut reg = HandlerRegistry::new();
        reg.register("ok", Arc::new(OkHandler)).unwrap();

        let err = reg.register("ok", Arc::new(OkHandler)).unwrap_err();

        assert_eq!(err, DuplicateHandler("ok".into()));
        assert_eq!(reg.len(), 1);
    }
}
