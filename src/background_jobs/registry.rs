use super::context::JobContext;
use super::job::JobError;
use crate::job_store::JobRecord;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Performs the work of every job whose `executor` field names it.
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    async fn exec(&self, ctx: &JobContext, job: &JobRecord) -> Result<(), JobError>;
}

pub type JobFuture = BoxFuture<'static, Result<(), JobError>>;

/// Adapts a plain function into an [`Executor`].
struct FuncExecutor<F> {
    name: String,
    func: F,
}

#[async_trait]
impl<F> Executor for FuncExecutor<F>
where
    F: Fn(JobContext, JobRecord) -> JobFuture + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn exec(&self, ctx: &JobContext, job: &JobRecord) -> Result<(), JobError> {
        (self.func)(ctx.clone(), job.clone()).await
    }
}

/// Executors keyed by name. Registering a name again replaces the old entry.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn Executor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, executor: Arc<dyn Executor>) {
        let name = executor.name().to_string();
        let mut executors = self.executors.write().unwrap();
        if executors.insert(name.clone(), executor).is_some() {
            debug!("Replaced executor {}", name);
        }
    }

    pub fn register_func<F>(&self, name: impl Into<String>, func: F)
    where
        F: Fn(JobContext, JobRecord) -> JobFuture + Send + Sync + 'static,
    {
        self.register(Arc::new(FuncExecutor {
            name: name.into(),
            func,
        }));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Executor>> {
        self.executors.read().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Run `job` on its executor, failing with [`JobError::NotFound`] when none
    /// is registered.
    pub async fn exec(&self, ctx: &JobContext, job: &JobRecord) -> Result<(), JobError> {
        let executor = self.get(&job.executor).ok_or(JobError::NotFound)?;
        executor.exec(ctx, job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::JobStatus;
    use chrono::Utc;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn job(executor: &str) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id: 1,
            name: "test".to_string(),
            executor: executor.to_string(),
            config: "payload".to_string(),
            cron_expression: "0 * * * * *".to_string(),
            status: JobStatus::Running,
            version: 1,
            next_run_at: now,
            updated_at: now,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_exec_registered_function() {
        let registry = ExecutorRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        registry.register_func("local", move |_ctx, job| {
            let calls = calls_clone.clone();
            async move {
                assert_eq!(job.config, "payload");
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        });

        registry
            .exec(&JobContext::default(), &job("local"))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exec_unregistered_executor_fails() {
        let registry = ExecutorRegistry::new();
        let result = registry.exec(&JobContext::default(), &job("missing")).await;
        assert!(matches!(result, Err(JobError::NotFound)));
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let registry = ExecutorRegistry::new();
        registry.register_func("local", |_ctx, _job| {
            async { Err(JobError::ExecutionFailed("old".to_string())) }.boxed()
        });
        registry.register_func("local", |_ctx, _job| async { Ok(()) }.boxed());

        assert_eq!(registry.names(), vec!["local".to_string()]);
        assert!(registry
            .exec(&JobContext::default(), &job("local"))
            .await
            .is_ok());
    }
}
