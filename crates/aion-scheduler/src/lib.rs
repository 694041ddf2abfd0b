//! Cron Scheduler (CS).
//!
//! Wraps [`tokio_cron_scheduler`]: registering a [`Definition`] returns an
//! opaque local handle (a `Uuid`), firings run on the scheduler's own
//! background worker pool so a slow closure never blocks the next tick, and
//! shutdown waits for in-flight firings before returning.

use aion_task::Definition;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{debug, info};
use uuid::Uuid;

/// Errors raised registering with or driving the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduler itself failed to start.
    #[error("failed to start scheduler: {0}")]
    Start(JobSchedulerError),
    /// A cron definition failed to register (fatal at startup when it comes
    /// from a persisted record; logged and dropped when it comes from a
    /// remote `Apply`).
    #[error("failed to register definition {0:?}: {1}")]
    Register(String, JobSchedulerError),
    /// Shutdown failed to drain in-flight firings cleanly.
    #[error("scheduler shutdown error: {0}")]
    Shutdown(JobSchedulerError),
}

/// A handle to the running in-process scheduler.
pub struct Scheduler {
    inner: JobScheduler,
}

impl Scheduler {
    /// Create and start the scheduler's background worker.
    pub async fn start() -> Result<Self, SchedulerError> {
        let inner = JobScheduler::new()
            .await
            .map_err(SchedulerError::Start)?;
        inner.start().await.map_err(SchedulerError::Start)?;
        Ok(Self { inner })
    }

    /// Register `definition` with `action`, returning the scheduler's local
    /// handle for it. `action` fires on the worker pool at every matching
    /// instant and must not block; it is expected to do an `Arc` load of
    /// the current ring, compare the owner to this node's name, and return
    /// quickly either way.
    pub async fn register<F>(
        &self,
        definition: &Definition,
        mut action: F,
    ) -> Result<Uuid, SchedulerError>
    where
        F: FnMut() + Send + Sync + 'static,
    {
        let expr = definition.as_seven_field_cron();
        let job = Job::new(expr.as_str(), move |_job_id, _scheduler| {
            action();
        })
        .map_err(|e| SchedulerError::Register(definition.as_str().to_string(), e))?;

        let handle = self
            .inner
            .add(job)
            .await
            .map_err(|e| SchedulerError::Register(definition.as_str().to_string(), e))?;
        debug!(%handle, definition = %definition, "registered cron job");
        Ok(handle)
    }

    /// Remove a previously registered job. Used when regenerating a handle
    /// during startup recovery: the old (never-fired, pre-restart) handle
    /// doesn't exist in this process, so this is only ever called with a
    /// handle this same `Scheduler` produced.
    pub async fn unregister(&self, handle: Uuid) -> Result<(), SchedulerError> {
        self.inner
            .remove(&handle)
            .await
            .map_err(|e| SchedulerError::Register(handle.to_string(), e))
    }

    /// Stop accepting new firings and wait for in-flight ones to return.
    pub async fn shutdown(mut self) -> Result<(), SchedulerError> {
        self.inner.shutdown().await.map_err(SchedulerError::Shutdown)?;
        info!("scheduler drained and stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aion_task::Definition;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn register_returns_a_stable_handle() {
        let scheduler = Scheduler::start().await.unwrap();
        let definition = Definition::new("* * * * *");

        let handle = scheduler.register(&definition, || {}).await.unwrap();
        assert_ne!(handle, Uuid::nil());

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_an_invalid_definition() {
        let scheduler = Scheduler::start().await.unwrap();
        let definition = Definition::new("not a cron expression");

        let err = scheduler.register(&definition, || {}).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Register(_, _)));

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unregister_removes_a_handle() {
        let scheduler = Scheduler::start().await.unwrap();
        let definition = Definition::new("* * * * *");
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_closure = fired.clone();

        let handle = scheduler
            .register(&definition, move || {
                fired_in_closure.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        scheduler.unregister(handle).await.unwrap();
        scheduler.shutdown().await.unwrap();
    }
}
