//! Background runtime for remote tier reconciliation.
//!
//! Runs [`ProgressEngine::reconcile`] on a fixed interval so queued premium
//! writes reach the remote tier even when no further user activity triggers
//! a flush.

use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info};

use crate::config::RuntimeConfig;
use crate::engine::ProgressEngine;
use crate::error::{CadenceError, CadenceResult};

/// Background runtime managing the reconciliation job.
///
/// # Example
///
/// ```ignore
/// use cadence_core::{BackgroundRuntime, ProgressEngine};
///
/// let engine = Arc::new(ProgressEngine::builder(config, plans).build()?);
/// let mut runtime = BackgroundRuntime::new(engine.clone()).await?;
/// runtime.start().await?;
///
/// // ... application runs ...
///
/// runtime.shutdown().await?;
/// ```
pub struct BackgroundRuntime {
    scheduler: JobScheduler,
    engine: Arc<ProgressEngine>,
    config: RuntimeConfig,
    started: bool,
}

impl BackgroundRuntime {
    /// Create the runtime with the engine's runtime configuration.
    ///
    /// Call `start()` to begin background operations.
    pub async fn new(engine: Arc<ProgressEngine>) -> CadenceResult<Self> {
        let config = engine.config().runtime.clone();
        Self::with_config(engine, config).await
    }

    pub async fn with_config(engine: Arc<ProgressEngine>, config: RuntimeConfig) -> CadenceResult<Self> {
        debug!(
            reconcile_interval_secs = config.reconcile_interval_secs,
            "Creating BackgroundRuntime"
        );
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| CadenceError::internal(format!("Failed to create job scheduler: {}", e)))?;

        Ok(Self {
            scheduler,
            engine,
            config,
            started: false,
        })
    }

    /// Start periodic reconciliation.
    pub async fn start(&mut self) -> CadenceResult<()> {
        if self.started {
            return Ok(());
        }
        let engine = self.engine.clone();
        let interval_secs = self.config.reconcile_interval_secs.max(1);

        let job = Job::new_repeated_async(
            std::time::Duration::from_secs(interval_secs),
            move |_uuid, _lock| {
                let engine = engine.clone();
                Box::pin(async move {
                    debug!("Starting periodic reconciliation");
                    let report = engine.reconcile().await;
                    if report.failed > 0 {
                        error!(
                            failed = report.failed,
                            pending = report.pending,
                            "Reconciliation left writes pending"
                        );
                    }
                })
            },
        )
        .map_err(|e| CadenceError::internal(format!("Failed to create reconciliation job: {}", e)))?;

        self.scheduler
            .add(job)
            .await
            .map_err(|e| CadenceError::internal(format!("Failed to schedule reconciliation: {}", e)))?;

        if self.config.run_on_start {
            debug!("Running initial reconciliation on start");
            self.engine.reconcile().await;
        }

        self.scheduler
            .start()
            .await
            .map_err(|e| CadenceError::internal(format!("Failed to start job scheduler: {}", e)))?;
        self.started = true;

        info!(interval_secs, "Reconciliation runtime started");
        Ok(())
    }

    /// Stop the scheduler and push whatever is still queued.
    pub async fn shutdown(&mut self) -> CadenceResult<()> {
        debug!("Shutting down reconciliation runtime");
        if self.started {
            self.scheduler
                .shutdown()
                .await
                .map_err(|e| CadenceError::internal(format!("Failed to shutdown job scheduler: {}", e)))?;
            self.started = false;
        }

        let report = self.engine.reconcile().await;
        info!(pending = report.pending, "Reconciliation runtime stopped");
        Ok(())
    }

    pub fn engine(&self) -> &Arc<ProgressEngine> {
        &self.engine
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::traits::StaticPlanProvider;
    use crate::types::{ContentType, Plan, TierContext};

    async fn premium_engine() -> Arc<ProgressEngine> {
        let plans = Arc::new(StaticPlanProvider::new(0));
        plans.set(TierContext::new("u1", Plan::Premium, 0)).unwrap();
        let mut config = EngineConfig::default();
        config.write_queue.flush_in_background = false;
        Arc::new(
            ProgressEngine::builder(config, plans)
                .in_memory()
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_runtime_start_and_shutdown() {
        let engine = premium_engine().await;
        let mut runtime = BackgroundRuntime::new(engine).await.unwrap();
        runtime.start().await.unwrap();
        runtime.start().await.unwrap();
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_writes() {
        let engine = premium_engine().await;
        engine.introduce_item("u1", "kanji-1", ContentType::Kanji).await.unwrap();
        assert_eq!(engine.store().pending_writes(), 1);

        let mut runtime = BackgroundRuntime::new(engine.clone()).await.unwrap();
        runtime.shutdown().await.unwrap();
        assert_eq!(engine.store().pending_writes(), 0);
    }

    #[tokio::test]
    async fn test_run_on_start_reconciles_immediately() {
        let engine = premium_engine().await;
        engine.introduce_item("u1", "kanji-1", ContentType::Kanji).await.unwrap();

        let config = RuntimeConfig {
            run_on_start: true,
            ..engine.config().runtime.clone()
        };
        let mut runtime = BackgroundRuntime::with_config(engine.clone(), config).await.unwrap();
        runtime.start().await.unwrap();
        assert_eq!(engine.store().pending_writes(), 0);
        runtime.shutdown().await.unwrap();
    }
}
