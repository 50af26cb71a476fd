//! Pool Lifecycle
//!
//! Import on promote, export under a hard deadline on demote.
//!
//! Import rules:
//! - altroot=/mnt, missing log tolerated, host ownership ignored
//! - ENOENT on the first attempt is retried once without the cache file
//! - one pool failing is a partial failure; every pool failing is fatal
//!
//! Export rules:
//! - every imported pool is exported concurrently
//! - the whole group shares one deadline
//! - a stuck or failed export takes the machine down through the rebooter

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::config::{ImportOptions, PoolRef};
use super::errors::{FailoverError, FailoverResult};
use super::report::{PoolFailure, TransitionReport};
use super::watchdog::Rebooter;
use crate::control::{CallResult, PoolStore, UnlockReport};

/// Imports and exports pools on behalf of the pipelines.
#[derive(Clone)]
pub struct PoolLifecycle {
    store: Arc<dyn PoolStore>,
    rebooter: Arc<dyn Rebooter>,
}

impl PoolLifecycle {
    pub fn new(store: Arc<dyn PoolStore>, rebooter: Arc<dyn Rebooter>) -> Self {
        Self { store, rebooter }
    }

    async fn import_one(&self, pool: &PoolRef) -> CallResult<()> {
        let options = ImportOptions::for_failover();
        match self.store.import_pool(pool.guid, &options).await {
            Err(e) if e.is_enoent() => {
                tracing::warn!(
                    pool = %pool.name,
                    guid = pool.guid,
                    "import failed with ENOENT, retrying without the cache file"
                );
                self.store
                    .import_pool(pool.guid, &options.without_cachefile())
                    .await
            }
            other => other,
        }
    }

    /// Import every pool. Partial failures are recorded on the report;
    /// `AllPoolsFailed` is returned only if nothing imported.
    pub async fn import_all(
        &self,
        pools: &[PoolRef],
        report: &mut TransitionReport,
    ) -> FailoverResult<()> {
        let mut unlock_jobs: Vec<(String, JoinHandle<CallResult<UnlockReport>>)> = Vec::new();

        for pool in pools {
            if pool.status.is_imported() {
                tracing::info!(pool = %pool.name, status = ?pool.status, "pool already imported");
                report.imported.push(pool.name.clone());
                continue;
            }

            tracing::info!(pool = %pool.name, guid = pool.guid, "importing pool");
            if let Err(e) = self.import_one(pool).await {
                tracing::error!(pool = %pool.name, guid = pool.guid, error = %e, "failed to import pool");
                report.pool_failures.push(PoolFailure {
                    name: pool.name.clone(),
                    guid: pool.guid,
                    error: e.to_string(),
                });
                continue;
            }
            report.imported.push(pool.name.clone());

            if let Err(e) = self.store.handle_unencrypted_datasets(&pool.name).await {
                tracing::warn!(pool = %pool.name, error = %e, "failed to handle unencrypted datasets");
                report.warn(format!("unencrypted datasets on {}: {}", pool.name, e));
            }

            let store = self.store.clone();
            let name = pool.name.clone();
            unlock_jobs.push((
                pool.name.clone(),
                tokio::spawn(async move { store.unlock_datasets(&name).await }),
            ));
        }

        for (pool, job) in unlock_jobs {
            match job.await {
                Ok(Ok(unlock)) if unlock.failed.is_empty() => {
                    tracing::info!(pool = %pool, "datasets unlocked");
                }
                Ok(Ok(unlock)) => {
                    tracing::error!(pool = %pool, failed = ?unlock.failed, "failed to unlock datasets");
                    report.warn(format!(
                        "datasets of {} left locked: {}",
                        pool,
                        unlock.failed.join(", ")
                    ));
                }
                Ok(Err(e)) => {
                    tracing::error!(pool = %pool, error = %e, "dataset unlock job failed");
                    report.warn(format!("dataset unlock job for {}: {}", pool, e));
                }
                Err(e) => {
                    tracing::error!(pool = %pool, error = %e, "dataset unlock job aborted");
                    report.warn(format!("dataset unlock job for {}: {}", pool, e));
                }
            }
        }

        if report.imported.is_empty() && !report.pool_failures.is_empty() {
            return Err(FailoverError::AllPoolsFailed {
                pools: report.pool_failures.iter().map(|f| f.name.clone()).collect(),
            });
        }

        for failure in &report.pool_failures {
            tracing::error!(pool = %failure.name, error = %failure.error, "continuing without pool");
        }

        Ok(())
    }

    /// Export every imported pool within `deadline`, or reboot.
    ///
    /// The deadline timer wins ties: an export group that has not finished
    /// when the deadline instant is reached fires the rebooter.
    pub async fn export_with_deadline(
        &self,
        pools: &[PoolRef],
        deadline: Duration,
        report: &mut TransitionReport,
    ) -> FailoverResult<()> {
        let names: Vec<String> = pools
            .iter()
            .filter(|p| p.status.is_imported())
            .map(|p| p.name.clone())
            .collect();

        if names.is_empty() {
            tracing::info!("no imported pools to export");
            return Ok(());
        }

        let started = Instant::now();
        let deadline_at = started + deadline;

        let exports: Vec<_> = names
            .into_iter()
            .map(|name| {
                let store = self.store.clone();
                tokio::spawn(async move {
                    tracing::info!(pool = %name, "exporting pool");
                    let result = store.export_pool(&name, true).await;
                    (name, result)
                })
            })
            .collect();
        let mut group = tokio::spawn(join_all(exports));

        let joined = tokio::select! {
            biased;
            _ = tokio::time::sleep_until(deadline_at) => None,
            joined = &mut group => Some(joined),
        };

        let finished = joined.is_some();
        let mut failed = Vec::new();
        match joined {
            Some(Ok(results)) => {
                for result in results {
                    match result {
                        Ok((name, Ok(()))) => report.exported.push(name),
                        Ok((name, Err(e))) => {
                            tracing::error!(pool = %name, error = %e, "failed to export pool");
                            failed.push(name);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "export task aborted");
                            failed.push("<aborted>".to_string());
                        }
                    }
                }
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "export group aborted");
                failed.push("<aborted>".to_string());
            }
            None => {
                tracing::error!(
                    deadline_ms = deadline.as_millis() as u64,
                    "pool export did not finish before the deadline"
                );
            }
        }

        if finished && failed.is_empty() {
            tracing::info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "exported every pool"
            );
            return Ok(());
        }

        report.sysrq_fired = true;
        if let Err(e) = self.rebooter.reboot() {
            tracing::error!(error = %e, "failed to trigger reboot");
        }

        Err(FailoverError::ExportDeadlineExceeded {
            elapsed: started.elapsed(),
        })
    }
}
