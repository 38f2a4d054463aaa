//! What registered jobs run when they fire.

use crate::cache::ResultCache;
use crate::engine::TestEngine;
use crate::maintenance;
use crate::registry::JobTarget;
use crate::session::Connector;
use crate::store::Store;
use chrono::Utc;
use pingtest_common::TestResult;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Everything a job firing needs; shared by all jobs through an `Arc`.
pub struct JobContext<C> {
    engine: TestEngine<C>,
    store: Store,
    cache: ResultCache,
}

impl<C: Connector + 'static> JobContext<C> {
    pub fn new(engine: TestEngine<C>, store: Store, cache: ResultCache) -> Self {
        Self {
            engine,
            store,
            cache,
        }
    }

    /// Run `target`; failures are logged here and never reach the runner.
    pub async fn dispatch(&self, target: JobTarget, args: &[Value]) {
        match target {
            JobTarget::RunScenario => {
                self.run_scenario_job(args).await;
            }
            JobTarget::RefreshCache => {
                let cache = self.cache.clone();
                let refreshed = self
                    .store
                    .call(move |store| Ok(maintenance::refresh_cache(store, &cache, Utc::now())))
                    .await;
                if let Err(e) = refreshed {
                    error!("Cache refresh task failed: {}", e);
                }
            }
            JobTarget::CleanupOldResults => {
                let cleaned = self
                    .store
                    .call(|store| {
                        maintenance::cleanup_old_results(
                            store,
                            Utc::now(),
                            maintenance::RETENTION,
                            maintenance::CLEANUP_BATCH_SIZE,
                        )
                    })
                    .await;
                if let Err(e) = cleaned {
                    error!("Error during cleanup: {}", e);
                }
            }
        }
    }

    /// Execute one scenario and persist its result.
    pub async fn run_scenario_job(&self, args: &[Value]) -> TestResult {
        let result = self.engine.execute_args(args).await;
        let row = result.clone();
        match self.store.call(move |store| store.upsert_result(&row)).await {
            Ok(()) => info!("Saved result: {} ({})", result, result.outcome.code()),
            Err(e) => error!("Failed to save result {}: {}", result, e),
        }
        result
    }

    /// Execute every active scenario once, concurrently, and persist the
    /// results.
    pub async fn run_once(self: &Arc<Self>) -> Vec<TestResult> {
        let scenarios = match self.store.call(|store| store.list_active_scenarios()).await {
            Ok(scenarios) => scenarios,
            Err(e) => {
                warn!("Could not load active scenarios: {}", e);
                return Vec::new();
            }
        };
        info!("Running {} active scenarios once", scenarios.len());

        let mut tasks = JoinSet::new();
        for record in scenarios {
            let context = Arc::clone(self);
            tasks.spawn(async move { context.run_scenario_job(&record.args.to_args()).await });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!("Scenario task failed: {}", e),
            }
        }
        results
    }
}
