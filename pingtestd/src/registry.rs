//! Named recurring jobs.
//!
//! [`JobRegistry`] is the capability the reconciler and the maintenance
//! setup drive: register by unique name, delete by name or name prefix.
//! [`CronRegistry`] backs it with `tokio-cron-scheduler` and mirrors every
//! registration into the `schedules` table. The mirror is authoritative:
//! another process (`--stop`) removes jobs by deleting rows, and the running
//! daemon drops live jobs whose rows are gone.

use crate::jobs::JobContext;
use crate::session::Connector;
use crate::store::{Store, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// `repeats` value for jobs that fire until deleted.
pub const REPEAT_FOREVER: i32 = -1;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    Cron { expr: String, reason: String },

    #[error("job runner error: {0}")]
    Runner(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("registry is not attached to a job runner")]
    Detached,
}

/// What a job does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTarget {
    RunScenario,
    RefreshCache,
    CleanupOldResults,
}

impl JobTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunScenario => "run_scenario",
            Self::RefreshCache => "refresh_cache",
            Self::CleanupOldResults => "cleanup_old_results",
        }
    }
}

impl fmt::Display for JobTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run_scenario" => Ok(Self::RunScenario),
            "refresh_cache" => Ok(Self::RefreshCache),
            "cleanup_old_results" => Ok(Self::CleanupOldResults),
            other => Err(format!("unknown job target '{other}'")),
        }
    }
}

/// A registration request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique; registering an existing name replaces that job.
    pub name: String,
    pub target: JobTarget,
    /// Positional arguments handed to the target.
    pub args: Vec<Value>,
    /// Five-field cron expression (minute first).
    pub cron: String,
    /// `-1` fires forever, `n > 0` fires n times then unregisters.
    pub repeats: i32,
}

impl JobSpec {
    pub fn recurring(
        name: impl Into<String>,
        target: JobTarget,
        args: Vec<Value>,
        cron: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target,
            args,
            cron: cron.into(),
            repeats: REPEAT_FOREVER,
        }
    }
}

/// Convert a five-field cron expression into the runner's seconds-first
/// form, rejecting anything the `cron` crate cannot parse.
pub fn runner_cron(expr: &str) -> Result<String, RegistryError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(RegistryError::Cron {
            expr: expr.to_string(),
            reason: format!("expected 5 fields, got {}", fields.len()),
        });
    }
    let with_seconds = format!("0 {}", fields.join(" "));
    cron::Schedule::from_str(&with_seconds).map_err(|e| RegistryError::Cron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })?;
    Ok(with_seconds)
}

/// Named recurring job capability.
pub trait JobRegistry: Send + Sync {
    /// Register `spec`, replacing any job with the same name.
    fn register(&self, spec: JobSpec) -> impl Future<Output = Result<(), RegistryError>> + Send;

    /// Delete the job called `name`; returns how many jobs were removed.
    fn delete_by_name(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<usize, RegistryError>> + Send;

    /// Delete every job whose name starts with `prefix`.
    fn delete_by_name_prefix(
        &self,
        prefix: &str,
    ) -> impl Future<Output = Result<usize, RegistryError>> + Send;

    /// Names of the registered jobs, sorted.
    fn names(&self) -> impl Future<Output = Result<Vec<String>, RegistryError>> + Send;

    /// Drop live jobs whose registration another process removed; returns
    /// their names, sorted.
    fn prune_withdrawn(&self) -> impl Future<Output = Result<Vec<String>, RegistryError>> + Send;
}

struct Runner<C> {
    scheduler: JobScheduler,
    context: Arc<JobContext<C>>,
}

/// `tokio-cron-scheduler` registry with a `schedules` table mirror.
pub struct CronRegistry<C> {
    runner: Option<Runner<C>>,
    jobs: Arc<Mutex<HashMap<String, Uuid>>>,
    store: Store,
}

fn runner_error(e: impl fmt::Display) -> RegistryError {
    RegistryError::Runner(e.to_string())
}

impl<C: Connector + 'static> CronRegistry<C> {
    /// Registry that runs jobs against `context`. Call [`Self::start`] to
    /// begin firing.
    pub async fn new(store: Store, context: Arc<JobContext<C>>) -> Result<Self, RegistryError> {
        let scheduler = JobScheduler::new().await.map_err(runner_error)?;
        Ok(Self {
            runner: Some(Runner { scheduler, context }),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            store,
        })
    }

    /// Registry that can only inspect and delete mirrored registrations.
    pub fn detached(store: Store) -> Self {
        Self {
            runner: None,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            store,
        }
    }

    /// Begin firing. Mirror rows without a live job are left over from an
    /// unclean exit and are removed first.
    pub async fn start(&self) -> Result<(), RegistryError> {
        let runner = self.runner.as_ref().ok_or(RegistryError::Detached)?;
        {
            let jobs = self.jobs.lock().await;
            let live: BTreeSet<String> = jobs.keys().cloned().collect();
            let stale = self
                .store
                .call(move |store| {
                    let mut removed = 0usize;
                    for name in store.schedule_names()? {
                        if !live.contains(&name) && store.delete_schedule(&name)? {
                            removed += 1;
                        }
                    }
                    Ok(removed)
                })
                .await?;
            if stale > 0 {
                info!("Removed {} stale schedule rows", stale);
            }
        }
        runner.scheduler.start().await.map_err(runner_error)?;
        info!("Job runner started");
        Ok(())
    }

    /// Stop firing jobs and withdraw this runner's mirror rows.
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        let Some(runner) = &self.runner else {
            return Ok(());
        };
        let mut scheduler = runner.scheduler.clone();
        scheduler.shutdown().await.map_err(runner_error)?;

        let names: Vec<String> = self.jobs.lock().await.drain().map(|(name, _)| name).collect();
        let count = names.len();
        self.store
            .call(move |store| {
                for name in &names {
                    store.delete_schedule(name)?;
                }
                Ok(())
            })
            .await?;
        info!("Job runner stopped, {} registrations withdrawn", count);
        Ok(())
    }

    fn build_job(&self, spec: &JobSpec, cron: &str, runner: &Runner<C>) -> Result<Job, RegistryError> {
        let name = spec.name.clone();
        let target = spec.target;
        let args = Arc::new(spec.args.clone());
        let remaining = Arc::new(AtomicI32::new(spec.repeats));
        let context = runner.context.clone();
        let jobs = self.jobs.clone();
        let store = self.store.clone();

        Job::new_async(cron, move |uuid, scheduler| {
            let name = name.clone();
            let args = args.clone();
            let remaining = remaining.clone();
            let context = context.clone();
            let jobs = jobs.clone();
            let store = store.clone();
            Box::pin(async move {
                debug!("Job {} fired", name);
                context.dispatch(target, &args).await;

                if remaining.load(Ordering::SeqCst) > 0
                    && remaining.fetch_sub(1, Ordering::SeqCst) == 1
                {
                    info!("Job {} used up its repeats, unregistering", name);
                    if let Err(e) = scheduler.remove(&uuid).await {
                        debug!("Removing finished job {} failed: {}", name, e);
                    }
                    let mut jobs = jobs.lock().await;
                    if jobs.get(&name) == Some(&uuid) {
                        jobs.remove(&name);
                        let row = name.clone();
                        if let Err(e) = store.call(move |store| store.delete_schedule(&row)).await {
                            warn!("Failed to drop schedule mirror for {}: {}", name, e);
                        }
                    }
                }
            })
        })
        .map_err(runner_error)
    }
}

impl<C: Connector + 'static> JobRegistry for CronRegistry<C> {
    async fn register(&self, spec: JobSpec) -> Result<(), RegistryError> {
        let cron = runner_cron(&spec.cron)?;
        let runner = self.runner.as_ref().ok_or(RegistryError::Detached)?;
        let job = self.build_job(&spec, &cron, runner)?;

        // Held across the mirror write so a concurrent prune never sees a
        // live job without its row.
        let mut jobs = self.jobs.lock().await;
        if let Some(previous) = jobs.remove(&spec.name) {
            debug!("Replacing job {}", spec.name);
            runner
                .scheduler
                .remove(&previous)
                .await
                .map_err(runner_error)?;
        }
        let id = runner.scheduler.add(job).await.map_err(runner_error)?;

        let row = spec.clone();
        if let Err(e) = self.store.call(move |store| store.upsert_schedule(&row)).await {
            if let Err(remove) = runner.scheduler.remove(&id).await {
                warn!("Rolling back job {} failed: {}", spec.name, remove);
            }
            return Err(e.into());
        }
        jobs.insert(spec.name.clone(), id);
        drop(jobs);

        info!("Registered job {} ({}, cron {})", spec.name, spec.target, spec.cron);
        Ok(())
    }

    async fn delete_by_name(&self, name: &str) -> Result<usize, RegistryError> {
        let mut jobs = self.jobs.lock().await;
        let live = jobs.remove(name);
        if let (Some(id), Some(runner)) = (live, &self.runner) {
            runner.scheduler.remove(&id).await.map_err(runner_error)?;
        }
        let row = name.to_string();
        let mirrored = self.store.call(move |store| store.delete_schedule(&row)).await?;
        drop(jobs);

        let removed = usize::from(live.is_some() || mirrored);
        if removed > 0 {
            info!("Deleted job {}", name);
        }
        Ok(removed)
    }

    async fn delete_by_name_prefix(&self, prefix: &str) -> Result<usize, RegistryError> {
        let mut removed = BTreeSet::new();
        let mut jobs = self.jobs.lock().await;
        let names: Vec<String> = jobs
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        for name in names {
            if let Some(id) = jobs.remove(&name) {
                if let Some(runner) = &self.runner {
                    runner.scheduler.remove(&id).await.map_err(runner_error)?;
                }
            }
            removed.insert(name);
        }
        let owned = prefix.to_string();
        removed.extend(
            self.store
                .call(move |store| store.delete_schedules_with_prefix(&owned))
                .await?,
        );
        drop(jobs);

        info!("Deleted {} jobs with prefix {}", removed.len(), prefix);
        Ok(removed.len())
    }

    async fn names(&self) -> Result<Vec<String>, RegistryError> {
        if self.runner.is_some() {
            let mut names: Vec<String> = self.jobs.lock().await.keys().cloned().collect();
            names.sort();
            return Ok(names);
        }
        let specs = self.store.call(|store| store.list_schedules()).await?;
        Ok(specs.into_iter().map(|spec| spec.name).collect())
    }

    async fn prune_withdrawn(&self) -> Result<Vec<String>, RegistryError> {
        let Some(runner) = &self.runner else {
            return Ok(Vec::new());
        };
        let mut jobs = self.jobs.lock().await;
        let mirrored: BTreeSet<String> = self
            .store
            .call(|store| store.schedule_names())
            .await?
            .into_iter()
            .collect();

        let mut withdrawn: Vec<String> = jobs
            .keys()
            .filter(|name| !mirrored.contains(*name))
            .cloned()
            .collect();
        withdrawn.sort();
        for name in &withdrawn {
            if let Some(id) = jobs.remove(name) {
                runner.scheduler.remove(&id).await.map_err(runner_error)?;
                info!("Job {} was removed externally, no longer firing", name);
            }
        }
        Ok(withdrawn)
    }
}
