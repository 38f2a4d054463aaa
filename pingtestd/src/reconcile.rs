//! Reconciliation of registered test jobs against the active scenarios.
//!
//! The reconciler remembers the last scenario tuple it saw for every id and,
//! on each poll, registers, replaces or deletes jobs so that the registry
//! holds exactly one job per derived name of an active, valid scenario.
//! Between polls it watches for jobs withdrawn by `--stop` from another
//! process and stands down once every scenario job is gone.

use crate::registry::{JobRegistry, JobSpec, JobTarget, RegistryError};
use crate::store::Store;
use pingtest_common::{JOB_NAMESPACE, ScenarioArgs};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Every scenario job fires on this schedule.
pub const TEST_CRON: &str = "*/7 * * * *";

/// How often the loop looks for jobs withdrawn by another process.
pub const WITHDRAWAL_CHECK: Duration = Duration::from_secs(10);

/// What one reconciliation pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: usize,
    pub changed: usize,
    pub removed: usize,
    /// Jobs restored because a deleted name was still derived by another
    /// scenario.
    pub reregistered: usize,
    /// Scenarios tracked but not scheduled because they failed validation.
    pub invalid: usize,
    /// Registry calls that failed; retried on the next pass.
    pub failed: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

fn scenario_job(args: &ScenarioArgs) -> JobSpec {
    JobSpec::recurring(args.job_name(), JobTarget::RunScenario, args.to_args(), TEST_CRON)
}

/// Owns the id → last-seen tuple map; moved into the poll task.
pub struct Reconciler<R> {
    registry: Arc<R>,
    scheduled: BTreeMap<i64, ScenarioArgs>,
}

impl<R: JobRegistry + 'static> Reconciler<R> {
    pub fn new(registry: Arc<R>) -> Self {
        Self {
            registry,
            scheduled: BTreeMap::new(),
        }
    }

    /// Register `args` if it is valid. `Ok(false)` means it was skipped as
    /// invalid.
    async fn schedule(&self, id: i64, args: &ScenarioArgs) -> Result<bool, RegistryError> {
        if let Err(e) = args.validate() {
            warn!("Scenario {} ({}) is invalid, not scheduling: {}", id, args, e);
            return Ok(false);
        }
        self.registry.register(scenario_job(args)).await?;
        Ok(true)
    }

    /// Apply one snapshot of active scenarios.
    pub async fn reconcile(&mut self, snapshot: BTreeMap<i64, ScenarioArgs>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut released = BTreeSet::new();
        let mut registered = BTreeSet::new();

        for (id, args) in &snapshot {
            match self.scheduled.get(id) {
                None => match self.schedule(*id, args).await {
                    Ok(valid) => {
                        if valid {
                            info!("Scheduled scenario {}: {}", id, args);
                            registered.insert(args.job_name());
                            report.added += 1;
                        } else {
                            report.invalid += 1;
                        }
                        self.scheduled.insert(*id, args.clone());
                    }
                    Err(e) => {
                        error!("Failed to schedule scenario {} ({}): {}", id, args, e);
                        report.failed += 1;
                    }
                },
                Some(previous) if previous != args => {
                    let old_name = previous.job_name();
                    if let Err(e) = self.registry.delete_by_name(&old_name).await {
                        error!("Failed to delete job {} for scenario {}: {}", old_name, id, e);
                        report.failed += 1;
                        continue;
                    }
                    registered.remove(&old_name);
                    released.insert(old_name);
                    match self.schedule(*id, args).await {
                        Ok(valid) => {
                            info!("Rescheduled scenario {}: {}", id, args);
                            if valid {
                                registered.insert(args.job_name());
                            } else {
                                report.invalid += 1;
                            }
                            self.scheduled.insert(*id, args.clone());
                            report.changed += 1;
                        }
                        Err(e) => {
                            error!("Failed to reschedule scenario {} ({}): {}", id, args, e);
                            report.failed += 1;
                        }
                    }
                }
                Some(_) => {}
            }
        }

        let vanished: Vec<i64> = self
            .scheduled
            .keys()
            .filter(|id| !snapshot.contains_key(id))
            .copied()
            .collect();
        for id in vanished {
            let name = self.scheduled[&id].job_name();
            match self.registry.delete_by_name(&name).await {
                Ok(_) => {
                    info!("Unscheduled scenario {} ({})", id, name);
                    self.scheduled.remove(&id);
                    registered.remove(&name);
                    released.insert(name);
                    report.removed += 1;
                }
                Err(e) => {
                    error!("Failed to delete job {} for scenario {}: {}", name, id, e);
                    report.failed += 1;
                }
            }
        }

        // A deleted name may still be derived by another scenario with the
        // same device and destination, possibly one registered earlier in
        // this pass.
        for name in released.difference(&registered) {
            let owner = self
                .scheduled
                .values()
                .find(|args| args.job_name() == *name && args.validate().is_ok());
            if let Some(args) = owner {
                match self.registry.register(scenario_job(args)).await {
                    Ok(()) => {
                        debug!("Re-registered shared job {}", name);
                        report.reregistered += 1;
                    }
                    Err(e) => {
                        error!("Failed to re-register job {}: {}", name, e);
                        report.failed += 1;
                    }
                }
            }
        }

        report
    }

    /// Fetch the active scenarios and reconcile. A failed fetch skips the
    /// pass and leaves the state untouched.
    pub async fn poll_once(&mut self, store: &Store) -> Option<ReconcileReport> {
        let snapshot: BTreeMap<i64, ScenarioArgs> = match store
            .call(|store| store.list_active_scenarios())
            .await
        {
            Ok(records) => records.into_iter().map(|r| (r.id, r.args)).collect(),
            Err(e) => {
                warn!("Failed to load active scenarios, skipping this poll: {}", e);
                return None;
            }
        };
        let report = self.reconcile(snapshot).await;
        if report.is_noop() {
            debug!("Reconcile: no changes ({} scenarios tracked)", self.scheduled.len());
        } else {
            info!(
                "Reconcile: added={}, changed={}, removed={}, reregistered={}, invalid={}, failed={}",
                report.added,
                report.changed,
                report.removed,
                report.reregistered,
                report.invalid,
                report.failed
            );
        }
        Some(report)
    }

    /// Drop jobs another process withdrew. Returns true when no scenario
    /// job is left, which is how `--stop` tells a running daemon to stand
    /// down. After a partial withdrawal the affected scenarios are forgotten
    /// so the next poll registers them again.
    pub async fn sync_withdrawn(&mut self) -> Result<bool, RegistryError> {
        let withdrawn = self.registry.prune_withdrawn().await?;
        let scenario_jobs: BTreeSet<&String> = withdrawn
            .iter()
            .filter(|name| name.starts_with(JOB_NAMESPACE))
            .collect();
        if scenario_jobs.is_empty() {
            return Ok(false);
        }

        let remaining = self
            .registry
            .names()
            .await?
            .iter()
            .any(|name| name.starts_with(JOB_NAMESPACE));
        if !remaining {
            return Ok(true);
        }
        self.scheduled
            .retain(|_, args| !scenario_jobs.contains(&args.job_name()));
        info!("{} scenario jobs withdrawn externally, restoring on next poll", scenario_jobs.len());
        Ok(false)
    }

    /// Start the poll loop; it polls immediately, then every `period`, until
    /// `cancel` fires or every scenario job has been withdrawn externally.
    pub fn start(mut self, store: Store, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut withdrawals = interval(WITHDRAWAL_CHECK);
            withdrawals.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "Reconcile loop started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.poll_once(&store).await;
                    }
                    _ = withdrawals.tick() => match self.sync_withdrawn().await {
                        Ok(true) => {
                            info!("All scheduled tests were stopped externally");
                            break;
                        }
                        Ok(false) => {}
                        Err(e) => warn!("Failed to check for withdrawn jobs: {}", e),
                    },
                }
            }
            info!("Reconcile loop stopped");
        })
    }
}

/// Delete every scenario job; returns how many were removed.
pub async fn stop_all<R: JobRegistry>(registry: &R) -> Result<usize, RegistryError> {
    registry.delete_by_name_prefix(JOB_NAMESPACE).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::memory::MemoryRegistry;
    use proptest::prelude::*;

    fn scenario(device: &str, dest: &str, label: &str) -> ScenarioArgs {
        ScenarioArgs::new("192.0.2.10", 23, dest, device, label)
    }

    fn snapshot(entries: &[(i64, ScenarioArgs)]) -> BTreeMap<i64, ScenarioArgs> {
        entries.iter().cloned().collect()
    }

    fn desired(snapshot: &BTreeMap<i64, ScenarioArgs>) -> BTreeSet<String> {
        snapshot
            .values()
            .filter(|args| args.validate().is_ok())
            .map(ScenarioArgs::job_name)
            .collect()
    }

    fn reconciler() -> (Arc<MemoryRegistry>, Reconciler<MemoryRegistry>) {
        let registry = Arc::new(MemoryRegistry::new());
        (registry.clone(), Reconciler::new(registry))
    }

    #[tokio::test]
    async fn test_new_scenarios_are_registered() {
        let (registry, mut reconciler) = reconciler();
        let report = reconciler
            .reconcile(snapshot(&[
                (1, scenario("R1", "10.0.0.2", "uplink")),
                (2, scenario("R2", "10.0.0.3", "backup")),
            ]))
            .await;

        assert_eq!(report.added, 2);
        let spec = registry.spec("network_test_schedule_R1_10.0.0.2").unwrap();
        assert_eq!(spec.target, JobTarget::RunScenario);
        assert_eq!(spec.cron, TEST_CRON);
        assert_eq!(spec.repeats, -1);
        assert_eq!(spec.args, scenario("R1", "10.0.0.2", "uplink").to_args());
    }

    #[tokio::test]
    async fn test_unchanged_snapshot_is_noop() {
        let (registry, mut reconciler) = reconciler();
        let snap = snapshot(&[(1, scenario("R1", "10.0.0.2", "uplink"))]);
        reconciler.reconcile(snap.clone()).await;
        let report = reconciler.reconcile(snap).await;
        assert!(report.is_noop());
        assert_eq!(registry.registrations().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_scenario_moves_job() {
        let (registry, mut reconciler) = reconciler();
        reconciler
            .reconcile(snapshot(&[(1, scenario("R1", "10.0.0.2", "uplink"))]))
            .await;
        let report = reconciler
            .reconcile(snapshot(&[(1, scenario("R1", "10.0.0.9", "uplink"))]))
            .await;

        assert_eq!(report.changed, 1);
        assert_eq!(
            registry.live_names(),
            BTreeSet::from(["network_test_schedule_R1_10.0.0.9".to_string()])
        );
    }

    #[tokio::test]
    async fn test_label_change_reregisters_same_name() {
        let (registry, mut reconciler) = reconciler();
        reconciler
            .reconcile(snapshot(&[(1, scenario("R1", "10.0.0.2", "uplink"))]))
            .await;
        reconciler
            .reconcile(snapshot(&[(1, scenario("R1", "10.0.0.2", "renamed"))]))
            .await;

        let spec = registry.spec("network_test_schedule_R1_10.0.0.2").unwrap();
        assert_eq!(spec.args[4], "renamed");
        assert_eq!(registry.registrations().len(), 2);
    }

    #[tokio::test]
    async fn test_vanished_scenario_is_deleted() {
        let (registry, mut reconciler) = reconciler();
        reconciler
            .reconcile(snapshot(&[
                (1, scenario("R1", "10.0.0.2", "uplink")),
                (2, scenario("R2", "10.0.0.3", "backup")),
            ]))
            .await;
        let report = reconciler
            .reconcile(snapshot(&[(2, scenario("R2", "10.0.0.3", "backup"))]))
            .await;

        assert_eq!(report.removed, 1);
        assert!(!reconciler.scheduled.contains_key(&1));
        assert_eq!(
            registry.live_names(),
            BTreeSet::from(["network_test_schedule_R2_10.0.0.3".to_string()])
        );
    }

    #[tokio::test]
    async fn test_invalid_scenario_tracked_but_not_registered() {
        let (registry, mut reconciler) = reconciler();
        let mut bad = scenario("R1", "10.0.0.2", "uplink");
        bad.port = 70000;
        let report = reconciler.reconcile(snapshot(&[(1, bad.clone())])).await;

        assert_eq!(report.invalid, 1);
        assert!(registry.live_names().is_empty());
        assert_eq!(reconciler.scheduled.get(&1), Some(&bad));

        let report = reconciler.reconcile(snapshot(&[(1, bad)])).await;
        assert!(report.is_noop());
    }

    #[tokio::test]
    async fn test_failed_registration_retried_next_pass() {
        let (registry, mut reconciler) = reconciler();
        registry.fail_registrations_of("network_test_schedule_R1_10.0.0.2");
        let snap = snapshot(&[(1, scenario("R1", "10.0.0.2", "uplink"))]);

        let report = reconciler.reconcile(snap.clone()).await;
        assert_eq!(report.failed, 1);
        assert!(reconciler.scheduled.is_empty());

        registry.clear_failures();
        let report = reconciler.reconcile(snap).await;
        assert_eq!(report.added, 1);
        assert_eq!(registry.live_names().len(), 1);
    }

    #[tokio::test]
    async fn test_shared_name_survives_removal_of_one_owner() {
        let (registry, mut reconciler) = reconciler();
        reconciler
            .reconcile(snapshot(&[
                (1, scenario("R1", "10.0.0.2", "first")),
                (2, scenario("R1", "10.0.0.2", "second")),
            ]))
            .await;
        let report = reconciler
            .reconcile(snapshot(&[(2, scenario("R1", "10.0.0.2", "second"))]))
            .await;

        assert_eq!(report.removed, 1);
        assert_eq!(report.reregistered, 1);
        let spec = registry.spec("network_test_schedule_R1_10.0.0.2").unwrap();
        assert_eq!(spec.args[4], "second");
    }

    #[tokio::test]
    async fn test_poll_once_reads_store() {
        let store = Store::open_in_memory().unwrap();
        let (registry, mut reconciler) = reconciler();
        let id = store.insert_scenario(&scenario("R1", "10.0.0.2", "uplink")).unwrap();
        store.insert_scenario(&scenario("R2", "10.0.0.3", "backup")).unwrap();

        reconciler.poll_once(&store).await.unwrap();
        assert_eq!(registry.live_names().len(), 2);

        store.set_scenario_active(id, false).unwrap();
        let report = reconciler.poll_once(&store).await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(
            registry.live_names(),
            BTreeSet::from(["network_test_schedule_R2_10.0.0.3".to_string()])
        );
    }

    #[tokio::test]
    async fn test_stop_all_only_removes_scenario_jobs() {
        let (registry, mut reconciler) = reconciler();
        reconciler
            .reconcile(snapshot(&[(1, scenario("R1", "10.0.0.2", "uplink"))]))
            .await;
        registry
            .register(JobSpec::recurring("db_cleanup", JobTarget::CleanupOldResults, vec![], "0 */6 * * *"))
            .await
            .unwrap();

        assert_eq!(stop_all(registry.as_ref()).await.unwrap(), 1);
        assert_eq!(
            registry.live_names(),
            BTreeSet::from(["db_cleanup".to_string()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_polls_until_cancelled() {
        let store = Store::open_in_memory().unwrap();
        store.insert_scenario(&scenario("R1", "10.0.0.2", "uplink")).unwrap();
        let (registry, reconciler) = reconciler();
        let cancel = CancellationToken::new();

        let handle = reconciler.start(store.clone(), Duration::from_secs(360), cancel.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(registry.live_names().len(), 1);

        store.insert_scenario(&scenario("R2", "10.0.0.3", "backup")).unwrap();
        tokio::time::sleep(Duration::from_secs(360)).await;
        assert_eq!(registry.live_names().len(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_withdrawal_is_restored_next_pass() {
        let (registry, mut reconciler) = reconciler();
        let snap = snapshot(&[
            (1, scenario("R1", "10.0.0.2", "uplink")),
            (2, scenario("R2", "10.0.0.3", "backup")),
        ]);
        reconciler.reconcile(snap.clone()).await;

        registry.withdraw_externally("network_test_schedule_R1");
        assert!(!reconciler.sync_withdrawn().await.unwrap());
        assert_eq!(registry.live_names().len(), 1);
        assert!(!reconciler.scheduled.contains_key(&1));

        let report = reconciler.reconcile(snap.clone()).await;
        assert_eq!(report.added, 1);
        assert_eq!(registry.live_names(), desired(&snap));
    }

    #[tokio::test]
    async fn test_maintenance_withdrawal_does_not_stand_down() {
        let (registry, mut reconciler) = reconciler();
        reconciler
            .reconcile(snapshot(&[(1, scenario("R1", "10.0.0.2", "uplink"))]))
            .await;
        registry
            .register(JobSpec::recurring("db_cleanup", JobTarget::CleanupOldResults, vec![], "0 */6 * * *"))
            .await
            .unwrap();

        registry.withdraw_externally("db_cleanup");
        assert!(!reconciler.sync_withdrawn().await.unwrap());
        assert_eq!(
            registry.live_names(),
            BTreeSet::from(["network_test_schedule_R1_10.0.0.2".to_string()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stands_down_after_external_stop() {
        let store = Store::open_in_memory().unwrap();
        store.insert_scenario(&scenario("R1", "10.0.0.2", "uplink")).unwrap();
        store.insert_scenario(&scenario("R2", "10.0.0.3", "backup")).unwrap();
        let (registry, reconciler) = reconciler();
        let cancel = CancellationToken::new();

        let handle = reconciler.start(store, Duration::from_secs(360), cancel.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(registry.live_names().len(), 2);

        registry.withdraw_externally(JOB_NAMESPACE);
        tokio::time::sleep(WITHDRAWAL_CHECK).await;
        assert!(registry.live_names().is_empty());
        tokio::time::timeout(Duration::from_secs(60), handle)
            .await
            .expect("loop stands down without cancellation")
            .unwrap();
        assert!(!cancel.is_cancelled());
    }

    fn arb_scenario() -> impl Strategy<Value = ScenarioArgs> {
        (
            prop::sample::select(vec!["R1", "R2", "R 3"]),
            prop::sample::select(vec!["10.0.0.2", "10.0.0.3"]),
            prop::sample::select(vec![23i64, 0]),
            prop::sample::select(vec!["a", "b"]),
        )
            .prop_map(|(device, dest, port, label)| {
                ScenarioArgs::new("192.0.2.10", port, dest, device, label)
            })
    }

    fn arb_snapshot() -> impl Strategy<Value = BTreeMap<i64, ScenarioArgs>> {
        prop::collection::btree_map(0i64..6, arb_scenario(), 0..6)
    }

    proptest! {
        #[test]
        fn prop_registry_converges_to_active_valid_set(
            snapshots in prop::collection::vec(arb_snapshot(), 1..8)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let (registry, mut reconciler) = reconciler();
                for snap in snapshots {
                    reconciler.reconcile(snap.clone()).await;
                    prop_assert_eq!(registry.live_names(), desired(&snap));
                }
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
