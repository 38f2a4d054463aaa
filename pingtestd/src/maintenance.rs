//! Housekeeping jobs: the dashboard cache refresh and result retention.

use crate::cache::ResultCache;
use crate::registry::{JobRegistry, JobSpec, JobTarget, RegistryError};
use crate::store::{Store, StoreError};
use chrono::{DateTime, Utc};
use tracing::{error, info};

pub const CACHE_REFRESH_JOB: &str = "cache_refresh";
pub const CLEANUP_JOB: &str = "db_cleanup";

/// Cache key the dashboard reads recent results from.
pub const CACHE_KEY: &str = "cached_results";
pub const CACHE_TTL: chrono::Duration = chrono::Duration::seconds(360);
pub const RECENT_LIMIT: usize = 50;

pub const RETENTION: chrono::Duration = chrono::Duration::hours(18);
pub const CLEANUP_BATCH_SIZE: usize = 1000;

pub const CACHE_CRON: &str = "*/7 * * * *";
pub const CLEANUP_CRON: &str = "0 */6 * * *";

/// Cache the most recent results, newest first. A failed query caches an
/// empty list so readers do not see stale data past the TTL.
pub fn refresh_cache(store: &Store, cache: &ResultCache, now: DateTime<Utc>) -> usize {
    let results = match store.recent_results(RECENT_LIMIT) {
        Ok(results) => results,
        Err(e) => {
            error!("Cache refresh failed: {}", e);
            Vec::new()
        }
    };
    let count = results.len();
    match cache.set(CACHE_KEY, results, CACHE_TTL, now) {
        Ok(()) => info!("Cached {} recent results", count),
        Err(e) => error!("Failed to write cached results: {}", e),
    }
    count
}

/// Delete results that started more than `retention` before `now`, in
/// batches of `batch_size`, each batch committed on its own.
pub fn cleanup_old_results(
    store: &Store,
    now: DateTime<Utc>,
    retention: chrono::Duration,
    batch_size: usize,
) -> Result<usize, StoreError> {
    let cutoff = now - retention;
    let mut total = 0;
    loop {
        let deleted = store.delete_results_before(&cutoff, batch_size)?;
        if deleted == 0 {
            break;
        }
        total += deleted;
        info!("Deleted {} records, total {}", deleted, total);
        if deleted < batch_size {
            break;
        }
    }
    info!("Cleanup finished: {} results older than {} removed", total, cutoff.to_rfc3339());
    Ok(total)
}

pub async fn schedule_cache_refresh<R: JobRegistry>(registry: &R) -> Result<(), RegistryError> {
    registry
        .register(JobSpec::recurring(
            CACHE_REFRESH_JOB,
            JobTarget::RefreshCache,
            Vec::new(),
            CACHE_CRON,
        ))
        .await
}

pub async fn schedule_cleanup<R: JobRegistry>(registry: &R) -> Result<(), RegistryError> {
    registry
        .register(JobSpec::recurring(
            CLEANUP_JOB,
            JobTarget::CleanupOldResults,
            Vec::new(),
            CLEANUP_CRON,
        ))
        .await
}

/// Remove both maintenance jobs; returns how many were registered.
pub async fn unschedule_maintenance<R: JobRegistry>(registry: &R) -> Result<usize, RegistryError> {
    let refresh = registry.delete_by_name_prefix(CACHE_REFRESH_JOB).await?;
    let cleanup = registry.delete_by_name(CLEANUP_JOB).await?;
    Ok(refresh + cleanup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::memory::MemoryRegistry;
    use chrono::TimeZone;
    use pingtest_common::TestResult;

    fn result_started(at: DateTime<Utc>, dest: &str) -> TestResult {
        let mut result = TestResult::pending("192.0.2.10", 23, dest, "R1");
        result.start_time = at;
        result.end_time = at;
        result
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_cleanup_keeps_recent_rows() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        for i in 0..5 {
            store
                .upsert_result(&result_started(now - chrono::Duration::hours(20), &format!("10.0.0.{i}")))
                .unwrap();
        }
        store
            .upsert_result(&result_started(now - chrono::Duration::hours(17), "10.0.1.1"))
            .unwrap();

        let removed = cleanup_old_results(&store, now, RETENTION, 2).unwrap();
        assert_eq!(removed, 5);
        let left = store.recent_results(10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].ping_destination, "10.0.1.1");
    }

    #[test]
    fn test_cleanup_on_empty_store() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(
            cleanup_old_results(&store, Utc::now(), RETENTION, CLEANUP_BATCH_SIZE).unwrap(),
            0
        );
    }

    #[test]
    fn test_refresh_cache_newest_first_and_capped() {
        let store = Store::open_in_memory().unwrap();
        let cache = ResultCache::new(store.clone());
        let now = noon();
        for i in 0..60 {
            let at = now - chrono::Duration::minutes(60 - i);
            store
                .upsert_result(&result_started(at, &format!("10.0.{}.{}", i / 250, i % 250)))
                .unwrap();
        }

        assert_eq!(refresh_cache(&store, &cache, now), RECENT_LIMIT);
        let cached = cache.get(CACHE_KEY, now).unwrap().unwrap();
        assert_eq!(cached.len(), RECENT_LIMIT);
        assert!(cached[0].end_time > cached[1].end_time);

        let (stored, expires_at) = store.get_cached(CACHE_KEY, &now).unwrap().unwrap();
        assert_eq!(stored.len(), RECENT_LIMIT);
        assert_eq!(expires_at, now + CACHE_TTL);

        let expired = now + CACHE_TTL + chrono::Duration::seconds(1);
        assert!(cache.get(CACHE_KEY, expired).unwrap().is_none());
    }

    #[test]
    fn test_failed_refresh_caches_empty_list() {
        let store = Store::open_in_memory().unwrap();
        let cache = ResultCache::new(store.clone());
        let now = noon();
        store
            .upsert_result(&result_started(now - chrono::Duration::minutes(5), "10.0.0.2"))
            .unwrap();
        assert_eq!(refresh_cache(&store, &cache, now), 1);

        store.execute_batch("UPDATE results SET success = 'XX'").unwrap();
        let later = now + chrono::Duration::minutes(7);
        assert_eq!(refresh_cache(&store, &cache, later), 0);

        let (stored, expires_at) = store.get_cached(CACHE_KEY, &later).unwrap().unwrap();
        assert!(stored.is_empty());
        assert_eq!(expires_at, later + CACHE_TTL);
        assert!(cache.get(CACHE_KEY, later).unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_schedule_and_unschedule() {
        let registry = MemoryRegistry::new();
        schedule_cache_refresh(&registry).await.unwrap();
        schedule_cleanup(&registry).await.unwrap();
        schedule_cache_refresh(&registry).await.unwrap();

        let spec = registry.spec(CLEANUP_JOB).unwrap();
        assert_eq!(spec.target, JobTarget::CleanupOldResults);
        assert_eq!(spec.cron, CLEANUP_CRON);
        assert_eq!(registry.live_names().len(), 2);

        assert_eq!(unschedule_maintenance(&registry).await.unwrap(), 2);
        assert!(registry.live_names().is_empty());
    }
}
