//! Recent-result cache shared with the dashboard.
//!
//! Writes go to the store's `cache` table, which other processes read, and
//! to an in-process LRU that serves repeated reads until the entry expires.

use crate::store::{Store, StoreError};
use chrono::{DateTime, Utc};
use lru::LruCache;
use pingtest_common::TestResult;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

const CAPACITY: NonZeroUsize = NonZeroUsize::new(16).unwrap();

struct Entry {
    results: Arc<Vec<TestResult>>,
    expires_at: DateTime<Utc>,
}

/// Keyed result lists with per-entry expiry.
#[derive(Clone)]
pub struct ResultCache {
    entries: Arc<Mutex<LruCache<String, Entry>>>,
    store: Store,
}

impl ResultCache {
    pub fn new(store: Store) -> Self {
        Self {
            entries: Arc::new(Mutex::new(LruCache::new(CAPACITY))),
            store,
        }
    }

    /// Store `results` under `key` until `now + ttl`, replacing any
    /// previous value.
    pub fn set(
        &self,
        key: &str,
        results: Vec<TestResult>,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let expires_at = now + ttl;
        self.store.put_cached(key, &results, &expires_at)?;
        self.remember(key, Arc::new(results), expires_at);
        Ok(())
    }

    /// Live value for `key` as of `now`, from memory or the shared table.
    pub fn get(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Arc<Vec<TestResult>>>, StoreError> {
        {
            let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => return Ok(Some(entry.results.clone())),
                Some(_) => {
                    entries.pop(key);
                }
                None => {}
            }
        }

        match self.store.get_cached(key, &now)? {
            Some((results, expires_at)) => {
                let results = Arc::new(results);
                self.remember(key, results.clone(), expires_at);
                Ok(Some(results))
            }
            None => Ok(None),
        }
    }

    fn remember(&self, key: &str, results: Arc<Vec<TestResult>>, expires_at: DateTime<Utc>) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.put(key.to_string(), Entry { results, expires_at });
    }
}
