//! Age and count based expiration for one cache scope
//!
//! Timestamps are tracked per normalized URL. An expiration pass walks the
//! entries newest first, keeps up to `max_entries` that are younger than
//! `max_age`, and deletes the rest from both the timestamp table and the
//! backing storage. Passes run on demand (after a write, before a read);
//! there is no background sweep.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use super::{normalize_key, CacheStorage, StoredResponse};
use crate::error::StorageError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpirationPolicy {
    pub max_entries: Option<usize>,
    pub max_age: Option<Duration>,
}

impl ExpirationPolicy {
    pub fn new(max_entries: usize, max_age: Duration) -> Self {
        Self {
            max_entries: Some(max_entries),
            max_age: Some(max_age),
        }
    }

    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let max_age = chrono::Duration::from_std(self.max_age?).ok()?;
        now.checked_sub_signed(max_age)
    }
}

#[derive(Debug)]
pub struct CacheExpiration {
    cache_name: String,
    policy: ExpirationPolicy,
    timestamps: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl CacheExpiration {
    pub fn new(cache_name: impl Into<String>, policy: ExpirationPolicy) -> Self {
        Self {
            cache_name: cache_name.into(),
            policy,
            timestamps: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn policy(&self) -> ExpirationPolicy {
        self.policy
    }

    pub fn update_timestamp(&self, url: &str, now: DateTime<Utc>) {
        self.table().insert(normalize_key(url), now);
    }

    /// True when a max age is configured and the URL is unknown or too old.
    pub fn is_url_expired(&self, url: &str, now: DateTime<Utc>) -> bool {
        let Some(cutoff) = self.policy.cutoff(now) else {
            return false;
        };
        match self.table().get(&normalize_key(url)) {
            Some(ts) => *ts < cutoff,
            None => true,
        }
    }

    /// A cached response is servable unless its `Date` header is older than
    /// `max_age`. Responses without a usable `Date` header are servable.
    pub fn is_response_fresh(&self, response: &StoredResponse, now: DateTime<Utc>) -> bool {
        match (self.policy.cutoff(now), response.date()) {
            (Some(cutoff), Some(date)) => date >= cutoff,
            _ => true,
        }
    }

    /// Delete expired entries; returns the URLs removed.
    pub async fn expire_entries(
        &self,
        storage: &dyn CacheStorage,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StorageError> {
        let expired = self.collect_expired(now);

        for url in &expired {
            storage.delete(&self.cache_name, url).await?;
        }

        if !expired.is_empty() {
            debug!(
                cache = %self.cache_name,
                removed = expired.len(),
                "Expired cache entries"
            );
        }
        Ok(expired)
    }

    fn collect_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = self.policy.cutoff(now);
        let mut table = self.table();

        let mut entries: Vec<(String, DateTime<Utc>)> =
            table.iter().map(|(k, v)| (k.clone(), *v)).collect();
        // Newest first
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut kept = 0usize;
        let mut expired = Vec::new();
        for (url, ts) in entries {
            let too_old = cutoff.is_some_and(|c| ts < c);
            let over_count = self.policy.max_entries.is_some_and(|max| kept >= max);
            if too_old || over_count {
                table.remove(&url);
                expired.push(url);
            } else {
                kept += 1;
            }
        }
        expired
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.timestamps.lock().unwrap_or_else(|e| e.into_inner())
    }
}
