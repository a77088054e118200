//! Per-session memo of denial sets.
//!
//! Entries are keyed by (consent id, confidence threshold) and live as long as the cache. A key
//! computes at most once at a time: concurrent callers for the same key wait on the in-flight
//! computation. Failed computations leave the entry empty so the next caller retries.
//!
//! The same [`OnceMap`] also memoises labeled indexes per threshold inside a session.

use crate::decision::DenialSet;
use crate::ConsentResult;
use consent_types::ConfidenceThreshold;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

/// Cache key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DecisionKey {
    pub consent_id: String,
    pub threshold: ConfidenceThreshold,
}

impl DecisionKey {
    pub fn new(consent_id: impl Into<String>, threshold: ConfidenceThreshold) -> Self {
        Self {
            consent_id: consent_id.into(),
            threshold,
        }
    }
}

/// Memo of computed denial sets for one session.
pub type DecisionCache = OnceMap<DecisionKey, DenialSet>;

/// Map of values computed at most once per key.
pub struct OnceMap<K, V> {
    entries: Mutex<HashMap<K, Arc<OnceCell<Arc<V>>>>>,
}

impl<K, V> Default for OnceMap<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> std::fmt::Debug for OnceMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnceMap").finish_non_exhaustive()
    }
}

impl<K, V> OnceMap<K, V>
where
    K: Clone + Eq + Hash + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached value for `key`, computing it with `compute` if absent.
    ///
    /// The map lock is only held while looking up the entry; `compute` runs under the entry's
    /// own cell, so other keys proceed concurrently.
    pub async fn get_or_compute<F, Fut>(&self, key: K, compute: F) -> ConsentResult<Arc<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ConsentResult<V>>,
    {
        let cell = {
            let mut entries = self.entries.lock().await;
            entries.entry(key.clone()).or_default().clone()
        };

        if let Some(cached) = cell.get() {
            tracing::debug!(?key, "cache hit");
            return Ok(cached.clone());
        }

        let value = cell
            .get_or_try_init(|| async move { compute().await.map(Arc::new) })
            .await?;
        Ok(value.clone())
    }

    /// Cached value for `key`, without computing.
    pub async fn get(&self, key: &K) -> Option<Arc<V>> {
        let entries = self.entries.lock().await;
        entries.get(key).and_then(|cell| cell.get().cloned())
    }

    /// Number of completed entries.
    pub async fn len(&self) -> usize {
        let entries = self.entries.lock().await;
        entries.values().filter(|cell| cell.initialized()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConsentError;
    use fhir::ResourceKey;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn key(consent: &str, hundredths: u16) -> DecisionKey {
        DecisionKey::new(
            consent,
            ConfidenceThreshold::from_hundredths(hundredths).unwrap(),
        )
    }

    fn denial(key: &str) -> DenialSet {
        [ResourceKey::from(key)].into_iter().collect()
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_computation() {
        let cache = Arc::new(DecisionCache::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(key("c1", 75), || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(denial("Condition/a"))
                    })
                    .await
            }));
        }

        for handle in handles {
            let denials = handle.await.expect("task").expect("computed");
            assert!(denials.contains(&ResourceKey::from("Condition/a")));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = DecisionCache::new();

        let err = cache
            .get_or_compute(key("c1", 50), || async {
                Err(ConsentError::LabelingFailed("down".into()))
            })
            .await
            .expect_err("should fail");
        assert!(matches!(err, ConsentError::LabelingFailed(_)));
        assert!(cache.is_empty().await);
        assert!(cache.get(&key("c1", 50)).await.is_none());

        let denials = cache
            .get_or_compute(key("c1", 50), || async { Ok(denial("Condition/b")) })
            .await
            .expect("second attempt computes");
        assert_eq!(denials.len(), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn new_threshold_is_a_new_entry_and_old_entries_survive() {
        let cache = DecisionCache::new();
        cache
            .get_or_compute(key("c1", 50), || async { Ok(denial("Condition/a")) })
            .await
            .expect("first");
        cache
            .get_or_compute(key("c1", 80), || async { Ok(DenialSet::new()) })
            .await
            .expect("second");

        assert_eq!(cache.len().await, 2);
        let first = cache.get(&key("c1", 50)).await.expect("kept");
        assert_eq!(first.len(), 1);

        let again = cache
            .get_or_compute(key("c1", 50), || async {
                Err(ConsentError::InvalidInput("recomputed".into()))
            })
            .await
            .expect("cached entry must not recompute");
        assert!(Arc::ptr_eq(&first, &again));
    }
}
