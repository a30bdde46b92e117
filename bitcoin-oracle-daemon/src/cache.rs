//! Latest published price, served until it goes stale

use bitcoin_oracle::BaselineResult;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct CachedPrice {
    baseline: BaselineResult,
    stored_at: Instant,
}

/// TTL cache holding the most recent ready baseline.
///
/// Shared by `Arc` between the tracker that fills it and whoever polls it.
#[derive(Debug)]
pub struct PriceCache {
    ttl: Duration,
    entry: RwLock<Option<CachedPrice>>,
}

impl PriceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: RwLock::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn store(&self, baseline: BaselineResult) {
        let mut entry = self.entry.write().await;
        *entry = Some(CachedPrice {
            baseline,
            stored_at: Instant::now(),
        });
    }

    /// The cached baseline, unless it is older than the TTL.
    pub async fn get(&self) -> Option<BaselineResult> {
        let entry = self.entry.read().await;
        entry
            .as_ref()
            .filter(|cached| cached.stored_at.elapsed() < self.ttl)
            .map(|cached| cached.baseline.clone())
    }

    /// Age of the cached entry, fresh or not.
    pub async fn age(&self) -> Option<Duration> {
        self.entry.read().await.as_ref().map(|cached| cached.stored_at.elapsed())
    }

    pub async fn clear(&self) {
        *self.entry.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin_oracle::BaselineStatus;
    use pretty_assertions::assert_eq;

    fn baseline(price: f64) -> BaselineResult {
        BaselineResult {
            price: Some(price),
            price_min: Some(price * 0.95),
            price_max: Some(price * 1.05),
            confidence: 0.9,
            intraday: Vec::new(),
            status: BaselineStatus::Ready,
            tip_height: Some(850_000),
            blocks_used: 144,
            window_version: 7,
            as_of: None,
        }
    }

    #[tokio::test]
    async fn test_empty_cache() {
        let cache = PriceCache::new(Duration::from_secs(60));
        assert_eq!(cache.get().await, None);
        assert_eq!(cache.age().await, None);
    }

    #[tokio::test]
    async fn test_fresh_entry_is_served() {
        let cache = PriceCache::new(Duration::from_secs(60));
        let stored = baseline(64_000.0);
        cache.store(stored.clone()).await;

        assert_eq!(cache.get().await, Some(stored));
        assert!(cache.age().await.is_some());
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let cache = PriceCache::new(Duration::from_millis(30));
        cache.store(baseline(64_000.0)).await;
        assert!(cache.get().await.is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get().await, None);
        assert!(cache.age().await.unwrap() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_store_replaces_and_clear_empties() {
        let cache = PriceCache::new(Duration::from_secs(60));
        cache.store(baseline(64_000.0)).await;
        cache.store(baseline(65_000.0)).await;
        assert_eq!(cache.get().await.and_then(|b| b.price), Some(65_000.0));

        cache.clear().await;
        assert_eq!(cache.get().await, None);
    }
}
