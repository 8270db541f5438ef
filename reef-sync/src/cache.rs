//! Single flight, time limited caching of remote requests

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared, TryFutureExt};
use reef_config::ChainType;
use tokio::time::Instant;

use crate::client::{BlockSource, ClientError, FeeRateSource};
use crate::primitives::{ChainHead, FeeRates};

/// A request shared by every caller waiting on the same key.
pub type SharedRequest<V, E> = Shared<BoxFuture<'static, Result<V, Arc<E>>>>;

/// State of a cache entry.
pub enum CachedRequest<V, E> {
    /// A request is in flight. Callers await it instead of starting their own.
    Loading { request: SharedRequest<V, E> },
    /// The value of the last successful request.
    Loaded { value: V, updated_at: Instant },
}

/// Caches the result of a request per key.
///
/// At most one request per key is in flight. Successful results are served until `ttl` has
/// elapsed and failed requests are evicted, so the next caller starts from scratch. A zero
/// `ttl` only deduplicates concurrent requests.
pub struct RequestCache<K, V, E> {
    ttl: Duration,
    entries: Mutex<HashMap<K, CachedRequest<V, E>>>,
}

impl<K, V, E> RequestCache<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached value of `key`, joining the in-flight request or starting `fetch`
    /// when there is none.
    pub async fn get<F, Fut>(&self, key: K, fetch: F) -> Result<V, Arc<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let request = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            match entries.get(&key) {
                Some(CachedRequest::Loaded { value, updated_at })
                    if updated_at.elapsed() < self.ttl =>
                {
                    return Ok(value.clone());
                }
                Some(CachedRequest::Loading { request }) => request.clone(),
                _ => {
                    let request = fetch().map_err(Arc::new).boxed().shared();
                    entries.insert(
                        key.clone(),
                        CachedRequest::Loading {
                            request: request.clone(),
                        },
                    );
                    request
                }
            }
        };

        let result = request.clone().await;

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        // the entry may have been invalidated or replaced while the request was in flight
        let owns_entry = matches!(
            entries.get(&key),
            Some(CachedRequest::Loading { request: current }) if current.ptr_eq(&request)
        );
        if owns_entry {
            match &result {
                Ok(value) if !self.ttl.is_zero() => {
                    entries.insert(
                        key,
                        CachedRequest::Loaded {
                            value: value.clone(),
                            updated_at: Instant::now(),
                        },
                    );
                }
                _ => {
                    entries.remove(&key);
                }
            }
        }

        result
    }

    /// Returns true while a request for `key` is in flight.
    pub fn is_loading(&self, key: &K) -> bool {
        matches!(
            self.entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key),
            Some(CachedRequest::Loading { .. })
        )
    }

    /// Forgets the entry of `key`. A request in flight still completes for its callers.
    pub fn invalidate(&self, key: &K) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Chain tip and fee rate lookups shared by wallet frontends.
pub struct ChainInfoCache<S> {
    source: Arc<S>,
    tips: RequestCache<ChainType, ChainHead, ClientError>,
    fee_rates: RequestCache<ChainType, FeeRates, ClientError>,
}

impl<S> ChainInfoCache<S>
where
    S: BlockSource + FeeRateSource + 'static,
{
    pub fn new(source: Arc<S>, ttl: Duration) -> Self {
        Self {
            source,
            tips: RequestCache::new(ttl),
            fee_rates: RequestCache::new(ttl),
        }
    }

    pub async fn latest_tip(&self, chain: ChainType) -> Result<ChainHead, Arc<ClientError>> {
        let source = self.source.clone();
        self.tips
            .get(chain, move || async move { source.get_latest_tip(chain).await })
            .await
    }

    pub async fn fee_rates(&self, chain: ChainType) -> Result<FeeRates, Arc<ClientError>> {
        let source = self.source.clone();
        self.fee_rates
            .get(chain, move || async move { source.get_fee_rates(chain).await })
            .await
    }

    /// Drops the cached tip, e.g. after a new block has been announced.
    pub fn invalidate_tip(&self, chain: ChainType) {
        self.tips.invalidate(&chain);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::testutils::{build_chain, MockBlockSource};

    fn counting_fetch(
        calls: &Arc<AtomicUsize>,
        result: Result<u64, &'static str>,
    ) -> impl Future<Output = Result<u64, &'static str>> + Send + 'static {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            result
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_share_one_fetch() {
        let cache = RequestCache::<&str, u64, &str>::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b, c) = tokio::join!(
            cache.get("tip", || counting_fetch(&calls, Ok(1))),
            cache.get("tip", || counting_fetch(&calls, Ok(2))),
            cache.get("tip", || counting_fetch(&calls, Ok(3))),
        );
        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (1, 1, 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn values_expire_after_the_ttl() {
        let cache = RequestCache::<&str, u64, &str>::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(cache.get("tip", || counting_fetch(&calls, Ok(1))).await, Ok(1));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.get("tip", || counting_fetch(&calls, Ok(2))).await, Ok(1));
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.get("tip", || counting_fetch(&calls, Ok(3))).await, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_evicted() {
        let cache = RequestCache::<&str, u64, &str>::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let err = cache
            .get("tip", || counting_fetch(&calls, Err("offline")))
            .await
            .unwrap_err();
        assert_eq!(*err, "offline");
        assert!(!cache.is_loading(&"tip"));

        assert_eq!(cache.get("tip", || counting_fetch(&calls, Ok(7))).await, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ttl_only_deduplicates() {
        let cache = RequestCache::<&str, u64, &str>::new(Duration::ZERO);
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            cache.get("asset", || counting_fetch(&calls, Ok(1))),
            cache.get("asset", || counting_fetch(&calls, Ok(2))),
        );
        assert_eq!((a, b), (Ok(1), Ok(1)));
        assert_eq!(cache.get("asset", || counting_fetch(&calls, Ok(3))).await, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn chain_info_is_cached_per_network() {
        let source = Arc::new(MockBlockSource::new(ChainType::Testnet, build_chain(5, 1)));
        let cache = ChainInfoCache::new(source.clone(), Duration::from_secs(10));

        let tip = cache.latest_tip(ChainType::Testnet).await.unwrap();
        assert_eq!(tip.sequence, 5);
        cache.latest_tip(ChainType::Testnet).await.unwrap();
        assert_eq!(source.tip_requests(), 1);

        cache.invalidate_tip(ChainType::Testnet);
        cache.latest_tip(ChainType::Testnet).await.unwrap();
        assert_eq!(source.tip_requests(), 2);

        assert!(cache.latest_tip(ChainType::Mainnet).await.is_err());
        assert_eq!(
            cache.fee_rates(ChainType::Testnet).await.unwrap(),
            source.fee_rates()
        );
    }
}
