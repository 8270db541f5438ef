//! Asset metadata served from local storage and refreshed in the background

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reef_config::ChainType;

use crate::cache::RequestCache;
use crate::client::{AssetSource, ClientError};
use crate::primitives::{AssetId, StoredAsset};
use crate::traits::{AssetStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("Failed to fetch asset. {0}")]
    Client(#[from] ClientError),
    #[error("Failed to store asset. {0}")]
    Store(#[from] StoreError),
}

/// Returns true when `asset` was fetched at least `ttl` before `now`.
pub fn is_stale(asset: &StoredAsset, ttl: Duration, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(asset.updated_at)
        .to_std()
        .map_or(false, |age| age >= ttl)
}

/// Loads asset metadata per network.
///
/// Reads never wait on the network: the stored value is returned as is and a refresh is
/// started when it is missing or stale. Refreshes of the same asset are deduplicated.
pub struct AssetLoader<Src, St> {
    source: Arc<Src>,
    store: Arc<St>,
    ttl: Duration,
    refreshes: RequestCache<(ChainType, AssetId), StoredAsset, AssetError>,
}

impl<Src, St> AssetLoader<Src, St>
where
    Src: AssetSource + 'static,
    St: AssetStore + 'static,
{
    pub fn new(source: Arc<Src>, store: Arc<St>, ttl: Duration) -> Self {
        Self {
            source,
            store,
            ttl,
            refreshes: RequestCache::new(Duration::ZERO),
        }
    }

    /// Returns the stored asset, refreshing it in the background when missing or stale.
    pub async fn get_asset(
        self: &Arc<Self>,
        chain: ChainType,
        id: AssetId,
    ) -> Result<Option<StoredAsset>, StoreError> {
        let stored = self.store.get_asset(chain, &id).await?;

        let needs_refresh = stored
            .as_ref()
            .map_or(true, |asset| is_stale(asset, self.ttl, Utc::now()));
        if needs_refresh && !self.is_refreshing(chain, id) {
            let loader = self.clone();
            tokio::spawn(async move {
                if let Err(e) = loader.refresh(chain, id).await {
                    tracing::warn!("Failed to refresh asset {}. {}", id, e);
                }
            });
        }

        Ok(stored)
    }

    /// Fetches an asset and stores it, joining a refresh already in flight.
    pub async fn refresh(
        &self,
        chain: ChainType,
        id: AssetId,
    ) -> Result<StoredAsset, Arc<AssetError>> {
        let source = self.source.clone();
        let store = self.store.clone();
        self.refreshes
            .get((chain, id), move || async move {
                tracing::debug!("Refreshing asset {}.", id);
                let asset = source.get_asset(chain, &id).await?;
                let stored = StoredAsset {
                    asset,
                    updated_at: Utc::now(),
                };
                store.save_asset(chain, stored.clone()).await?;
                Ok(stored)
            })
            .await
    }

    pub fn is_refreshing(&self, chain: ChainType, id: AssetId) -> bool {
        self.refreshes.is_loading(&(chain, id))
    }
}
