//! Copy-on-refresh cache of chain snapshots. Readers clone an `Arc` and never
//! see a snapshot change underneath them.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::TradeError;
use crate::utils::sanitize_symbol;
use crate::venue::Venue;
use crate::types::ChainSnapshot;

#[derive(Default)]
pub struct ChainCache {
    snapshots: RwLock<HashMap<String, Arc<ChainSnapshot>>>,
}

impl ChainCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, underlying: &str) -> Option<Arc<ChainSnapshot>> {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&sanitize_symbol(underlying))
            .cloned()
    }

    pub fn insert(&self, snapshot: ChainSnapshot) -> Arc<ChainSnapshot> {
        let snap = Arc::new(snapshot);
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snap.underlying.clone(), Arc::clone(&snap));
        snap
    }

    /// Fetch and swap in a fresh snapshot. On failure the previous snapshot,
    /// if any, stays in place.
    pub async fn refresh(
        &self,
        venue: &dyn Venue,
        underlying: &str,
        timeout: Duration,
    ) -> Result<Arc<ChainSnapshot>, TradeError> {
        let symbol = sanitize_symbol(underlying);
        let fetched = tokio::time::timeout(timeout, venue.get_chain(&symbol))
            .await
            .map_err(|_| TradeError::VenueTimeout {
                op: "get_chain",
                after: timeout,
            })?
            .map_err(TradeError::Venue)?;
        if fetched.expirations().is_empty() || fetched.strikes().is_empty() {
            return Err(TradeError::ChainUnavailable(symbol));
        }
        debug!(
            symbol = %symbol,
            strikes = fetched.strikes().len(),
            expirations = fetched.expirations().len(),
            as_of = %fetched.as_of,
            "chain refreshed"
        );
        Ok(self.insert(fetched))
    }

    /// Refresh every listed underlying; returns how many succeeded.
    pub async fn refresh_all(
        &self,
        venue: &dyn Venue,
        underlyings: &[String],
        timeout: Duration,
    ) -> usize {
        let mut ok = 0;
        for u in underlyings {
            match self.refresh(venue, u, timeout).await {
                Ok(_) => ok += 1,
                Err(e) => warn!(symbol = %u, "chain refresh failed, keeping previous snapshot: {e}"),
            }
        }
        info!("chain refresh: {ok}/{} underlyings", underlyings.len());
        ok
    }

    /// Cached snapshot, or a single on-demand fetch for an unseen underlying.
    pub async fn get_or_fetch(
        &self,
        venue: &dyn Venue,
        underlying: &str,
        timeout: Duration,
    ) -> Result<Arc<ChainSnapshot>, TradeError> {
        if let Some(snap) = self.get(underlying) {
            return Ok(snap);
        }
        info!(symbol = %underlying, "no cached chain, fetching on demand");
        self.refresh(venue, underlying, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{date, MockVenue};
    use std::sync::atomic::Ordering;

    const T: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn on_demand_fetch_is_cached() {
        let venue = MockVenue::with_chain("AAPL", &[145.0, 150.0], &["20240105"]);
        let cache = ChainCache::new();
        assert!(cache.get("aapl").is_none());
        let first = cache.get_or_fetch(&venue, "aapl", T).await.unwrap();
        let second = cache.get_or_fetch(&venue, "AAPL", T).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(venue.chain_fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_old_snapshot() {
        let venue = MockVenue::with_chain("AAPL", &[145.0, 150.0], &["20240105"]);
        let cache = ChainCache::new();
        let old = cache.refresh(&venue, "AAPL", T).await.unwrap();

        venue.fail_chain.store(true, Ordering::SeqCst);
        let n = cache.refresh_all(&venue, &["AAPL".to_string()], T).await;
        assert_eq!(n, 0);
        assert!(Arc::ptr_eq(&old, &cache.get("AAPL").unwrap()));
    }

    #[tokio::test]
    async fn held_snapshot_survives_refresh() {
        let venue = MockVenue::with_chain("AAPL", &[145.0, 150.0], &["20240105"]);
        let cache = ChainCache::new();
        let held = cache.refresh(&venue, "AAPL", T).await.unwrap();

        venue.set_chain("AAPL", &[200.0], &["20240112"]);
        cache.refresh(&venue, "AAPL", T).await.unwrap();

        assert_eq!(held.strikes(), &[145.0, 150.0]);
        assert_eq!(cache.get("AAPL").unwrap().expirations(), &[date("20240112")]);
    }

    #[tokio::test]
    async fn empty_chain_is_unavailable() {
        let venue = MockVenue::with_chain("F", &[], &["20240105"]);
        let cache = ChainCache::new();
        assert!(matches!(
            cache.refresh(&venue, "F", T).await,
            Err(TradeError::ChainUnavailable(_))
        ));
        assert!(cache.get("F").is_none());
    }
}
