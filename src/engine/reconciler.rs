//! Matches marketplace listings with graded-auction price estimates.
//!
//! For every listing the reconciler resolves an auction estimate —
//! from the TTL cache when a live entry exists, otherwise from the
//! auction source — and merges the two sides into a [`ReconciledCard`].
//! A listing with no auction match is kept with null graded fields.
//! Estimate lookups are dispatched concurrently up to the configured
//! cap; the rate limiter inside the auction source provides the actual
//! backpressure.
//!
//! Only present estimates are cached: a `None` from the auction source
//! usually means transient trouble (thin sold history, a bad page) and
//! pinning that for a full TTL would suppress real data on the next run.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::debug;

use crate::cache::{cache_key, Cache};
use crate::sources::SoldPriceSource;
use crate::types::{AuctionPriceEstimate, Language, RawListing, ReconciledCard};

#[derive(Clone)]
pub struct Reconciler {
    sold_prices: Arc<dyn SoldPriceSource>,
    cache: Arc<Cache>,
    concurrency: usize,
}

impl Reconciler {
    pub fn new(sold_prices: Arc<dyn SoldPriceSource>, cache: Arc<Cache>, concurrency: usize) -> Self {
        Self {
            sold_prices,
            cache,
            concurrency: concurrency.max(1),
        }
    }

    /// Merge each listing with its auction estimate. Infallible: source
    /// trouble degrades to null graded fields, never to a dropped card.
    /// Output order matches input order regardless of lookup completion
    /// order.
    pub async fn reconcile(
        &self,
        language: Language,
        listings: Vec<RawListing>,
    ) -> Vec<ReconciledCard> {
        stream::iter(listings.into_iter().map(|listing| async move {
            let estimate = self.estimate_for(&listing, language).await;
            ReconciledCard::merge(&listing, language, estimate.as_ref())
        }))
            .buffered(self.concurrency)
            .collect()
            .await
    }

    async fn estimate_for(
        &self,
        listing: &RawListing,
        language: Language,
    ) -> Option<AuctionPriceEstimate> {
        let key = cache_key(
            "auction_estimate",
            &[&listing.title, &listing.set_name, &language.to_string()],
        );

        if let Some(cached) = self.cache.get_json::<AuctionPriceEstimate>(&key).await {
            debug!(card = %listing.title, "Auction estimate served from cache");
            return Some(cached);
        }

        let estimate = self
            .sold_prices
            .graded_price_estimate(&listing.title, &listing.set_name, language)
            .await;
        if let Some(est) = &estimate {
            self.cache.put_json(&key, est).await;
        }
        estimate
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sold-price source returning a fixed estimate (or nothing) and
    /// counting how often it is consulted.
    struct ScriptedSoldSource {
        estimate: Option<AuctionPriceEstimate>,
        calls: AtomicUsize,
    }

    impl ScriptedSoldSource {
        fn returning(estimate: Option<AuctionPriceEstimate>) -> Arc<Self> {
            Arc::new(Self {
                estimate,
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SoldPriceSource for ScriptedSoldSource {
        async fn graded_price_estimate(
            &self,
            _card_name: &str,
            _set_name: &str,
            _language: Language,
        ) -> Option<AuctionPriceEstimate> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.estimate.clone()
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn estimate(value: rust_decimal::Decimal) -> AuctionPriceEstimate {
        AuctionPriceEstimate {
            value,
            sample_size: 4,
            fetched_at: Utc::now(),
        }
    }

    /// Sold-price source that sleeps before answering, for timing tests.
    struct SlowSoldSource {
        delay: std::time::Duration,
    }

    #[async_trait]
    impl SoldPriceSource for SlowSoldSource {
        async fn graded_price_estimate(
            &self,
            _card_name: &str,
            _set_name: &str,
            _language: Language,
        ) -> Option<AuctionPriceEstimate> {
            tokio::time::sleep(self.delay).await;
            Some(estimate(dec!(80.00)))
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_reconcile_merges_estimate() {
        let source = ScriptedSoldSource::returning(Some(estimate(dec!(80.00))));
        let reconciler = Reconciler::new(source, Arc::new(Cache::in_memory(24)), 4);

        let cards = reconciler
            .reconcile(Language::Japanese, vec![RawListing::sample()])
            .await;

        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].market_price, Some(dec!(50.00)));
        assert_eq!(cards[0].graded_price, Some(dec!(80.00)));
        assert_eq!(cards[0].price_delta, Some(dec!(30.00)));
        assert_eq!(cards[0].profit_potential_pct, Some(dec!(60)));
    }

    #[tokio::test]
    async fn test_reconcile_without_estimate_keeps_listing() {
        let source = ScriptedSoldSource::returning(None);
        let reconciler = Reconciler::new(source, Arc::new(Cache::in_memory(24)), 4);

        let cards = reconciler
            .reconcile(Language::Japanese, vec![RawListing::sample()])
            .await;

        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].market_price, Some(dec!(50.00)));
        assert!(cards[0].graded_price.is_none());
        assert!(cards[0].price_delta.is_none());
    }

    #[tokio::test]
    async fn test_estimate_cached_across_runs() {
        let source = ScriptedSoldSource::returning(Some(estimate(dec!(80.00))));
        let reconciler = Reconciler::new(source.clone(), Arc::new(Cache::in_memory(24)), 4);

        reconciler
            .reconcile(Language::Japanese, vec![RawListing::sample()])
            .await;
        reconciler
            .reconcile(Language::Japanese, vec![RawListing::sample()])
            .await;

        // Second run is served from the cache
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test]
    async fn test_absent_estimate_is_not_cached() {
        let source = ScriptedSoldSource::returning(None);
        let reconciler = Reconciler::new(source.clone(), Arc::new(Cache::in_memory(24)), 4);

        reconciler
            .reconcile(Language::Japanese, vec![RawListing::sample()])
            .await;
        reconciler
            .reconcile(Language::Japanese, vec![RawListing::sample()])
            .await;

        // A miss must be retried next time, not pinned for a day
        assert_eq!(source.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimate_lookups_run_concurrently() {
        let delay = std::time::Duration::from_secs(1);
        let source = Arc::new(SlowSoldSource { delay });
        let reconciler = Reconciler::new(source, Arc::new(Cache::in_memory(24)), 4);

        let first = RawListing::sample();
        let mut second = RawListing::sample();
        second.title = "Pikachu ex 025/165".to_string();
        second.product_id = "456".to_string();

        let start = tokio::time::Instant::now();
        let cards = reconciler
            .reconcile(Language::Japanese, vec![first, second])
            .await;
        let elapsed = start.elapsed();

        assert_eq!(cards.len(), 2);
        // Two one-second lookups overlap instead of running back to back
        assert!(elapsed >= delay, "elapsed {elapsed:?}");
        assert!(elapsed < delay * 2, "lookups ran serially: {elapsed:?}");
    }

    #[tokio::test]
    async fn test_reconcile_empty_input() {
        let source = ScriptedSoldSource::returning(Some(estimate(dec!(80.00))));
        let reconciler = Reconciler::new(source.clone(), Arc::new(Cache::in_memory(24)), 4);

        let cards = reconciler.reconcile(Language::English, vec![]).await;
        assert!(cards.is_empty());
        assert_eq!(source.call_count(), 0);
    }
}
