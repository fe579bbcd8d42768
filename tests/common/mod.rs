//! Hand-rolled mock sources and wiring helpers shared by the
//! integration tests.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gradegap::cache::Cache;
use gradegap::config::KnownSets;
use gradegap::engine::{Orchestrator, Reconciler};
use gradegap::error::{PipelineError, PipelineResult};
use gradegap::sources::{ListingSource, SoldPriceSource};
use gradegap::storage::CardStore;
use gradegap::types::{AuctionPriceEstimate, CardQuery, Language, RawListing};

/// Marketplace mock: scripted listings, optional forced failure, call
/// counting.
pub struct MockListingSource {
    listings: Mutex<Vec<RawListing>>,
    force_error: Mutex<bool>,
    calls: AtomicUsize,
}

impl MockListingSource {
    pub fn new(listings: Vec<RawListing>) -> Arc<Self> {
        Arc::new(Self {
            listings: Mutex::new(listings),
            force_error: Mutex::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_listings(&self, listings: Vec<RawListing>) {
        *self.listings.lock().unwrap() = listings;
    }

    pub fn set_force_error(&self, fail: bool) {
        *self.force_error.lock().unwrap() = fail;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ListingSource for MockListingSource {
    async fn fetch_listings(&self, _query: &CardQuery) -> PipelineResult<Vec<RawListing>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.force_error.lock().unwrap() {
            return Err(PipelineError::TransientFetch("mock outage".into()));
        }
        Ok(self.listings.lock().unwrap().clone())
    }

    fn name(&self) -> &str {
        "mock-marketplace"
    }
}

/// Auction mock: scripted estimate, call counting.
pub struct MockSoldPriceSource {
    estimate: Mutex<Option<AuctionPriceEstimate>>,
    calls: AtomicUsize,
}

impl MockSoldPriceSource {
    pub fn new(estimate: Option<AuctionPriceEstimate>) -> Arc<Self> {
        Arc::new(Self {
            estimate: Mutex::new(estimate),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SoldPriceSource for MockSoldPriceSource {
    async fn graded_price_estimate(
        &self,
        _card_name: &str,
        _set_name: &str,
        _language: Language,
    ) -> Option<AuctionPriceEstimate> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.estimate.lock().unwrap().clone()
    }

    fn name(&self) -> &str {
        "mock-auction"
    }
}

/// A Mew ex marketplace listing matching the graded estimate below.
pub fn mew_listing() -> RawListing {
    RawListing {
        title: "Mew ex 151/165".to_string(),
        price: dec!(50.00),
        set_name: "Pokemon Card 151".to_string(),
        rarity: "Ultra Rare".to_string(),
        product_id: "123".to_string(),
        card_number: Some("151/165".to_string()),
        fetched_at: Utc::now(),
    }
}

pub fn estimate(value: Decimal) -> AuctionPriceEstimate {
    AuctionPriceEstimate {
        value,
        sample_size: 4,
        fetched_at: Utc::now(),
    }
}

/// A fully wired orchestrator backed by the mocks and an in-memory
/// store/cache.
pub async fn pipeline(
    listings: Arc<MockListingSource>,
    sold: Arc<MockSoldPriceSource>,
) -> (Orchestrator, CardStore) {
    let store = CardStore::connect_in_memory()
        .await
        .expect("in-memory store");
    let cache = Arc::new(Cache::in_memory(24));
    let reconciler = Reconciler::new(sold, cache.clone(), 4);
    let orchestrator = Orchestrator::new(
        listings,
        reconciler,
        store.clone(),
        cache,
        KnownSets::default(),
        4,
    );
    (orchestrator, store)
}
