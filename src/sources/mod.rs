//! External pricing sources.
//!
//! Defines the source traits and provides implementations for:
//! - Marketplace (TCGplayer-style retail search) — current market price
//!   per listing, one search per rarity variant
//! - Auction (eBay-style sold listings) — PSA 10 graded sale prices,
//!   reduced to a robust central estimate
//!
//! Both traits are the mocking seam for the orchestrator's tests.

pub mod auction;
pub mod marketplace;

use async_trait::async_trait;

use crate::error::PipelineResult;
use crate::types::{AuctionPriceEstimate, CardQuery, Language, RawListing};

/// A source of current retail listings for a card query.
#[async_trait]
pub trait ListingSource: Send + Sync {
    /// Fetch listings across every rarity variant of the query's
    /// language. Individual rarity failures are skipped internally; an
    /// error here means the whole query failed.
    async fn fetch_listings(&self, query: &CardQuery) -> PipelineResult<Vec<RawListing>>;

    /// Source name for logging and identification.
    fn name(&self) -> &str;
}

/// A source of sold graded-sale price estimates.
#[async_trait]
pub trait SoldPriceSource: Send + Sync {
    /// Estimate the graded resale price for one card. Network and parse
    /// trouble yields `None` (logged at the implementation), never an
    /// error — a missing estimate is an expected outcome.
    async fn graded_price_estimate(
        &self,
        card_name: &str,
        set_name: &str,
        language: Language,
    ) -> Option<AuctionPriceEstimate>;

    fn name(&self) -> &str;
}
