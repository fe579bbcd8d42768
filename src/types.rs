//! Shared types for the GRADEGAP pipeline.
//!
//! These types form the data model used across all modules: query
//! descriptors going in, scraped listings and auction estimates in the
//! middle, reconciled/stored cards and run logs coming out. Fetchers,
//! the reconciler, storage and the API all depend on this module and
//! nothing here depends back on them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Language & rarity vocabulary
// ---------------------------------------------------------------------------

/// Card print language. Determines the rarity vocabulary and which
/// marketplace product line is searched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    English,
    Japanese,
}

impl Language {
    /// The fixed rarity vocabulary for this language. Listings whose
    /// rarity falls outside this list are discarded by the fetcher.
    pub fn rarities(&self) -> &'static [&'static str] {
        match self {
            Language::English => &[
                "Special Illustration Rare",
                "Illustration Rare",
                "Hyper Rare",
            ],
            Language::Japanese => &[
                "Art Rare",
                "Super Rare",
                "Special Art Rare",
                "Ultra Rare",
            ],
        }
    }

    /// Marketplace product-line slug used in search URLs.
    pub fn product_line(&self) -> &'static str {
        match self {
            Language::English => "pokemon",
            Language::Japanese => "pokemon-japan",
        }
    }

    pub fn both() -> [Language; 2] {
        [Language::English, Language::Japanese]
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::English => write!(f, "English"),
            Language::Japanese => write!(f, "Japanese"),
        }
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "English" => Ok(Language::English),
            "Japanese" => Ok(Language::Japanese),
            other => Err(format!("unknown language: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// CardQuery
// ---------------------------------------------------------------------------

/// Input descriptor for one pipeline request. Immutable once built.
///
/// `name` may be empty for set-only searches (bulk mode).
/// `known_product_id` is set on refresh requests and pins the
/// marketplace fetch to a single product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardQuery {
    pub name: String,
    pub set_name: Option<String>,
    pub language: Language,
    pub known_product_id: Option<String>,
}

impl CardQuery {
    pub fn new(name: impl Into<String>, set_name: Option<String>, language: Language) -> Self {
        Self {
            name: name.into(),
            set_name,
            language,
            known_product_id: None,
        }
    }

    /// A set-only query used by the bulk "scrape all sets" plan.
    pub fn for_set(set_name: impl Into<String>, language: Language) -> Self {
        Self {
            name: String::new(),
            set_name: Some(set_name.into()),
            language,
            known_product_id: None,
        }
    }

    /// Whitespace-separated search terms of the query name, lowercased.
    /// Empty for set-only queries.
    pub fn name_terms(&self) -> Vec<String> {
        self.name
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect()
    }
}

impl fmt::Display for CardQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] ({})",
            if self.name.is_empty() { "<set search>" } else { &self.name },
            self.set_name.as_deref().unwrap_or("any set"),
            self.language,
        )
    }
}

// ---------------------------------------------------------------------------
// RawListing
// ---------------------------------------------------------------------------

/// One scraped marketplace row. Ephemeral — consumed by the reconciler
/// and never persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub title: String,
    /// Current market price. Always positive: the fetcher discards
    /// non-positive or absurd values before constructing a listing.
    pub price: Decimal,
    pub set_name: String,
    pub rarity: String,
    /// Marketplace product identifier extracted from the detail URL.
    pub product_id: String,
    /// Card number (e.g. "151/165") recovered from the title, if any.
    pub card_number: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl RawListing {
    /// A sample listing for tests.
    #[cfg(test)]
    pub fn sample() -> Self {
        use rust_decimal_macros::dec;
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
}

// ---------------------------------------------------------------------------
// AuctionPriceEstimate
// ---------------------------------------------------------------------------

/// Robust central estimate over a sample of sold graded-auction prices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionPriceEstimate {
    pub value: Decimal,
    /// Number of sold prices that survived filtering.
    pub sample_size: usize,
    pub fetched_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ReconciledCard
// ---------------------------------------------------------------------------

/// A marketplace listing merged with its auction price estimate.
///
/// Listings with no auction match are retained with null graded-price
/// fields rather than dropped — the marketplace price signal alone is
/// still worth persisting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledCard {
    pub card_name: String,
    pub set_name: String,
    pub language: Language,
    pub rarity: String,
    pub product_id: String,
    pub card_number: Option<String>,
    pub market_price: Option<Decimal>,
    pub market_price_fetched_at: Option<DateTime<Utc>>,
    pub graded_price: Option<Decimal>,
    pub graded_price_fetched_at: Option<DateTime<Utc>>,
    pub price_delta: Option<Decimal>,
    pub profit_potential_pct: Option<Decimal>,
}

impl ReconciledCard {
    /// Merge a listing with an optional auction estimate, computing the
    /// derived metrics. This is the only constructor — it guarantees the
    /// delta/profit invariant holds on every instance.
    pub fn merge(
        listing: &RawListing,
        language: Language,
        estimate: Option<&AuctionPriceEstimate>,
    ) -> Self {
        let market_price = Some(listing.price);
        let graded_price = estimate.map(|e| e.value);
        let delta = price_delta(graded_price, market_price);
        Self {
            card_name: listing.title.clone(),
            set_name: listing.set_name.clone(),
            language,
            rarity: listing.rarity.clone(),
            product_id: listing.product_id.clone(),
            card_number: listing.card_number.clone(),
            market_price,
            market_price_fetched_at: Some(listing.fetched_at),
            graded_price,
            graded_price_fetched_at: estimate.map(|e| e.fetched_at),
            price_delta: delta,
            profit_potential_pct: profit_potential_pct(delta, market_price),
        }
    }
}

/// `graded - market`, or None when either side is missing.
pub fn price_delta(graded: Option<Decimal>, market: Option<Decimal>) -> Option<Decimal> {
    match (graded, market) {
        (Some(g), Some(m)) => Some(g - m),
        _ => None,
    }
}

/// `(delta / market) * 100`. None iff `delta` is None or `market` is
/// None or zero — never a division by zero, never a misleading 0%.
pub fn profit_potential_pct(delta: Option<Decimal>, market: Option<Decimal>) -> Option<Decimal> {
    match (delta, market) {
        (Some(d), Some(m)) if !m.is_zero() => Some(d / m * Decimal::from(100)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// StoredCard
// ---------------------------------------------------------------------------

/// A persisted card row. One row per unique
/// `(card_name, set_name, language, rarity)`; `product_id` additionally
/// globally unique when present. Only latest-known prices are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCard {
    pub id: i64,
    pub card_name: String,
    pub set_name: String,
    pub language: Language,
    pub rarity: String,
    pub product_id: Option<String>,
    pub card_number: Option<String>,
    pub market_price: Option<Decimal>,
    pub market_price_fetched_at: Option<DateTime<Utc>>,
    pub graded_price: Option<Decimal>,
    pub graded_price_fetched_at: Option<DateTime<Utc>>,
    pub price_delta: Option<Decimal>,
    pub profit_potential_pct: Option<Decimal>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl fmt::Display for StoredCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) - {} - {}",
            self.card_name, self.set_name, self.rarity, self.language
        )
    }
}

// ---------------------------------------------------------------------------
// RunLog
// ---------------------------------------------------------------------------

/// Lifecycle state of one orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Completed,
    Partial,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::InProgress => write!(f, "in_progress"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Partial => write!(f, "partial"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(RunStatus::InProgress),
            "completed" => Ok(RunStatus::Completed),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One record per orchestration invocation. Created at run start and
/// finalized exactly once via [`RunLog::complete`] or [`RunLog::fail`];
/// both are no-ops on an already-finalized log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub attempted_count: u32,
    pub updated_count: u32,
    pub failed_count: u32,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
}

impl RunLog {
    /// A fresh in-progress log. The id is assigned by storage.
    pub fn started(id: i64, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            started_at,
            completed_at: None,
            status: RunStatus::InProgress,
            attempted_count: 0,
            updated_count: 0,
            failed_count: 0,
            error_message: None,
            duration_ms: None,
        }
    }

    fn is_finalized(&self) -> bool {
        self.status != RunStatus::InProgress
    }

    /// Finalize with statistics. Status becomes `Partial` when any card
    /// failed, `Completed` otherwise.
    pub fn complete(&mut self, attempted: u32, updated: u32, failed: u32) {
        if self.is_finalized() {
            return;
        }
        let now = Utc::now();
        self.completed_at = Some(now);
        self.attempted_count = attempted;
        self.updated_count = updated;
        self.failed_count = failed;
        self.status = if failed > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Completed
        };
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
    }

    /// Finalize as failed with an error message.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.is_finalized() {
            return;
        }
        let now = Utc::now();
        self.completed_at = Some(now);
        self.status = RunStatus::Failed;
        self.error_message = Some(message.into());
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
    }

    /// Fraction of attempted cards that were updated, as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.attempted_count == 0 {
            return 0.0;
        }
        (self.updated_count as f64 / self.attempted_count as f64) * 100.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
