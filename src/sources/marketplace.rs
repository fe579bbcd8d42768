//! Marketplace (TCGplayer-style) listing fetcher.
//!
//! For each rarity variant of the query language, builds a deterministic
//! search URL, fetches the rendered results page under the rate limiter,
//! and extracts structured listings. A page that shows neither results
//! nor the no-results marker is treated as a transient failure and
//! retried with increasing backoff; a rarity whose retries are exhausted
//! is skipped and logged, never fatal to the query.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::ListingSource;
use crate::error::{PipelineError, PipelineResult};
use crate::limiter::{RateLimiter, SourceId};
use crate::types::{CardQuery, RawListing};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const BASE_URL: &str = "https://www.tcgplayer.com/search";
const SOURCE_NAME: &str = "marketplace";

/// Listings above this are treated as scrape noise and discarded.
const MAX_SANE_PRICE: &str = "100000";

/// Backoff before retry attempts 1, 2, 3 (seconds); later retries
/// stay at the last step.
const RETRY_BACKOFF_SECS: [u64; 3] = [1, 3, 5];

/// Sleep duration before retry `attempt` (1-based).
fn backoff_delay(attempt: u32) -> Duration {
    let idx = (attempt as usize)
        .saturating_sub(1)
        .min(RETRY_BACKOFF_SECS.len() - 1);
    Duration::from_secs(RETRY_BACKOFF_SECS[idx])
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Marketplace search client.
pub struct MarketplaceClient {
    http: Client,
    limiter: Arc<RateLimiter>,
    max_retries: u32,
}

impl MarketplaceClient {
    pub fn new(
        limiter: Arc<RateLimiter>,
        request_timeout: Duration,
        max_retries: u32,
    ) -> PipelineResult<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .user_agent(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/120.0 Safari/537.36",
            )
            .build()
            .map_err(|e| PipelineError::RunFatal(format!("marketplace HTTP client: {e}")))?;

        Ok(Self {
            http,
            limiter,
            max_retries,
        })
    }

    // -- URL construction ------------------------------------------------

    /// Deterministic search URL for one (query, rarity) pair.
    ///
    /// Shapes mirror the marketplace's grid search: name and rarity are
    /// `+`-joined, the set name becomes a lowercase `-`-slug path segment
    /// plus a `setName` parameter when present.
    pub fn build_search_url(query: &CardQuery, rarity: &str) -> String {
        let line = query.language.product_line();
        let q = plus_join(&query.name);
        let rarity_param = plus_join(rarity);

        match &query.set_name {
            Some(set) if !set.is_empty() => {
                let slug = set_slug(set);
                format!(
                    "{BASE_URL}/{line}/{slug}?productLineName={line}&q={q}&view=grid&page=1\
                     &ProductTypeName=Cards&Rarity={rarity_param}&setName={slug}"
                )
            }
            _ => {
                format!(
                    "{BASE_URL}/{line}/product?productLineName={line}&q={q}&view=grid&page=1\
                     &ProductTypeName=Cards&Rarity={rarity_param}"
                )
            }
        }
    }

    // -- Fetch -----------------------------------------------------------

    /// Fetch one rarity's result page: one initial attempt plus up to
    /// `max_retries` backoff-separated retries.
    async fn fetch_rarity(&self, query: &CardQuery, rarity: &str) -> PipelineResult<Vec<RawListing>> {
        let url = Self::build_search_url(query, rarity);
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = backoff_delay(attempt);
                debug!(attempt, delay_secs = delay.as_secs(), rarity, "Retrying marketplace fetch");
                tokio::time::sleep(delay).await;
            }

            self.limiter.acquire(SourceId::Marketplace).await;
            debug!(url = %url, rarity, "Fetching marketplace search page");

            let resp = match self.http.get(&url).send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(attempt, rarity, error = %e, "Marketplace request failed");
                    last_error = Some(format!("request error: {e}"));
                    continue;
                }
            };

            if !resp.status().is_success() {
                let status = resp.status();
                warn!(attempt, rarity, status = %status, "Marketplace returned non-success");
                last_error = Some(format!("HTTP {status}"));
                continue;
            }

            let html = match resp.text().await {
                Ok(t) => t,
                Err(e) => {
                    last_error = Some(format!("body read error: {e}"));
                    continue;
                }
            };

            match parse_search_page(&html, query) {
                Ok(listings) => return Ok(listings),
                Err(e) if e.is_transient() => {
                    warn!(attempt, rarity, error = %e, "Marketplace page not ready");
                    last_error = Some(e.to_string());
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(PipelineError::TransientFetch(format!(
            "marketplace rarity '{rarity}' failed after {} attempts: {}",
            self.max_retries + 1,
            last_error.unwrap_or_else(|| "unknown".into()),
        )))
    }
}

#[async_trait]
impl ListingSource for MarketplaceClient {
    /// Fetch listings for every rarity in the query language's
    /// vocabulary, accumulating survivors. A rarity whose retries are
    /// exhausted is logged and skipped.
    async fn fetch_listings(&self, query: &CardQuery) -> PipelineResult<Vec<RawListing>> {
        info!(query = %query, "Marketplace scan starting");

        let mut all = Vec::new();
        for rarity in query.language.rarities() {
            match self.fetch_rarity(query, rarity).await {
                Ok(listings) => {
                    debug!(rarity, count = listings.len(), "Marketplace rarity fetched");
                    all.extend(listings);
                }
                Err(e) => {
                    warn!(rarity, error = %e, "Marketplace rarity skipped");
                }
            }
        }

        info!(query = %query, total = all.len(), "Marketplace scan complete");
        Ok(all)
    }

    fn name(&self) -> &str {
        SOURCE_NAME
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a rendered search page into filtered listings.
///
/// Returns `TransientFetch` when the page shows neither the results
/// markup nor the no-results marker — the equivalent of an element-wait
/// timeout on a half-loaded page, and the caller's signal to retry.
pub fn parse_search_page(html: &str, query: &CardQuery) -> PipelineResult<Vec<RawListing>> {
    let doc = Html::parse_document(html);
    let result_sel = Selector::parse("div.search-result").unwrap();
    let no_results_sel = Selector::parse("div.blank-slate").unwrap();

    let elements: Vec<_> = doc.select(&result_sel).collect();
    if elements.is_empty() {
        if doc.select(&no_results_sel).next().is_some() {
            return Ok(Vec::new());
        }
        return Err(PipelineError::TransientFetch(
            "search page shows neither results nor no-results marker".into(),
        ));
    }

    let selectors = ListingSelectors::new();
    let fetched_at = Utc::now();
    let mut listings = Vec::new();

    for element in elements {
        match listing_from_element(&element, &selectors, fetched_at) {
            Ok(listing) if passes_filters(&listing, query) => listings.push(listing),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Listing element discarded"),
        }
    }

    Ok(listings)
}

/// Selectors for the fields of one result card, compiled once per page.
struct ListingSelectors {
    title: Selector,
    price: Selector,
    set: Selector,
    rarity: Selector,
    link: Selector,
}

impl ListingSelectors {
    fn new() -> Self {
        Self {
            title: Selector::parse("span.product-card__title").unwrap(),
            price: Selector::parse("span.product-card__market-price--value").unwrap(),
            set: Selector::parse("div.product-card__set-name__variant").unwrap(),
            rarity: Selector::parse("div.product-card__rarity__variant span").unwrap(),
            link: Selector::parse("a[href]").unwrap(),
        }
    }
}

/// Extract one listing from a result element. Any missing or malformed
/// field is a `Parse` error; the caller logs it and moves on.
fn listing_from_element(
    element: &ElementRef<'_>,
    sel: &ListingSelectors,
    fetched_at: DateTime<Utc>,
) -> PipelineResult<RawListing> {
    let text_of = |s: &Selector| -> Option<String> {
        element
            .select(s)
            .next()
            .map(|n| n.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty())
    };
    let missing = |field: &str| PipelineError::Parse(format!("listing element missing {field}"));

    let title = text_of(&sel.title).ok_or_else(|| missing("title"))?;
    let price_text = text_of(&sel.price).ok_or_else(|| missing("market price"))?;
    let set_name = text_of(&sel.set).ok_or_else(|| missing("set name"))?;
    let rarity = text_of(&sel.rarity)
        .map(|r| r.replace(',', ""))
        .ok_or_else(|| missing("rarity"))?;
    let href = element
        .select(&sel.link)
        .next()
        .and_then(|a| a.value().attr("href"))
        .map(String::from)
        .ok_or_else(|| missing("detail link"))?;

    let price = parse_price(&price_text)
        .ok_or_else(|| PipelineError::Parse(format!("unparseable price '{price_text}'")))?;
    let product_id = extract_product_id(&href)
        .ok_or_else(|| PipelineError::Parse(format!("no product id in link '{href}'")))?;

    Ok(RawListing {
        card_number: extract_card_number(&title),
        title,
        price,
        set_name,
        rarity,
        product_id,
        fetched_at,
    })
}

/// Sanity and relevance filters over a parsed listing.
fn passes_filters(listing: &RawListing, query: &CardQuery) -> bool {
    let max_price = Decimal::from_str(MAX_SANE_PRICE).unwrap();
    if listing.price <= Decimal::ZERO || listing.price > max_price {
        debug!(price = %listing.price, "Listing price out of sane bounds, discarded");
        return false;
    }

    if !query.language.rarities().contains(&listing.rarity.as_str()) {
        debug!(rarity = %listing.rarity, "Listing rarity outside language vocabulary, discarded");
        return false;
    }

    // Every term of the query name must appear in the title
    let title_lower = listing.title.to_lowercase();
    if !query.name_terms().iter().all(|t| title_lower.contains(t)) {
        debug!(title = %listing.title, "Listing title does not match query terms, discarded");
        return false;
    }

    // A refresh run is pinned to one known product
    if let Some(known) = &query.known_product_id {
        if &listing.product_id != known {
            return false;
        }
    }

    true
}

/// Parse a displayed price like "$1,234.56" into a Decimal.
pub fn parse_price(text: &str) -> Option<Decimal> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    Decimal::from_str(&cleaned).ok()
}

/// Extract the product identifier from a detail-page link.
pub fn extract_product_id(href: &str) -> Option<String> {
    let re = Regex::new(r"/product/(\d+)").unwrap();
    re.captures(href).map(|c| c[1].to_string())
}

/// Recover a card-number pattern (e.g. "151/165") from a listing title.
pub fn extract_card_number(title: &str) -> Option<String> {
    let re = Regex::new(r"\b(\d{1,3}/\d{1,3})\b").unwrap();
    re.captures(title).map(|c| c[1].to_string())
}

fn plus_join(s: &str) -> String {
    s.split_whitespace()
        .map(|t| urlencoding::encode(t).into_owned())
        .collect::<Vec<_>>()
        .join("+")
}

fn set_slug(set: &str) -> String {
    set.to_lowercase().split_whitespace().collect::<Vec<_>>().join("-")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
