//! Auction (eBay-style) sold-listing fetcher.
//!
//! Searches completed/sold listings for "<name> <set> PSA 10" and
//! reduces the surviving sale prices to a robust central estimate
//! (mean for tiny samples, IQR-filtered mean otherwise). Any network or
//! parse trouble yields an absent estimate, logged but never raised —
//! a card with no graded sales history is an ordinary outcome.

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use scraper::{Html, Selector};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::SoldPriceSource;
use crate::error::{PipelineError, PipelineResult};
use crate::limiter::{RateLimiter, SourceId};
use crate::types::{AuctionPriceEstimate, Language};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const BASE_URL: &str = "https://www.ebay.com/sch/i.html";
const SOURCE_NAME: &str = "auction";

/// Grading-quality token that must appear in a counted listing title.
const GRADE_TOKEN: &str = "psa 10";

/// Rarity keywords recognised inside a query name, longest first so
/// "special art rare" wins over "art rare".
const RARITY_KEYWORDS: [&str; 7] = [
    "special illustration rare",
    "special art rare",
    "illustration rare",
    "hyper rare",
    "ultra rare",
    "super rare",
    "art rare",
];

// ---------------------------------------------------------------------------
// Title filtering
// ---------------------------------------------------------------------------

/// Disambiguating terms extracted from one query, applied to every sold
/// listing's title before its price is counted.
#[derive(Debug, Clone, PartialEq)]
pub struct TitleFilter {
    /// First token of the card name, lowercased.
    base_token: String,
    /// Card-number pattern (e.g. "151/165") if the query name carries one.
    card_number: Option<String>,
    /// Rarity keywords present in the query name, if any.
    rarity_keywords: Vec<String>,
}

impl TitleFilter {
    pub fn from_card_name(card_name: &str) -> Self {
        let lower = card_name.to_lowercase();
        let number_re = Regex::new(r"\b(\d{1,3}/\d{1,3})\b").unwrap();
        Self {
            base_token: lower.split_whitespace().next().unwrap_or("").to_string(),
            card_number: number_re.captures(&lower).map(|c| c[1].to_string()),
            rarity_keywords: RARITY_KEYWORDS
                .iter()
                .filter(|k| lower.contains(*k))
                .map(|k| k.to_string())
                .collect(),
        }
    }

    /// Whether a sold listing's title plausibly refers to the queried
    /// card: base name token, the grading token, the card number when
    /// the query had one, and at least one rarity keyword when the
    /// query had any.
    pub fn matches(&self, title: &str) -> bool {
        let lower = title.to_lowercase();

        if !self.base_token.is_empty() && !lower.contains(&self.base_token) {
            return false;
        }
        if !lower.contains(GRADE_TOKEN) {
            return false;
        }
        if let Some(number) = &self.card_number {
            if !lower.contains(number) {
                return false;
            }
        }
        if !self.rarity_keywords.is_empty()
            && !self.rarity_keywords.iter().any(|k| lower.contains(k))
        {
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Robust estimate
// ---------------------------------------------------------------------------

/// Central price estimate over sold prices.
///
/// 0 prices → None; 1–2 → plain mean; 3+ → IQR outlier filter
/// (Q1 at `len/4`, Q3 at `3·len/4`, bounds Q1−1.5·IQR to Q3+1.5·IQR)
/// then the mean of the in-bounds subset. If the filter empties the
/// sample it falls back to the mean of everything — the filter must
/// never silently reduce the sample to nothing.
pub fn robust_estimate(prices: &[Decimal]) -> Option<(Decimal, usize)> {
    match prices.len() {
        0 => None,
        1 | 2 => Some((mean(prices), prices.len())),
        len => {
            let mut sorted = prices.to_vec();
            sorted.sort();
            let q1 = sorted[len / 4];
            let q3 = sorted[3 * len / 4];
            let iqr = q3 - q1;
            let lower = q1 - dec!(1.5) * iqr;
            let upper = q3 + dec!(1.5) * iqr;

            let kept: Vec<Decimal> = sorted
                .iter()
                .copied()
                .filter(|p| *p >= lower && *p <= upper)
                .collect();

            if kept.is_empty() {
                Some((mean(&sorted), sorted.len()))
            } else {
                Some((mean(&kept), kept.len()))
            }
        }
    }
}

fn mean(prices: &[Decimal]) -> Decimal {
    let sum: Decimal = prices.iter().copied().sum();
    sum / Decimal::from(prices.len() as u64)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Sold-listing search client.
pub struct AuctionClient {
    http: Client,
    limiter: Arc<RateLimiter>,
}

impl AuctionClient {
    pub fn new(limiter: Arc<RateLimiter>, request_timeout: Duration) -> PipelineResult<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .user_agent(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/120.0 Safari/537.36",
            )
            .build()
            .map_err(|e| PipelineError::RunFatal(format!("auction HTTP client: {e}")))?;

        Ok(Self { http, limiter })
    }

    /// Search URL for completed/sold listings of one card.
    pub fn build_search_url(card_name: &str, set_name: &str, language: Language) -> String {
        let mut term = format!("{card_name} {set_name} PSA 10");
        if language == Language::Japanese {
            term.push_str(" Japanese");
        }
        format!(
            "{BASE_URL}?_nkw={}&_sacat=0&_from=R40&rt=nc&LH_Sold=1&LH_Complete=1",
            urlencoding::encode(term.trim()),
        )
    }

    async fn fetch_sold_prices(
        &self,
        card_name: &str,
        set_name: &str,
        language: Language,
    ) -> PipelineResult<Vec<Decimal>> {
        let url = Self::build_search_url(card_name, set_name, language);

        self.limiter.acquire(SourceId::Auction).await;
        debug!(url = %url, "Fetching sold auction listings");

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| PipelineError::TransientFetch(format!("auction request: {e}")))?;

        if !resp.status().is_success() {
            return Err(PipelineError::TransientFetch(format!(
                "auction search returned HTTP {}",
                resp.status(),
            )));
        }

        let html = resp
            .text()
            .await
            .map_err(|e| PipelineError::TransientFetch(format!("auction body read: {e}")))?;

        let filter = TitleFilter::from_card_name(card_name);
        Ok(parse_sold_prices(&html, &filter))
    }
}

#[async_trait]
impl SoldPriceSource for AuctionClient {
    async fn graded_price_estimate(
        &self,
        card_name: &str,
        set_name: &str,
        language: Language,
    ) -> Option<AuctionPriceEstimate> {
        let prices = match self.fetch_sold_prices(card_name, set_name, language).await {
            Ok(p) => p,
            Err(e) => {
                warn!(card_name, set_name, error = %e, "Auction fetch failed, estimate absent");
                return None;
            }
        };

        let (value, sample_size) = robust_estimate(&prices)?;
        debug!(card_name, %value, sample_size, "Auction estimate computed");
        Some(AuctionPriceEstimate {
            value,
            sample_size,
            fetched_at: Utc::now(),
        })
    }

    fn name(&self) -> &str {
        SOURCE_NAME
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Extract title-filtered sale prices from a sold-listings page.
pub fn parse_sold_prices(html: &str, filter: &TitleFilter) -> Vec<Decimal> {
    let doc = Html::parse_document(html);
    let item_sel = Selector::parse("li.s-item").unwrap();
    let title_sel = Selector::parse(".s-item__title").unwrap();
    let price_sel = Selector::parse("span.s-item__price").unwrap();
    let price_re = Regex::new(r"\$([\d,]+(?:\.\d+)?)").unwrap();

    let mut prices = Vec::new();
    for item in doc.select(&item_sel) {
        let title = item
            .select(&title_sel)
            .next()
            .map(|n| n.text().collect::<String>())
            .unwrap_or_default();

        if !filter.matches(&title) {
            continue;
        }

        let Some(price_text) = item
            .select(&price_sel)
            .next()
            .map(|n| n.text().collect::<String>())
        else {
            continue;
        };

        if let Some(caps) = price_re.captures(&price_text) {
            if let Ok(price) = Decimal::from_str(&caps[1].replace(',', "")) {
                if price > Decimal::ZERO {
                    prices.push(price);
                }
            }
        }
    }
    prices
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sold_item(title: &str, price: &str) -> String {
        format!(
            r#"<li class="s-item s-item__pl-on-bottom">
                 <div class="s-item__title">{title}</div>
                 <span class="s-item__price">{price}</span>
               </li>"#
        )
    }

    fn page(items: &[String]) -> String {
        format!("<html><body><ul>{}</ul></body></html>", items.join(""))
    }

    // -- Robust estimate laws --

    #[test]
    fn test_estimate_empty_is_absent() {
        assert_eq!(robust_estimate(&[]), None);
    }

    #[test]
    fn test_estimate_two_samples_is_mean() {
        let (value, n) = robust_estimate(&[dec!(5), dec!(7)]).unwrap();
        assert_eq!(value, dec!(6.0));
        assert_eq!(n, 2);
    }

    #[test]
    fn test_estimate_single_sample() {
        let (value, n) = robust_estimate(&[dec!(42)]).unwrap();
        assert_eq!(value, dec!(42));
        assert_eq!(n, 1);
    }

    #[test]
    fn test_iqr_filter_excludes_outlier() {
        let prices = [dec!(10), dec!(10), dec!(10), dec!(10), dec!(1000)];
        let (value, n) = robust_estimate(&prices).unwrap();
        assert_eq!(value, dec!(10.0));
        assert_eq!(n, 4);
    }

    #[test]
    fn test_iqr_filter_order_independent() {
        let prices = [dec!(1000), dec!(10), dec!(10), dec!(10), dec!(10)];
        let (value, _) = robust_estimate(&prices).unwrap();
        assert_eq!(value, dec!(10.0));
    }

    #[test]
    fn test_uniform_sample_passes_filter_whole() {
        let prices = [dec!(20), dec!(20), dec!(20), dec!(20)];
        let (value, n) = robust_estimate(&prices).unwrap();
        assert_eq!(value, dec!(20));
        assert_eq!(n, 4);
    }

    // -- Title filter --

    #[test]
    fn test_filter_requires_base_token_and_grade() {
        let f = TitleFilter::from_card_name("Mew ex");
        assert!(f.matches("Mew ex 151/165 PSA 10 Gem Mint"));
        assert!(!f.matches("Pikachu PSA 10"));
        assert!(!f.matches("Mew ex raw near mint"));
    }

    #[test]
    fn test_filter_card_number_from_query() {
        let f = TitleFilter::from_card_name("Mew ex 151/165");
        assert_eq!(f.card_number.as_deref(), Some("151/165"));
        assert!(f.matches("PSA 10 Mew ex 151/165 Japanese"));
        assert!(!f.matches("PSA 10 Mew ex 205/165 Japanese"));
    }

    #[test]
    fn test_filter_rarity_keywords_from_query() {
        let f = TitleFilter::from_card_name("Mew ex Ultra Rare");
        assert_eq!(f.rarity_keywords, vec!["ultra rare".to_string()]);
        assert!(f.matches("Mew ex Ultra Rare PSA 10"));
        assert!(!f.matches("Mew ex PSA 10")); // query demanded a rarity word
    }

    #[test]
    fn test_filter_longest_rarity_keyword_wins() {
        let f = TitleFilter::from_card_name("Lillie Special Art Rare");
        assert!(f.rarity_keywords.contains(&"special art rare".to_string()));
    }

    #[test]
    fn test_filter_without_extras_only_needs_name_and_grade() {
        let f = TitleFilter::from_card_name("Charizard");
        assert!(f.matches("charizard psa 10 2023"));
    }

    // -- URL --

    #[test]
    fn test_search_url_japanese_suffix() {
        let url = AuctionClient::build_search_url("Mew ex", "Pokemon Card 151", Language::Japanese);
        assert!(url.contains("LH_Sold=1"));
        assert!(url.contains("LH_Complete=1"));
        assert!(url.contains(&urlencoding::encode("Mew ex Pokemon Card 151 PSA 10 Japanese").into_owned()));
    }

    #[test]
    fn test_search_url_english_no_suffix() {
        let url =
            AuctionClient::build_search_url("Charizard ex", "Obsidian Flames", Language::English);
        assert!(!url.contains("Japanese"));
    }

    // -- Page parsing --

    #[test]
    fn test_parse_sold_prices_filters_titles() {
        let html = page(&[
            sold_item("Mew ex 151/165 PSA 10", "$80.00"),
            sold_item("Mew ex raw ungraded", "$30.00"),
            sold_item("Pikachu PSA 10", "$55.00"),
        ]);
        let filter = TitleFilter::from_card_name("Mew ex");
        let prices = parse_sold_prices(&html, &filter);
        assert_eq!(prices, vec![dec!(80.00)]);
    }

    #[test]
    fn test_parse_sold_prices_handles_thousands() {
        let html = page(&[sold_item("Charizard PSA 10", "$1,250.00")]);
        let filter = TitleFilter::from_card_name("Charizard");
        let prices = parse_sold_prices(&html, &filter);
        assert_eq!(prices, vec![dec!(1250.00)]);
    }

    #[test]
    fn test_parse_sold_prices_missing_price_skipped() {
        let html = page(&[
            r#"<li class="s-item"><div class="s-item__title">Mew PSA 10</div></li>"#.to_string(),
        ]);
        let filter = TitleFilter::from_card_name("Mew");
        assert!(parse_sold_prices(&html, &filter).is_empty());
    }

    #[test]
    fn test_parse_empty_page() {
        let filter = TitleFilter::from_card_name("Mew");
        assert!(parse_sold_prices("<html></html>", &filter).is_empty());
    }
}
