//! Run orchestration.
//!
//! Owns the full scrape-and-save flow: create a run log, validate the
//! request, plan the queries, fetch listings concurrently, reconcile,
//! persist, and finalize the log. Every entry point creates its run log
//! before validating so that even a rejected request leaves a failed
//! log behind.
//!
//! Per-query and per-card isolation: one query's fetch failure or one
//! card's upsert failure is counted and logged, never fatal to the rest
//! of the run.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::cache::{cache_key, Cache};
use crate::config::KnownSets;
use crate::engine::reconciler::Reconciler;
use crate::error::{PipelineError, PipelineResult};
use crate::sources::ListingSource;
use crate::storage::CardStore;
use crate::types::{CardQuery, Language, StoredCard};

/// Result of one orchestration run, as returned to API callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub log_id: i64,
    pub message: String,
    pub cards: Vec<StoredCard>,
    pub attempted: u32,
    pub updated: u32,
    pub failed: u32,
}

#[derive(Default)]
struct RunStats {
    attempted: u32,
    updated: u32,
    failed: u32,
    cards: Vec<StoredCard>,
}

#[derive(Clone)]
pub struct Orchestrator {
    listings: Arc<dyn ListingSource>,
    reconciler: Reconciler,
    store: CardStore,
    cache: Arc<Cache>,
    sets: KnownSets,
    fetch_concurrency: usize,
}

impl Orchestrator {
    pub fn new(
        listings: Arc<dyn ListingSource>,
        reconciler: Reconciler,
        store: CardStore,
        cache: Arc<Cache>,
        sets: KnownSets,
        fetch_concurrency: usize,
    ) -> Self {
        Self {
            listings,
            reconciler,
            store,
            cache,
            sets,
            fetch_concurrency: fetch_concurrency.max(1),
        }
    }

    // -- Entry points ----------------------------------------------------

    /// Scrape one search query and persist the results.
    ///
    /// A completed identical run within the cache TTL is served from the
    /// response cache without touching the sources. Partial and failed
    /// runs are never cached.
    pub async fn scrape_and_save(
        &self,
        search_query: &str,
        set_name: Option<String>,
        language: Language,
    ) -> PipelineResult<RunOutcome> {
        let response_key = cache_key(
            "scrape_and_save",
            &[
                search_query,
                set_name.as_deref().unwrap_or(""),
                &language.to_string(),
            ],
        );
        if let Some(cached) = self.cache.get_json::<RunOutcome>(&response_key).await {
            info!(search_query, "Run served from response cache");
            return Ok(cached);
        }

        let log = self.store.create_run().await?;

        if search_query.trim().is_empty() {
            return self
                .reject(log.id, "searchQuery must not be empty".to_string())
                .await;
        }
        if let Some(set) = &set_name {
            if !self.sets.contains(set) {
                return self.reject(log.id, format!("unknown set: {set}")).await;
            }
        }

        let query = CardQuery::new(search_query, set_name, language);
        let stats = self.run_queries(vec![query]).await;
        let outcome = self.finalize(log.id, stats).await?;

        if outcome.failed == 0 && !outcome.cards.is_empty() {
            self.cache.put_json(&response_key, &outcome).await;
        }
        Ok(outcome)
    }

    /// Re-fetch prices for one stored card, pinned to its product id.
    /// Always hits the sources — a refresh exists to bypass staleness.
    pub async fn refresh_card(&self, card_id: i64) -> PipelineResult<RunOutcome> {
        let log = self.store.create_run().await?;

        let Some(card) = self.store.get_card(card_id).await? else {
            self.store
                .fail_run(log.id, &format!("card {card_id} not found"))
                .await?;
            return Err(PipelineError::NotFound(format!("card {card_id}")));
        };

        // A refresh is pinned to one marketplace product; without an id
        // there is nothing unambiguous to re-fetch.
        let Some(product_id) = card.product_id.clone() else {
            return self
                .reject(log.id, format!("card {card_id} has no product id"))
                .await;
        };

        let mut query = CardQuery::new(
            card.card_name.clone(),
            Some(card.set_name.clone()),
            card.language,
        );
        query.known_product_id = Some(product_id);

        let stats = self.run_queries(vec![query]).await;
        self.finalize(log.id, stats).await
    }

    /// Kick off a bulk scrape over every configured set in both
    /// languages. Returns the run log id immediately; the run proceeds
    /// in a background task and the log records its outcome.
    pub async fn start_scrape_all_sets(&self) -> PipelineResult<i64> {
        let log = self.store.create_run().await?;

        let mut queries = Vec::new();
        for language in Language::both() {
            for set in self.sets.for_language(language) {
                queries.push(CardQuery::for_set(set.clone(), language));
            }
        }
        info!(log_id = log.id, query_count = queries.len(), "Bulk scrape started");

        let this = self.clone();
        let log_id = log.id;
        tokio::spawn(async move {
            let stats = this.run_queries(queries).await;
            match this.finalize(log_id, stats).await {
                Ok(_) => {}
                Err(PipelineError::NotFound(_)) => {
                    warn!(log_id, "Bulk scrape stored no cards");
                }
                Err(e) => {
                    error!(log_id, error = %e, "Bulk scrape failed to finalize");
                }
            }
        });

        Ok(log_id)
    }

    // -- Run internals ---------------------------------------------------

    /// Fail the run log with a validation message and surface the error.
    async fn reject(&self, log_id: i64, message: String) -> PipelineResult<RunOutcome> {
        self.store.fail_run(log_id, &message).await?;
        Err(PipelineError::Validation(message))
    }

    /// Fetch, reconcile and persist every query. Queries run
    /// concurrently up to the configured cap; failures are isolated.
    async fn run_queries(&self, queries: Vec<CardQuery>) -> RunStats {
        let fetched: Vec<_> = stream::iter(queries)
            .map(|query| async move {
                let result = self.listings.fetch_listings(&query).await;
                (query, result)
            })
            .buffer_unordered(self.fetch_concurrency)
            .collect()
            .await;

        let mut stats = RunStats::default();
        for (query, result) in fetched {
            let listings = match result {
                Ok(listings) => listings,
                Err(e) => {
                    warn!(query = %query, error = %e, "Query fetch failed, skipping");
                    stats.attempted += 1;
                    stats.failed += 1;
                    continue;
                }
            };

            let cards = self.reconciler.reconcile(query.language, listings).await;
            for card in cards {
                stats.attempted += 1;
                match self.store.upsert(&card).await {
                    Ok(stored) => {
                        stats.updated += 1;
                        stats.cards.push(stored);
                    }
                    Err(e) => {
                        warn!(card = %card.card_name, error = %e, "Card upsert failed");
                        stats.failed += 1;
                    }
                }
            }
        }
        stats
    }

    /// Finalize the run log and convert the stats into an outcome. A
    /// run that stored nothing at all is a failure, not an empty success.
    async fn finalize(&self, log_id: i64, stats: RunStats) -> PipelineResult<RunOutcome> {
        if stats.cards.is_empty() && stats.failed == 0 {
            let message = "no cards matched the query";
            self.store.fail_run(log_id, message).await?;
            return Err(PipelineError::NotFound(message.to_string()));
        }

        self.store
            .complete_run(log_id, stats.attempted, stats.updated, stats.failed)
            .await?;
        info!(
            log_id,
            attempted = stats.attempted,
            updated = stats.updated,
            failed = stats.failed,
            "Run finalized"
        );

        Ok(RunOutcome {
            log_id,
            message: format!(
                "{} cards updated, {} failed",
                stats.updated, stats.failed
            ),
            cards: stats.cards,
            attempted: stats.attempted,
            updated: stats.updated,
            failed: stats.failed,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
