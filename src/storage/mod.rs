//! Persistence layer.
//!
//! SQLite via sqlx. Two tables: `cards` (latest-known prices, one row
//! per unique card tuple) and `run_logs` (one row per orchestration
//! run). The card upsert is a single `INSERT ... ON CONFLICT ... DO
//! UPDATE ... RETURNING` statement, so concurrent upserts to the same
//! key serialize on the store's row locking and never interleave
//! partial writes.
//!
//! Prices are stored as TEXT: sqlx's SQLite driver has no Decimal
//! mapping and text round-trips the decimal values exactly.

use chrono::{Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

use crate::types::{Language, ReconciledCard, RunLog, StoredCard};

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle over the SQLite pool. Cheap to clone.
#[derive(Clone)]
pub struct CardStore {
    pool: SqlitePool,
}

/// Filter for paginated card reads. All fields optional and ANDed.
#[derive(Debug, Default, Clone)]
pub struct CardFilter {
    /// Case-insensitive substring match on the card name.
    pub card_name: Option<String>,
    /// Exact set-name match.
    pub set_name: Option<String>,
    pub language: Option<Language>,
    pub market_price_min: Option<Decimal>,
    pub market_price_max: Option<Decimal>,
    pub graded_price_min: Option<Decimal>,
    pub graded_price_max: Option<Decimal>,
}

/// One page of stored cards plus list-level metadata.
#[derive(Debug, Clone)]
pub struct CardPage {
    pub cards: Vec<StoredCard>,
    pub total: i64,
    /// True when any stored row was updated within the last 24 hours.
    pub is_fresh: bool,
}

impl CardStore {
    /// Open (and create if missing) the database at `url`.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        info!(url, "Card store connected");
        Ok(Self { pool })
    }

    /// In-memory store for tests. A single pinned connection keeps the
    /// database alive for the store's lifetime.
    pub async fn connect_in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and indexes if they don't exist.
    pub async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cards (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                card_name TEXT NOT NULL,
                set_name TEXT NOT NULL,
                language TEXT NOT NULL,
                rarity TEXT NOT NULL,
                product_id TEXT UNIQUE,
                card_number TEXT,
                market_price TEXT,
                market_price_fetched_at TEXT,
                graded_price TEXT,
                graded_price_fetched_at TEXT,
                price_delta TEXT,
                profit_potential_pct TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                UNIQUE(card_name, set_name, language, rarity)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cards_lookup
             ON cards(card_name, set_name, language)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cards_last_updated ON cards(last_updated)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                status TEXT NOT NULL DEFAULT 'in_progress',
                attempted_count INTEGER NOT NULL DEFAULT 0,
                updated_count INTEGER NOT NULL DEFAULT 0,
                failed_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                duration_ms INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_run_logs_status ON run_logs(status, started_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // -- Cards -----------------------------------------------------------

    /// Atomic create-or-update keyed by (card_name, set_name, language,
    /// rarity). All price fields and timestamps are overwritten with
    /// the new record's values; `created_at` is preserved on update.
    pub async fn upsert(&self, record: &ReconciledCard) -> Result<StoredCard, sqlx::Error> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO cards (
                card_name, set_name, language, rarity, product_id, card_number,
                market_price, market_price_fetched_at,
                graded_price, graded_price_fetched_at,
                price_delta, profit_potential_pct,
                is_active, created_at, last_updated
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT(card_name, set_name, language, rarity) DO UPDATE SET
                product_id = excluded.product_id,
                card_number = excluded.card_number,
                market_price = excluded.market_price,
                market_price_fetched_at = excluded.market_price_fetched_at,
                graded_price = excluded.graded_price,
                graded_price_fetched_at = excluded.graded_price_fetched_at,
                price_delta = excluded.price_delta,
                profit_potential_pct = excluded.profit_potential_pct,
                is_active = excluded.is_active,
                last_updated = excluded.last_updated
            RETURNING *
            "#,
        )
        .bind(&record.card_name)
        .bind(&record.set_name)
        .bind(record.language.to_string())
        .bind(&record.rarity)
        .bind(&record.product_id)
        .bind(&record.card_number)
        .bind(record.market_price.map(|d| d.to_string()))
        .bind(record.market_price_fetched_at)
        .bind(record.graded_price.map(|d| d.to_string()))
        .bind(record.graded_price_fetched_at)
        .bind(record.price_delta.map(|d| d.to_string()))
        .bind(record.profit_potential_pct.map(|d| d.to_string()))
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let card = card_from_row(&row)?;
        debug!(card = %card, id = card.id, "Card upserted");
        Ok(card)
    }

    pub async fn get_card(&self, id: i64) -> Result<Option<StoredCard>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM cards WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(card_from_row).transpose()
    }

    /// Filtered, paginated read. `page` is 1-based.
    pub async fn list_cards(
        &self,
        filter: &CardFilter,
        page: u32,
        page_size: u32,
    ) -> Result<CardPage, sqlx::Error> {
        let mut count_qb = sqlx::QueryBuilder::new("SELECT COUNT(*) FROM cards WHERE 1=1");
        push_filter(&mut count_qb, filter);
        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = sqlx::QueryBuilder::new("SELECT * FROM cards WHERE 1=1");
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY card_name ASC LIMIT ");
        qb.push_bind(page_size as i64);
        qb.push(" OFFSET ");
        qb.push_bind((page.max(1) as i64 - 1) * page_size as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let cards = rows
            .iter()
            .map(card_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let cutoff = Utc::now() - Duration::hours(24);
        let is_fresh: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM cards WHERE last_updated >= ?)")
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await?;

        Ok(CardPage {
            cards,
            total,
            is_fresh,
        })
    }

    // -- Run logs --------------------------------------------------------

    /// Create a fresh in-progress run log and return it.
    pub async fn create_run(&self) -> Result<RunLog, sqlx::Error> {
        let started_at = Utc::now();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO run_logs (started_at, status) VALUES (?, 'in_progress') RETURNING id",
        )
        .bind(started_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(RunLog::started(id, started_at))
    }

    pub async fn get_run(&self, id: i64) -> Result<Option<RunLog>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM run_logs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    /// Finalize a run with statistics. No-op on already-finalized logs.
    pub async fn complete_run(
        &self,
        id: i64,
        attempted: u32,
        updated: u32,
        failed: u32,
    ) -> Result<Option<RunLog>, sqlx::Error> {
        let Some(mut log) = self.get_run(id).await? else {
            return Ok(None);
        };
        log.complete(attempted, updated, failed);
        self.write_finalized(&log).await?;
        self.get_run(id).await
    }

    /// Finalize a run as failed. No-op on already-finalized logs.
    pub async fn fail_run(&self, id: i64, message: &str) -> Result<Option<RunLog>, sqlx::Error> {
        let Some(mut log) = self.get_run(id).await? else {
            return Ok(None);
        };
        log.fail(message);
        self.write_finalized(&log).await?;
        self.get_run(id).await
    }

    /// Persist a finalized log. The status guard makes finalization
    /// terminal even under racing finalizers.
    async fn write_finalized(&self, log: &RunLog) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE run_logs SET
                completed_at = ?,
                status = ?,
                attempted_count = ?,
                updated_count = ?,
                failed_count = ?,
                error_message = ?,
                duration_ms = ?
            WHERE id = ? AND status = 'in_progress'
            "#,
        )
        .bind(log.completed_at)
        .bind(log.status.to_string())
        .bind(log.attempted_count)
        .bind(log.updated_count)
        .bind(log.failed_count)
        .bind(&log.error_message)
        .bind(log.duration_ms)
        .bind(log.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn push_filter(qb: &mut sqlx::QueryBuilder<'_, sqlx::Sqlite>, filter: &CardFilter) {
    if let Some(name) = &filter.card_name {
        qb.push(" AND card_name LIKE ");
        qb.push_bind(format!("%{name}%"));
    }
    if let Some(set) = &filter.set_name {
        qb.push(" AND set_name = ");
        qb.push_bind(set.clone());
    }
    if let Some(lang) = filter.language {
        qb.push(" AND language = ");
        qb.push_bind(lang.to_string());
    }
    // Price columns are TEXT; compare numerically
    if let Some(min) = filter.market_price_min {
        qb.push(" AND CAST(market_price AS REAL) >= ");
        qb.push_bind(min.to_f64().unwrap_or(0.0));
    }
    if let Some(max) = filter.market_price_max {
        qb.push(" AND CAST(market_price AS REAL) <= ");
        qb.push_bind(max.to_f64().unwrap_or(f64::MAX));
    }
    if let Some(min) = filter.graded_price_min {
        qb.push(" AND CAST(graded_price AS REAL) >= ");
        qb.push_bind(min.to_f64().unwrap_or(0.0));
    }
    if let Some(max) = filter.graded_price_max {
        qb.push(" AND CAST(graded_price AS REAL) <= ");
        qb.push_bind(max.to_f64().unwrap_or(f64::MAX));
    }
}

fn decode_err(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

fn opt_decimal(row: &SqliteRow, col: &str) -> Result<Option<Decimal>, sqlx::Error> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|s| {
        Decimal::from_str(&s).map_err(|e| decode_err(format!("column {col}: {e}")))
    })
    .transpose()
}

fn card_from_row(row: &SqliteRow) -> Result<StoredCard, sqlx::Error> {
    let language: String = row.try_get("language")?;
    Ok(StoredCard {
        id: row.try_get("id")?,
        card_name: row.try_get("card_name")?,
        set_name: row.try_get("set_name")?,
        language: language.parse().map_err(decode_err)?,
        rarity: row.try_get("rarity")?,
        product_id: row.try_get("product_id")?,
        card_number: row.try_get("card_number")?,
        market_price: opt_decimal(row, "market_price")?,
        market_price_fetched_at: row.try_get("market_price_fetched_at")?,
        graded_price: opt_decimal(row, "graded_price")?,
        graded_price_fetched_at: row.try_get("graded_price_fetched_at")?,
        price_delta: opt_decimal(row, "price_delta")?,
        profit_potential_pct: opt_decimal(row, "profit_potential_pct")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        last_updated: row.try_get("last_updated")?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<RunLog, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(RunLog {
        id: row.try_get("id")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        status: status.parse().map_err(decode_err)?,
        attempted_count: row.try_get("attempted_count")?,
        updated_count: row.try_get("updated_count")?,
        failed_count: row.try_get("failed_count")?,
        error_message: row.try_get("error_message")?,
        duration_ms: row.try_get("duration_ms")?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
