use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub mod migrations;

use crate::config::DatabaseConfig;
use crate::core::reconcile::ProductDelta;
use crate::error::{ScrapeError, ScrapeResult};

/// Canonical product entity, one per key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub key: String,
    pub name: String,
    pub price: f64,
    pub discount_percent: Option<f64>,
    pub available: bool,
    pub image_url: Option<String>,
    pub product_url: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_scraped_at: DateTime<Utc>,
}

/// Immutable snapshot of a product's mutable fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub product_key: String,
    pub run_id: String,
    pub name: String,
    pub price: f64,
    pub discount_percent: Option<f64>,
    pub available: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Run status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Partial,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Partial => write!(f, "partial"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = ScrapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(ScrapeError::storage(format!("Invalid run status: {}", s))),
        }
    }
}

/// Counters accumulated over one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    /// Pages rendered successfully
    pub pages_visited: u32,
    /// Pages skipped after retries were exhausted or the markup was unusable
    pub pages_failed: u32,
    pub candidates_seen: u64,
    pub records_accepted: u64,
    pub records_rejected: u64,
    pub records_created: u64,
    pub records_updated: u64,
}

/// One orchestrator invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub target_url: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub error_summary: Option<String>,
}

impl RunRecord {
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}

/// Whether an upsert created a new product or updated an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Persistence collaborator for products, history and runs
#[async_trait]
pub trait ProductStore: Send + Sync {
    /// Create a run record with status `running`
    async fn create_run(&self, target_url: &str) -> ScrapeResult<RunRecord>;

    /// Insert or update the product keyed by `delta.key`
    async fn upsert_product(&self, delta: &ProductDelta, observed_at: DateTime<Utc>) -> ScrapeResult<UpsertOutcome>;

    /// Append one history snapshot tagged with `run_id`
    async fn append_history(&self, run_id: &str, delta: &ProductDelta, observed_at: DateTime<Utc>) -> ScrapeResult<()>;

    /// Upsert plus history append as one logical unit
    async fn persist_observation(
        &self,
        run_id: &str,
        delta: &ProductDelta,
        observed_at: DateTime<Utc>,
    ) -> ScrapeResult<UpsertOutcome> {
        let outcome = self.upsert_product(delta, observed_at).await?;
        self.append_history(run_id, delta, observed_at).await?;
        Ok(outcome)
    }

    /// Write the final state of a run. Fails if the run is not `running`.
    async fn finalize_run(&self, run: &RunRecord) -> ScrapeResult<()>;
}

/// SQLite-backed product store
pub struct SqliteStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file and run migrations
    pub async fn open(config: &DatabaseConfig) -> ScrapeResult<Self> {
        info!("Opening product store: {}", config.path.display());

        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ScrapeError::storage(format!("cannot create {}: {}", parent.display(), e)))?;
            }
        }

        let connection = Connection::open(&config.path)?;
        if config.enable_wal {
            connection.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        }
        Self::from_connection(connection)
    }

    /// Private in-memory database
    pub fn in_memory() -> ScrapeResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(connection: Connection) -> ScrapeResult<Self> {
        connection.execute("PRAGMA foreign_keys = ON", [])?;
        migrations::run_migrations(&connection)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Get product by key
    pub async fn get_product(&self, key: &str) -> ScrapeResult<Option<ProductRecord>> {
        let conn = self.connection.lock().await;

        let product = conn
            .query_row(
                "SELECT key, name, price, discount_percent, available, image_url, product_url,
                        first_seen_at, last_seen_at, last_scraped_at
                 FROM products WHERE key = ?1",
                params![key],
                product_from_row,
            )
            .optional()?;

        Ok(product)
    }

    pub async fn count_products(&self) -> ScrapeResult<usize> {
        let conn = self.connection.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// History of one product, oldest first
    pub async fn history_for(&self, key: &str) -> ScrapeResult<Vec<HistoryEntry>> {
        let conn = self.connection.lock().await;

        let mut stmt = conn.prepare(
            "SELECT id, product_key, run_id, name, price, discount_percent, available, recorded_at
             FROM product_history WHERE product_key = ?1 ORDER BY id",
        )?;

        let entries = stmt
            .query_map(params![key], history_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Number of history rows written by one run
    pub async fn history_count_for_run(&self, run_id: &str) -> ScrapeResult<usize> {
        let conn = self.connection.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM product_history WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Get run by ID
    pub async fn get_run(&self, run_id: &str) -> ScrapeResult<Option<RunRecord>> {
        let conn = self.connection.lock().await;

        let run = conn
            .query_row(
                &format!("{} WHERE run_id = ?1", RUN_COLUMNS),
                params![run_id],
                run_from_row,
            )
            .optional()?;

        Ok(run)
    }

    /// List recent runs, newest first
    pub async fn list_runs(&self, limit: usize) -> ScrapeResult<Vec<RunRecord>> {
        let conn = self.connection.lock().await;

        let mut stmt = conn.prepare(&format!("{} ORDER BY started_at DESC LIMIT ?1", RUN_COLUMNS))?;
        let runs = stmt
            .query_map(params![limit as i64], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(runs)
    }

    /// Mark runs of `target_url` left in `running` by a process that died as failed.
    ///
    /// Only runs started more than `stale_after` ago are touched, so a run that
    /// is still in progress elsewhere keeps its record.
    pub async fn fail_orphaned_runs(&self, target_url: &str, stale_after: chrono::Duration) -> ScrapeResult<usize> {
        let now = Utc::now();
        let cutoff = now - stale_after;
        let conn = self.connection.lock().await;

        let updated = conn.execute(
            "UPDATE scraper_runs
             SET status = ?1, finished_at = ?2,
                 error_summary = COALESCE(error_summary, 'run was not finalized')
             WHERE status = ?3 AND target_url = ?4 AND started_at < ?5",
            params![
                RunStatus::Failed.to_string(),
                now,
                RunStatus::Running.to_string(),
                target_url,
                cutoff
            ],
        )?;

        if updated > 0 {
            warn!("Marked {} orphaned runs of {} as failed", updated, target_url);
        }
        Ok(updated)
    }
}

const RUN_COLUMNS: &str = "SELECT run_id, target_url, started_at, finished_at, status,
        pages_visited, pages_failed, candidates_seen, records_accepted, records_rejected,
        records_created, records_updated, error_summary
     FROM scraper_runs";

fn product_from_row(row: &Row<'_>) -> rusqlite::Result<ProductRecord> {
    Ok(ProductRecord {
        key: row.get(0)?,
        name: row.get(1)?,
        price: row.get(2)?,
        discount_percent: row.get(3)?,
        available: row.get(4)?,
        image_url: row.get(5)?,
        product_url: row.get(6)?,
        first_seen_at: row.get(7)?,
        last_seen_at: row.get(8)?,
        last_scraped_at: row.get(9)?,
    })
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    Ok(HistoryEntry {
        id: row.get(0)?,
        product_key: row.get(1)?,
        run_id: row.get(2)?,
        name: row.get(3)?,
        price: row.get(4)?,
        discount_percent: row.get(5)?,
        available: row.get(6)?,
        recorded_at: row.get(7)?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        run_id: row.get(0)?,
        target_url: row.get(1)?,
        started_at: row.get(2)?,
        finished_at: row.get(3)?,
        status: row
            .get::<_, String>(4)?
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e)))?,
        counters: RunCounters {
            pages_visited: row.get::<_, i64>(5)? as u32,
            pages_failed: row.get::<_, i64>(6)? as u32,
            candidates_seen: row.get::<_, i64>(7)? as u64,
            records_accepted: row.get::<_, i64>(8)? as u64,
            records_rejected: row.get::<_, i64>(9)? as u64,
            records_created: row.get::<_, i64>(10)? as u64,
            records_updated: row.get::<_, i64>(11)? as u64,
        },
        error_summary: row.get(12)?,
    })
}

fn upsert_in(conn: &Connection, delta: &ProductDelta, observed_at: DateTime<Utc>) -> ScrapeResult<UpsertOutcome> {
    let exists = conn
        .query_row("SELECT 1 FROM products WHERE key = ?1", params![delta.key], |_| Ok(()))
        .optional()?
        .is_some();

    conn.execute(
        "INSERT INTO products (key, name, price, discount_percent, available, image_url, product_url,
                               first_seen_at, last_seen_at, last_scraped_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?8)
         ON CONFLICT(key) DO UPDATE SET
            name = excluded.name,
            price = excluded.price,
            discount_percent = excluded.discount_percent,
            available = excluded.available,
            image_url = COALESCE(excluded.image_url, products.image_url),
            product_url = COALESCE(excluded.product_url, products.product_url),
            last_seen_at = excluded.last_seen_at,
            last_scraped_at = excluded.last_scraped_at",
        params![
            delta.key,
            delta.name,
            delta.price,
            delta.discount_percent,
            delta.available,
            delta.image_url,
            delta.product_url,
            observed_at,
        ],
    )?;

    Ok(if exists {
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Created
    })
}

fn append_in(conn: &Connection, run_id: &str, delta: &ProductDelta, observed_at: DateTime<Utc>) -> ScrapeResult<()> {
    conn.execute(
        "INSERT INTO product_history (product_key, run_id, name, price, discount_percent, available, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            delta.key,
            run_id,
            delta.name,
            delta.price,
            delta.discount_percent,
            delta.available,
            observed_at,
        ],
    )?;
    Ok(())
}

fn persist_in(
    conn: &mut Connection,
    run_id: &str,
    delta: &ProductDelta,
    observed_at: DateTime<Utc>,
) -> ScrapeResult<UpsertOutcome> {
    let tx = conn.transaction()?;
    let outcome = upsert_in(&tx, delta, observed_at)?;
    append_in(&tx, run_id, delta, observed_at)?;
    tx.commit()?;
    Ok(outcome)
}

#[async_trait]
impl ProductStore for SqliteStore {
    async fn create_run(&self, target_url: &str) -> ScrapeResult<RunRecord> {
        let run = RunRecord {
            run_id: uuid::Uuid::new_v4().to_string(),
            target_url: target_url.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            counters: RunCounters::default(),
            error_summary: None,
        };

        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO scraper_runs (run_id, target_url, started_at, status) VALUES (?1, ?2, ?3, ?4)",
            params![run.run_id, run.target_url, run.started_at, run.status.to_string()],
        )?;

        info!("Created run: {}", run.run_id);
        Ok(run)
    }

    async fn upsert_product(&self, delta: &ProductDelta, observed_at: DateTime<Utc>) -> ScrapeResult<UpsertOutcome> {
        let conn = self.connection.lock().await;
        upsert_in(&conn, delta, observed_at)
    }

    async fn append_history(&self, run_id: &str, delta: &ProductDelta, observed_at: DateTime<Utc>) -> ScrapeResult<()> {
        let conn = self.connection.lock().await;
        append_in(&conn, run_id, delta, observed_at)
    }

    async fn persist_observation(
        &self,
        run_id: &str,
        delta: &ProductDelta,
        observed_at: DateTime<Utc>,
    ) -> ScrapeResult<UpsertOutcome> {
        let mut conn = self.connection.lock().await;
        let outcome = persist_in(&mut conn, run_id, delta, observed_at)?;
        debug!("Persisted {} ({:?})", delta.key, outcome);
        Ok(outcome)
    }

    async fn finalize_run(&self, run: &RunRecord) -> ScrapeResult<()> {
        let finished_at = run.finished_at.unwrap_or_else(Utc::now);
        let c = &run.counters;

        let conn = self.connection.lock().await;
        let updated = conn.execute(
            "UPDATE scraper_runs SET
                finished_at = ?1, status = ?2,
                pages_visited = ?3, pages_failed = ?4, candidates_seen = ?5,
                records_accepted = ?6, records_rejected = ?7,
                records_created = ?8, records_updated = ?9,
                error_summary = ?10
             WHERE run_id = ?11 AND status = ?12",
            params![
                finished_at,
                run.status.to_string(),
                c.pages_visited as i64,
                c.pages_failed as i64,
                c.candidates_seen as i64,
                c.records_accepted as i64,
                c.records_rejected as i64,
                c.records_created as i64,
                c.records_updated as i64,
                run.error_summary,
                run.run_id,
                RunStatus::Running.to_string(),
            ],
        )?;

        if updated == 0 {
            return Err(ScrapeError::storage(format!(
                "Run {} is missing or already finalized",
                run.run_id
            )));
        }

        info!("Finalized run {} as {}", run.run_id, run.status);
        Ok(())
    }
}
