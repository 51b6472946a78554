use rusqlite::Connection;
use tracing::info;

use crate::error::{ScrapeError, ScrapeResult};

/// Database schema version
const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Run all necessary database migrations
pub fn run_migrations(conn: &Connection) -> ScrapeResult<()> {
    info!("Running database migrations");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current_version = get_schema_version(conn)?;
    info!("Current schema version: {}", current_version);

    for version in (current_version + 1)..=CURRENT_SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        update_schema_version(conn, version)?;
    }

    Ok(())
}

/// Get current schema version
pub fn get_schema_version(conn: &Connection) -> ScrapeResult<i32> {
    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

fn update_schema_version(conn: &Connection, version: i32) -> ScrapeResult<()> {
    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
        rusqlite::params![version, chrono::Utc::now().timestamp()],
    )?;
    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> ScrapeResult<()> {
    match version {
        1 => apply_migration_v1(conn),
        _ => Err(ScrapeError::storage(format!("Unknown migration version: {}", version))),
    }
}

/// Migration v1: products, their history and run bookkeeping
fn apply_migration_v1(conn: &Connection) -> ScrapeResult<()> {
    info!("Applying migration v1: Initial schema");

    conn.execute_batch(
        "CREATE TABLE products (
            key TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            price REAL NOT NULL CHECK (price >= 0),
            discount_percent REAL CHECK (discount_percent BETWEEN 0 AND 100),
            available INTEGER NOT NULL,
            image_url TEXT,
            product_url TEXT,
            first_seen_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            last_scraped_at TEXT NOT NULL
        );

        CREATE TABLE scraper_runs (
            run_id TEXT PRIMARY KEY,
            target_url TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            status TEXT NOT NULL,
            pages_visited INTEGER NOT NULL DEFAULT 0,
            pages_failed INTEGER NOT NULL DEFAULT 0,
            candidates_seen INTEGER NOT NULL DEFAULT 0,
            records_accepted INTEGER NOT NULL DEFAULT 0,
            records_rejected INTEGER NOT NULL DEFAULT 0,
            records_created INTEGER NOT NULL DEFAULT 0,
            records_updated INTEGER NOT NULL DEFAULT 0,
            error_summary TEXT
        );

        CREATE TABLE product_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            product_key TEXT NOT NULL,
            run_id TEXT NOT NULL,
            name TEXT NOT NULL,
            price REAL NOT NULL,
            discount_percent REAL,
            available INTEGER NOT NULL,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY (product_key) REFERENCES products (key),
            FOREIGN KEY (run_id) REFERENCES scraper_runs (run_id)
        );

        CREATE INDEX idx_history_product_key ON product_history (product_key);
        CREATE INDEX idx_history_run_id ON product_history (run_id);
        CREATE INDEX idx_runs_status ON scraper_runs (status);
        CREATE INDEX idx_runs_started_at ON scraper_runs (started_at);",
    )?;

    info!("Migration v1 completed successfully");
    Ok(())
}
