use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod orchestrator;
pub mod reconcile;

pub use orchestrator::{Orchestrator, RunPhase};
pub use reconcile::{KeyConfig, ProductDelta, ReconcileOutcome, ReconcileSettings, ReconciliationEngine, Rejection};

use crate::config::AppConfig;
use crate::error::ScrapeResult;
use crate::storage::{RunRecord, SqliteStore};

/// Open the configured store and rendering backend and execute one run.
///
/// Runs of the same target left in `running` for longer than the configured
/// orphan window are marked failed before the new run is created. Younger
/// ones may belong to a run that is still in progress and are left alone.
pub async fn run_once(config: &AppConfig, cancel: CancellationToken) -> ScrapeResult<RunRecord> {
    config.run.validate()?;
    let target = config.run.target()?;

    let store = Arc::new(SqliteStore::open(&config.database).await?);
    store.fail_orphaned_runs(target.as_str(), config.run.orphan_after()).await?;

    let sessions = crate::scraper::session_factory(&config.session).await?;
    info!("Starting run against {} with {} backend", config.run.target_url, sessions.name());

    Orchestrator::new(store, sessions).run_once(&config.run, cancel).await
}
