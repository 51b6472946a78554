use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::RunConfig;
use crate::core::reconcile::ReconciliationEngine;
use crate::error::{RejectReason, ScrapeError, ScrapeResult};
use crate::logging::{LogContext, PerformanceLogger};
use crate::scraper::extractor::{ExtractionOutcome, Extractor, RawCandidate};
use crate::scraper::rate_limiter::ThrottlePolicy;
use crate::scraper::retry::{RetryDecision, RetryPolicy};
use crate::scraper::session::{MarkupSnapshot, RenderingSession, SessionFactory, SessionGuard};
use crate::storage::{ProductStore, RunCounters, RunRecord, RunStatus, UpsertOutcome};
use crate::{log_debug, log_error, log_info, log_warn};

/// Most page errors carried into a run's error summary
const MAX_SUMMARY_ERRORS: usize = 5;

/// Run lifecycle phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Initializing,
    Running { page_index: u32 },
    Finalizing,
}

/// Why the page loop stopped
#[derive(Debug)]
enum LoopExit {
    /// No next-page control, or the page bound was reached
    Exhausted,
    /// Navigation to the next page failed after retries
    Stranded,
    Crashed,
    Cancelled,
}

/// Mutable bookkeeping for one run
struct RunExecution {
    run_id: String,
    phase: RunPhase,
    counters: RunCounters,
    pages_succeeded: u32,
    had_failures: bool,
    persisted_keys: HashSet<String>,
    errors: Vec<String>,
}

impl RunExecution {
    fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            phase: RunPhase::Initializing,
            counters: RunCounters::default(),
            pages_succeeded: 0,
            had_failures: false,
            persisted_keys: HashSet::new(),
            errors: Vec::new(),
        }
    }

    fn set_phase(&mut self, phase: RunPhase) {
        self.phase = phase;
        debug!("Run {} entering {:?}", self.run_id, self.phase);
    }

    fn add_error(&mut self, message: String) {
        self.had_failures = true;
        self.errors.push(message);
    }

    fn error_summary(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        let mut summary = self
            .errors
            .iter()
            .take(MAX_SUMMARY_ERRORS)
            .cloned()
            .collect::<Vec<_>>()
            .join("; ");
        if self.errors.len() > MAX_SUMMARY_ERRORS {
            summary.push_str(&format!(" (+{} more)", self.errors.len() - MAX_SUMMARY_ERRORS));
        }
        Some(summary)
    }

    fn final_status(&self, exit: &LoopExit) -> RunStatus {
        if self.pages_succeeded == 0 && !matches!(exit, LoopExit::Cancelled) {
            return RunStatus::Failed;
        }
        match exit {
            LoopExit::Cancelled | LoopExit::Crashed | LoopExit::Stranded => RunStatus::Partial,
            LoopExit::Exhausted if self.had_failures => RunStatus::Partial,
            LoopExit::Exhausted => RunStatus::Succeeded,
        }
    }
}

/// Per-run collaborators compiled from the run configuration
struct RunPlan<'a> {
    config: &'a RunConfig,
    target: Url,
    extractor: Extractor,
    engine: ReconciliationEngine,
    retry: RetryPolicy,
    throttle: ThrottlePolicy,
    cancel: CancellationToken,
}

/// Drives one run end to end: session, pages, extraction, reconciliation, persistence
pub struct Orchestrator {
    store: Arc<dyn ProductStore>,
    sessions: Arc<dyn SessionFactory>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn ProductStore>, sessions: Arc<dyn SessionFactory>) -> Self {
        Self { store, sessions }
    }

    /// Execute a single run.
    ///
    /// Configuration errors and a failure to create the run record are returned
    /// before any navigation. Cancellation finalizes the run as partial, closes
    /// the session and returns `ScrapeError::Cancelled`. Every other failure is
    /// absorbed into the returned record; a failed final write is logged.
    pub async fn run_once(&self, config: &RunConfig, cancel: CancellationToken) -> ScrapeResult<RunRecord> {
        config.validate()?;

        let plan = RunPlan {
            config,
            target: config.target()?,
            extractor: Extractor::compile(&config.field_map, &config.next_page_selector)?,
            engine: ReconciliationEngine::new(&config.reconcile_settings())?,
            retry: RetryPolicy::new(&config.retry),
            throttle: ThrottlePolicy::new(&config.throttle),
            cancel,
        };

        let mut run = self.store.create_run(plan.target.as_str()).await?;
        let mut execution = RunExecution::new(&run.run_id);
        let context = LogContext::new("orchestrator", "run_once")
            .with_run_id(&run.run_id)
            .with_url(plan.target.as_str());
        log_info!(context, "Run started");

        let exit = match self.sessions.open(&plan.target, &config.render_options()).await {
            Ok(session) => {
                let mut guard = SessionGuard::new(session);
                let exit = match guard.session() {
                    Some(session) => self.drive_pages(&plan, session, &mut execution).await,
                    None => {
                        execution.add_error("session released before use".to_string());
                        LoopExit::Crashed
                    }
                };
                execution.set_phase(RunPhase::Finalizing);
                guard.release().await;
                exit
            }
            Err(e) => {
                log_error!(context.clone().with_error_category(e.category()), e, "Failed to open rendering session");
                execution.add_error(format!("session open failed: {}", e));
                execution.set_phase(RunPhase::Finalizing);
                LoopExit::Crashed
            }
        };

        run.status = execution.final_status(&exit);
        run.finished_at = Some(Utc::now());
        run.counters = execution.counters.clone();
        run.error_summary = execution.error_summary();

        let context = context.with_status(run.status.to_string());
        if let Err(e) = self.store.finalize_run(&run).await {
            log_error!(
                context.clone().with_error_category(e.category()),
                e,
                "Failed to record the final state of the run"
            );
        }

        log_info!(
            context,
            "Run finished",
            pages_visited = run.counters.pages_visited,
            pages_failed = run.counters.pages_failed,
            candidates_seen = run.counters.candidates_seen,
            records_accepted = run.counters.records_accepted,
            records_rejected = run.counters.records_rejected
        );

        if matches!(exit, LoopExit::Cancelled) {
            return Err(ScrapeError::Cancelled { run_id: run.run_id });
        }
        Ok(run)
    }

    async fn drive_pages(
        &self,
        plan: &RunPlan<'_>,
        session: &mut dyn RenderingSession,
        execution: &mut RunExecution,
    ) -> LoopExit {
        let mut page_index: u32 = 0;

        loop {
            if plan.cancel.is_cancelled() {
                info!("Run {} cancelled before page {}", execution.run_id, page_index);
                return LoopExit::Cancelled;
            }
            if plan.config.max_pages > 0 && page_index >= plan.config.max_pages {
                debug!("Page bound {} reached", plan.config.max_pages);
                return LoopExit::Exhausted;
            }

            execution.set_phase(RunPhase::Running { page_index });
            let context = LogContext::new("orchestrator", "page")
                .with_run_id(&execution.run_id)
                .with_page(page_index);
            let timer = PerformanceLogger::new(context.clone());

            let has_next_page = match self.render_with_policy(plan, session, page_index).await {
                Ok(snapshot) => {
                    execution.counters.pages_visited += 1;
                    match self.process_page(plan, &snapshot, execution).await {
                        Ok(outcome_has_next) => {
                            execution.pages_succeeded += 1;
                            timer.finish_with_status("Page processed", "ok");
                            Some(outcome_has_next)
                        }
                        Err(e) => {
                            execution.counters.pages_failed += 1;
                            execution.add_error(format!("page {}: {}", page_index, e));
                            timer.finish_with_error("Page skipped", &e);
                            None
                        }
                    }
                }
                Err(e) if e.is_session_fatal() => {
                    execution.add_error(format!("page {}: session crashed: {}", page_index, e));
                    timer.finish_with_error("Rendering session crashed", &e);
                    return LoopExit::Crashed;
                }
                Err(e) => {
                    execution.counters.pages_failed += 1;
                    execution.add_error(format!("page {}: {}", page_index, e));
                    timer.finish_with_error("Page failed after retries", &e);
                    None
                }
            };

            page_index += 1;

            if has_next_page == Some(false) {
                debug!("No next-page control after page {}", page_index - 1);
                return LoopExit::Exhausted;
            }
            if plan.config.max_pages > 0 && page_index >= plan.config.max_pages {
                debug!("Page bound {} reached", plan.config.max_pages);
                return LoopExit::Exhausted;
            }

            match self.advance_with_policy(plan, session, page_index).await {
                Ok(true) => {}
                Ok(false) => return LoopExit::Exhausted,
                Err(e) if e.is_session_fatal() => {
                    execution.add_error(format!("advance to page {}: session crashed: {}", page_index, e));
                    log_warn!(context.with_error_category(e.category()), e, "Session crashed while advancing");
                    return LoopExit::Crashed;
                }
                Err(e) => {
                    execution.add_error(format!("advance to page {}: {}", page_index, e));
                    log_warn!(context.with_error_category(e.category()), e, "Could not reach next page");
                    return LoopExit::Stranded;
                }
            }
        }
    }

    /// Extract, reconcile and persist one rendered page. Returns whether a next page exists.
    async fn process_page(
        &self,
        plan: &RunPlan<'_>,
        snapshot: &MarkupSnapshot,
        execution: &mut RunExecution,
    ) -> ScrapeResult<bool> {
        let page_url = Url::parse(&snapshot.url).unwrap_or_else(|_| plan.target.clone());
        let ExtractionOutcome {
            candidates,
            has_next_page,
        } = plan.extractor.extract(&snapshot.html, Some(&page_url))?;

        execution.counters.candidates_seen += candidates.len() as u64;

        let outcome = plan.engine.reconcile(candidates);
        for rejection in &outcome.rejected {
            log_rejection(&rejection.candidate, &rejection.reason);
        }
        let context = LogContext::new("orchestrator", "reconcile")
            .with_run_id(&execution.run_id)
            .with_url(&snapshot.url)
            .with_number_field("accepted", outcome.accepted.len() as i64)
            .with_number_field("rejected", outcome.rejected.len() as i64);
        log_debug!(context, "Page reconciled");
        execution.counters.records_rejected += outcome.rejected.len() as u64;

        let mut storage_errors = 0usize;
        for delta in outcome.accepted {
            if execution.persisted_keys.contains(&delta.key) {
                debug!(key = %delta.key, reason = RejectReason::DuplicateInRun.as_str(), "Candidate rejected");
                execution.counters.records_rejected += 1;
                continue;
            }

            match self
                .store
                .persist_observation(&execution.run_id, &delta, Utc::now())
                .await
            {
                Ok(result) => {
                    execution.counters.records_accepted += 1;
                    match result {
                        UpsertOutcome::Created => execution.counters.records_created += 1,
                        UpsertOutcome::Updated => execution.counters.records_updated += 1,
                    }
                    execution.persisted_keys.insert(delta.key);
                }
                Err(e) => {
                    warn!("Failed to persist {} ({}): {}", delta.key, RejectReason::StorageFailure, e);
                    execution.counters.records_rejected += 1;
                    storage_errors += 1;
                }
            }
        }

        if storage_errors > 0 {
            return Err(ScrapeError::storage(format!(
                "{} records could not be persisted",
                storage_errors
            )));
        }

        Ok(has_next_page)
    }

    async fn render_with_policy(
        &self,
        plan: &RunPlan<'_>,
        session: &mut dyn RenderingSession,
        page_index: u32,
    ) -> ScrapeResult<MarkupSnapshot> {
        let mut retries_done = 0;
        loop {
            plan.throttle.wait().await;
            match session.render_page().await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) => match backoff(&plan.retry, retries_done, &e, "render", page_index) {
                    Some(delay) => {
                        tokio::time::sleep(delay).await;
                        retries_done += 1;
                    }
                    None => return Err(e),
                },
            }
        }
    }

    async fn advance_with_policy(
        &self,
        plan: &RunPlan<'_>,
        session: &mut dyn RenderingSession,
        page_index: u32,
    ) -> ScrapeResult<bool> {
        let mut retries_done = 0;
        loop {
            plan.throttle.wait().await;
            match session.advance_to_next_page(&plan.config.next_page_selector).await {
                Ok(advanced) => return Ok(advanced),
                Err(e) => match backoff(&plan.retry, retries_done, &e, "advance", page_index) {
                    Some(delay) => {
                        tokio::time::sleep(delay).await;
                        retries_done += 1;
                    }
                    None => return Err(e),
                },
            }
        }
    }
}

fn backoff(retry: &RetryPolicy, retries_done: u32, error: &ScrapeError, operation: &str, page_index: u32) -> Option<std::time::Duration> {
    match retry.decide(retries_done, error) {
        RetryDecision::Retry { delay } => {
            warn!(
                "{} of page {} failed ({}), retry {}/{} in {}ms",
                operation,
                page_index,
                error,
                retries_done + 1,
                retry.max_attempts(),
                delay.as_millis()
            );
            Some(delay)
        }
        RetryDecision::GiveUp => None,
    }
}

fn log_rejection(candidate: &RawCandidate, reason: &RejectReason) {
    debug!(
        position = candidate.position,
        reason = reason.as_str(),
        name = candidate.get(crate::scraper::extractor::fields::NAME).unwrap_or_default(),
        "Candidate rejected"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraper::extractor::{fields, FieldMap, FieldRule};
    use crate::scraper::rate_limiter::ThrottleConfig;
    use crate::scraper::retry::RetryConfig;
    use crate::scraper::session::{MarkupSnapshot, RenderOptions};
    use crate::storage::SqliteStore;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// What a scripted session does on each call
    #[derive(Clone)]
    enum Step {
        Page(String),
        Fail(fn() -> ScrapeError),
    }

    fn timeout() -> ScrapeError {
        ScrapeError::NavigationTimeout {
            url: "https://shop.example/catalog".to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    fn crash() -> ScrapeError {
        ScrapeError::crashed("Target closed")
    }

    #[derive(Default)]
    struct Calls {
        renders: AtomicUsize,
        advances: AtomicUsize,
        closes: AtomicUsize,
    }

    /// What a second run does against the shared store before it starts
    struct Intruder {
        store: Arc<SqliteStore>,
        orphan_after: chrono::Duration,
        started: Option<RunRecord>,
    }

    struct ScriptedSession {
        renders: VecDeque<Step>,
        advances: VecDeque<Result<bool, fn() -> ScrapeError>>,
        calls: Arc<Calls>,
        intruder: Option<Intruder>,
        cancel_on_advance: Option<CancellationToken>,
    }

    #[async_trait]
    impl RenderingSession for ScriptedSession {
        async fn render_page(&mut self) -> ScrapeResult<MarkupSnapshot> {
            self.calls.renders.fetch_add(1, Ordering::SeqCst);
            if let Some(intruder) = self.intruder.as_mut().filter(|i| i.started.is_none()) {
                let target = "https://shop.example/catalog";
                intruder.store.fail_orphaned_runs(target, intruder.orphan_after).await?;
                intruder.started = Some(intruder.store.create_run(target).await?);
            }
            match self.renders.pop_front() {
                Some(Step::Page(html)) => Ok(MarkupSnapshot {
                    url: "https://shop.example/catalog".to_string(),
                    html,
                    rendered_at: Utc::now(),
                }),
                Some(Step::Fail(make)) => Err(make()),
                None => Err(crash()),
            }
        }

        async fn advance_to_next_page(&mut self, _next_page_selector: &str) -> ScrapeResult<bool> {
            self.calls.advances.fetch_add(1, Ordering::SeqCst);
            if let Some(cancel) = self.cancel_on_advance.take() {
                cancel.cancel();
            }
            match self.advances.pop_front() {
                Some(Ok(advanced)) => Ok(advanced),
                Some(Err(make)) => Err(make()),
                None => Ok(false),
            }
        }

        async fn close(&mut self) -> ScrapeResult<()> {
            self.calls.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ScriptedFactory {
        session: Mutex<Option<ScriptedSession>>,
        calls: Arc<Calls>,
        opens: AtomicUsize,
    }

    impl ScriptedFactory {
        fn new(renders: Vec<Step>, advances: Vec<Result<bool, fn() -> ScrapeError>>) -> Arc<Self> {
            let calls = Arc::new(Calls::default());
            Arc::new(Self {
                session: Mutex::new(Some(ScriptedSession {
                    renders: renders.into(),
                    advances: advances.into(),
                    calls: calls.clone(),
                    intruder: None,
                    cancel_on_advance: None,
                })),
                calls,
                opens: AtomicUsize::new(0),
            })
        }

        fn script(&self, edit: impl FnOnce(&mut ScriptedSession)) {
            if let Some(session) = self.session.lock().unwrap().as_mut() {
                edit(session);
            }
        }
    }

    #[async_trait]
    impl SessionFactory for ScriptedFactory {
        async fn open(&self, _target_url: &Url, _options: &RenderOptions) -> ScrapeResult<Box<dyn RenderingSession>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let session = self.session.lock().unwrap().take();
            match session {
                Some(session) => Ok(Box::new(session)),
                None => Err(crash()),
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn card(sku: &str, name: &str, price: &str) -> String {
        format!(
            r#"<div class="card"><span class="sku">{}</span><h3>{}</h3><span class="price">{}</span></div>"#,
            sku, name, price
        )
    }

    fn page(cards: &[String], next: bool) -> String {
        let next = if next { r#"<a class="next" href="?page=2">Next</a>"# } else { "" };
        format!("<html><body>{}{}</body></html>", cards.join(""), next)
    }

    fn config() -> RunConfig {
        let mut rules = BTreeMap::new();
        rules.insert(fields::NAME.to_string(), FieldRule::text("h3"));
        rules.insert(fields::PRICE.to_string(), FieldRule::text(".price"));
        rules.insert(fields::SKU.to_string(), FieldRule::text(".sku"));

        RunConfig {
            target_url: "https://shop.example/catalog".to_string(),
            max_pages: 0,
            field_map: FieldMap {
                card_selector: ".card".to_string(),
                fields: rules,
            },
            next_page_selector: "a.next".to_string(),
            consent_overlay_selector: None,
            ready_selector: None,
            scroll_cycles: 0,
            scroll_pause_ms: 0,
            page_ready_timeout_seconds: 5,
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 1_000,
                multiplier: 2.0,
                ceiling_ms: 60_000,
            },
            throttle: ThrottleConfig {
                min_delay_ms: 100,
                max_delay_ms: 200,
            },
            ..RunConfig::default()
        }
    }

    fn two_page_catalog() -> (Vec<Step>, Vec<Result<bool, fn() -> ScrapeError>>) {
        let first: Vec<String> = (1..=5)
            .map(|i| card(&format!("P-{}", i), &format!("Product {}", i), "9,99 €"))
            .chain(std::iter::once(card("P-X", "No price", "")))
            .collect();
        let second: Vec<String> = (6..=8)
            .map(|i| card(&format!("P-{}", i), &format!("Product {}", i), "4,50 €"))
            .collect();
        (
            vec![Step::Page(page(&first, true)), Step::Page(page(&second, false))],
            vec![Ok(true)],
        )
    }

    fn orchestrator(store: &Arc<SqliteStore>, factory: &Arc<ScriptedFactory>) -> Orchestrator {
        Orchestrator::new(store.clone(), factory.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_page_run_succeeds() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let (renders, advances) = two_page_catalog();
        let factory = ScriptedFactory::new(renders, advances);

        let run = orchestrator(&store, &factory)
            .run_once(&config(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.counters.pages_visited, 2);
        assert_eq!(run.counters.candidates_seen, 9);
        assert_eq!(run.counters.records_accepted, 8);
        assert_eq!(run.counters.records_rejected, 1);
        assert_eq!(run.counters.records_created, 8);
        assert!(run.error_summary.is_none());

        assert_eq!(factory.calls.advances.load(Ordering::SeqCst), 1);
        assert_eq!(factory.calls.closes.load(Ordering::SeqCst), 1);

        let stored = store.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert_eq!(stored.counters, run.counters);
        assert_eq!(store.count_products().await.unwrap(), 8);
        assert_eq!(store.history_count_for_run(&run.run_id).await.unwrap(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_updates_existing_products() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());

        let (renders, advances) = two_page_catalog();
        let first = orchestrator(&store, &ScriptedFactory::new(renders, advances))
            .run_once(&config(), CancellationToken::new())
            .await
            .unwrap();

        let (renders, advances) = two_page_catalog();
        let second = orchestrator(&store, &ScriptedFactory::new(renders, advances))
            .run_once(&config(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(second.counters.records_created, 0);
        assert_eq!(second.counters.records_updated, 8);
        assert_eq!(store.count_products().await.unwrap(), 8);

        let history = store.history_for("P-1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].run_id, first.run_id);
        assert_eq!(history[1].run_id, second.run_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_on_second_page_is_partial() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let first: Vec<String> = (1..=3).map(|i| card(&format!("C-{}", i), "Chair", "20,00")).collect();
        let factory = ScriptedFactory::new(
            vec![Step::Page(page(&first, true)), Step::Fail(crash)],
            vec![Ok(true)],
        );

        let run = orchestrator(&store, &factory)
            .run_once(&config(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(run.counters.pages_visited, 1);
        assert_eq!(run.counters.records_accepted, 3);
        assert!(run.error_summary.unwrap().contains("crashed"));
        // Crashes are not retried
        assert_eq!(factory.calls.renders.load(Ordering::SeqCst), 2);
        assert_eq!(factory.calls.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_on_first_page_fails_run() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let factory = ScriptedFactory::new(vec![Step::Fail(crash)], vec![]);

        let run = orchestrator(&store, &factory)
            .run_once(&config(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.counters.pages_visited, 0);
        assert_eq!(factory.calls.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried_with_backoff() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let cards = vec![card("R-1", "Rake", "5,00")];
        let factory = ScriptedFactory::new(
            vec![
                Step::Fail(timeout),
                Step::Fail(timeout),
                Step::Page(page(&cards, false)),
            ],
            vec![],
        );

        let start = tokio::time::Instant::now();
        let run = orchestrator(&store, &factory)
            .run_once(&config(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(factory.calls.renders.load(Ordering::SeqCst), 3);
        // Backoff of 1s + 2s on top of three throttle waits of at least 100ms
        assert!(start.elapsed() >= Duration::from_millis(3_300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_skips_page() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let factory = ScriptedFactory::new(
            vec![
                Step::Fail(timeout),
                Step::Fail(timeout),
                Step::Fail(timeout),
                Step::Fail(timeout),
            ],
            vec![Ok(false)],
        );

        let run = orchestrator(&store, &factory)
            .run_once(&config(), CancellationToken::new())
            .await
            .unwrap();

        // Initial attempt plus three retries
        assert_eq!(factory.calls.renders.load(Ordering::SeqCst), 4);
        assert_eq!(run.counters.pages_failed, 1);
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_summary.unwrap().contains("page 0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_page_then_recovery_is_partial() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let cards = vec![card("Z-1", "Zip", "1,00")];
        let factory = ScriptedFactory::new(
            vec![
                Step::Page(page(&cards, true)),
                Step::Page("   ".to_string()),
                Step::Page(page(&[card("Z-2", "Zap", "2,00")], false)),
            ],
            vec![Ok(true), Ok(true)],
        );

        let run = orchestrator(&store, &factory)
            .run_once(&config(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(run.counters.pages_visited, 3);
        assert_eq!(run.counters.pages_failed, 1);
        assert_eq!(run.counters.records_accepted, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_cards_are_rejected_across_pages() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let first = vec![card("L-1", "Lamp", "10,00"), card("L-2", "Lamp 2", "12,00")];
        let mut grown = first.clone();
        grown.push(card("L-3", "Lamp 3", "14,00"));
        let factory = ScriptedFactory::new(
            vec![Step::Page(page(&first, true)), Step::Page(page(&grown, false))],
            vec![Ok(true)],
        );

        let run = orchestrator(&store, &factory)
            .run_once(&config(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.counters.candidates_seen, 5);
        assert_eq!(run.counters.records_accepted, 3);
        assert_eq!(run.counters.records_rejected, 2);
        assert_eq!(store.history_count_for_run(&run.run_id).await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_pages_bounds_the_loop() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let factory = ScriptedFactory::new(
            vec![
                Step::Page(page(&[card("M-1", "A", "1,00")], true)),
                Step::Page(page(&[card("M-2", "B", "1,00")], true)),
                Step::Page(page(&[card("M-3", "C", "1,00")], true)),
            ],
            vec![Ok(true), Ok(true), Ok(true)],
        );

        let mut config = config();
        config.max_pages = 2;
        let run = orchestrator(&store, &factory)
            .run_once(&config, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.counters.pages_visited, 2);
        assert_eq!(factory.calls.advances.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_advance_false_ends_run_early() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let factory = ScriptedFactory::new(
            vec![Step::Page(page(&[card("N-1", "A", "1,00")], true))],
            vec![Ok(false)],
        );

        let run = orchestrator(&store, &factory)
            .run_once(&config(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.counters.pages_visited, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_finalizes_partial() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let (renders, advances) = two_page_catalog();
        let factory = ScriptedFactory::new(renders, advances);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orchestrator(&store, &factory)
            .run_once(&config(), cancel)
            .await
            .unwrap_err();

        let run_id = match err {
            ScrapeError::Cancelled { run_id } => run_id,
            other => panic!("expected cancellation, got {:?}", other),
        };
        let stored = store.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Partial);
        assert!(stored.finished_at.is_some());
        assert_eq!(factory.calls.renders.load(Ordering::SeqCst), 0);
        assert_eq!(factory.calls.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_between_pages_keeps_first_page() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let (renders, advances) = two_page_catalog();
        let factory = ScriptedFactory::new(renders, advances);
        let cancel = CancellationToken::new();
        factory.script(|session| session.cancel_on_advance = Some(cancel.clone()));

        let err = orchestrator(&store, &factory)
            .run_once(&config(), cancel)
            .await
            .unwrap_err();

        let run_id = match err {
            ScrapeError::Cancelled { run_id } => run_id,
            other => panic!("expected cancellation, got {:?}", other),
        };
        let stored = store.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Partial);
        assert_eq!(stored.counters.pages_visited, 1);
        assert_eq!(stored.counters.records_accepted, 5);
        assert_eq!(stored.counters.records_rejected, 1);
        assert_eq!(store.history_count_for_run(&run_id).await.unwrap(), 5);
        assert_eq!(store.count_products().await.unwrap(), 5);

        assert_eq!(factory.calls.renders.load(Ordering::SeqCst), 1);
        assert_eq!(factory.calls.advances.load(Ordering::SeqCst), 1);
        assert_eq!(factory.calls.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_run_does_not_fail_live_run() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let (renders, advances) = two_page_catalog();
        let factory = ScriptedFactory::new(renders, advances);
        factory.script(|session| {
            session.intruder = Some(Intruder {
                store: store.clone(),
                orphan_after: config().orphan_after(),
                started: None,
            })
        });

        let run = orchestrator(&store, &factory)
            .run_once(&config(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);

        let stored = store.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert_eq!(stored.counters, run.counters);
        assert_eq!(stored.counters.records_accepted, 8);
        assert!(stored.error_summary.is_none());

        let runs = store.list_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        let other = runs.iter().find(|r| r.run_id != run.run_id).unwrap();
        assert_eq!(other.status, RunStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_final_write_still_returns_outcome() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let (renders, advances) = two_page_catalog();
        let factory = ScriptedFactory::new(renders, advances);
        // A zero window sweeps the live run, so its final write matches no row
        factory.script(|session| {
            session.intruder = Some(Intruder {
                store: store.clone(),
                orphan_after: chrono::Duration::zero(),
                started: None,
            })
        });

        let run = orchestrator(&store, &factory)
            .run_once(&config(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.counters.records_accepted, 8);
        assert_eq!(factory.calls.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_error_before_navigation() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let factory = ScriptedFactory::new(vec![], vec![]);

        let mut config = config();
        config.field_map.card_selector = "<<<".to_string();
        let result = orchestrator(&store, &factory)
            .run_once(&config, CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ScrapeError::InvalidSelector { .. })));
        assert_eq!(factory.opens.load(Ordering::SeqCst), 0);
        assert!(store.list_runs(10).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_open_failure_fails_run() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let factory = ScriptedFactory::new(vec![], vec![]);
        factory.session.lock().unwrap().take();

        let run = orchestrator(&store, &factory)
            .run_once(&config(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_summary.unwrap().contains("session open failed"));
    }

    #[test]
    fn test_error_summary_is_bounded() {
        let mut execution = RunExecution::new("run");
        for i in 0..8 {
            execution.add_error(format!("e{}", i));
        }
        let summary = execution.error_summary().unwrap();
        assert!(summary.starts_with("e0; e1"));
        assert!(summary.ends_with("(+3 more)"));
    }
}
