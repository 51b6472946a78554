use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use catalog_scraper::config::{get_config_path, AppConfig, ConfigOverrides};
use catalog_scraper::logging::{init_logging, LogContext};
use catalog_scraper::storage::{RunStatus, SqliteStore};
use catalog_scraper::{log_info, ScrapeError};

#[derive(Parser)]
#[command(name = "catalog-scraper")]
#[command(about = "Product catalog scraper with run tracking and price history")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, help = "Enable verbose logging")]
    verbose: bool,

    #[arg(short, long, help = "Configuration file path")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one scraping run against the configured catalog
    Run {
        #[arg(long, help = "Override the configured page bound (0 = unlimited)")]
        max_pages: Option<u32>,
    },

    /// Create the database and apply migrations
    InitDb,

    /// Load and validate the configuration
    CheckConfig,

    /// Show recent runs
    Runs {
        #[arg(short, long, default_value_t = 20, help = "Number of runs to show")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from_file(path).await?,
        None => AppConfig::load().await?,
    };
    ConfigOverrides::apply(&mut config);
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }

    init_logging(&config.logging)?;

    let context = LogContext::new("main", "startup").with_field("version", env!("CARGO_PKG_VERSION").into());
    log_info!(context, "Catalog scraper starting up");

    match cli.command {
        Commands::Run { max_pages } => {
            if let Some(max_pages) = max_pages {
                config.run.max_pages = max_pages;
            }
            run(&config).await?;
        }
        Commands::InitDb => init_db(&config).await?,
        Commands::CheckConfig => check_config(&cli.config, &config)?,
        Commands::Runs { limit } => list_runs(&config, limit).await?,
    }

    Ok(())
}

async fn run(config: &AppConfig) -> Result<()> {
    config.validate()?;
    config.ensure_directories().await?;

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current page");
            signal_token.cancel();
        }
    });

    match catalog_scraper::run_once(config, cancel).await {
        Ok(run) => {
            print_run_summary(&run);
            if run.status == RunStatus::Failed {
                anyhow::bail!("run {} failed", run.run_id);
            }
            Ok(())
        }
        Err(ScrapeError::Cancelled { run_id }) => {
            println!("Run {} cancelled; recorded as partial.", run_id);
            Ok(())
        }
        Err(e) => {
            error!("Run could not start: {}", e);
            Err(e.into())
        }
    }
}

async fn init_db(config: &AppConfig) -> Result<()> {
    config.ensure_directories().await?;
    SqliteStore::open(&config.database).await?;
    println!("Database ready at {}", config.database.path.display());
    Ok(())
}

fn check_config(path: &Option<PathBuf>, config: &AppConfig) -> Result<()> {
    let path = path.clone().unwrap_or_else(get_config_path);
    match config.validate() {
        Ok(()) => {
            info!("Configuration at {} is valid", path.display());
            println!("Configuration is valid: {}", path.display());
            println!("  target:  {}", config.run.target_url);
            println!("  backend: {}", config.session.backend);
            println!("  pages:   {}", config.run.max_pages);
            Ok(())
        }
        Err(e) => {
            error!("Configuration validation failed: {}", e);
            Err(e.into())
        }
    }
}

async fn list_runs(config: &AppConfig, limit: usize) -> Result<()> {
    let store = SqliteStore::open(&config.database).await?;
    let runs = store.list_runs(limit).await?;

    println!("Recent runs:");
    println!(
        "{:<36} {:<10} {:<20} {:>6} {:>9} {:>9}",
        "Run ID", "Status", "Started", "Pages", "Accepted", "Rejected"
    );
    println!("{}", "-".repeat(95));

    for run in runs {
        println!(
            "{:<36} {:<10} {:<20} {:>6} {:>9} {:>9}",
            run.run_id,
            run.status,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.counters.pages_visited,
            run.counters.records_accepted,
            run.counters.records_rejected
        );
    }

    Ok(())
}

fn print_run_summary(run: &catalog_scraper::RunRecord) {
    println!("Run {} finished: {}", run.run_id, run.status);
    println!("  pages visited:   {}", run.counters.pages_visited);
    println!("  pages failed:    {}", run.counters.pages_failed);
    println!("  candidates seen: {}", run.counters.candidates_seen);
    println!(
        "  accepted:        {} ({} new, {} updated)",
        run.counters.records_accepted, run.counters.records_created, run.counters.records_updated
    );
    println!("  rejected:        {}", run.counters.records_rejected);
    if let Some(duration) = run.duration() {
        println!("  duration:        {}s", duration.num_seconds());
    }
    if let Some(summary) = &run.error_summary {
        println!("  errors:          {}", summary);
    }
}
