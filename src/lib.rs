//! Catalog Scraper - scheduled product catalog scraping with price history
//!
//! This library provides:
//! - Rendering sessions (headless browser or plain HTTP) behind one contract
//! - Selector-driven extraction of product cards
//! - Reconciliation of raw candidates into canonical product records
//! - A run orchestrator with retry and throttle policies
//! - SQLite persistence of products, price history and run records

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod scraper;
pub mod storage;

// Re-export main types for convenience
pub use crate::config::AppConfig;
pub use crate::core::{run_once, Orchestrator};
pub use crate::error::{RejectReason, ScrapeError, ScrapeResult};
pub use crate::storage::{ProductStore, RunRecord, RunStatus, SqliteStore};
