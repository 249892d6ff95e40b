//! # callpulse-core
//!
//! Core library for callpulse - call-analytics ingestion and aggregation for
//! voice AI assistants.
//!
//! This library provides:
//! - Domain types for call-lifecycle events and transcript analysis
//! - A heuristic conversation analyzer
//! - Aggregate rows built from commutative typed deltas, stored in SQLite
//! - Alert evaluation with webhook or log notification
//! - The per-event ingestion entry point with an idempotency ledger
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! ```text
//! event JSON ─► Ingestor ─► route ─► ConversationAnalyzer (call_ended with transcript)
//!                              │
//!                              ▼
//!                     AggregationUpdater ─► AggregateStore (month, hour, assistant rows)
//!                              │
//!                              ▼
//!                       AlertEvaluator ─► Notifier
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use callpulse_core::{Config, Database};
//!
//! // Load configuration
//! let config = Config::load().expect("failed to load config");
//!
//! // Open database
//! let db = Database::open(&Config::database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//! ```

// Re-export commonly used items at the crate root
pub use aggregate::{
    AggregateStore, AggregationUpdater, AssistantAggregate, CommitOutcome, Delta, Period,
    TemplateAggregate,
};
pub use alerts::{Alert, AlertEvaluator, AlertType, Notifier};
pub use analyzer::ConversationAnalyzer;
pub use config::Config;
pub use db::Database;
pub use directory::TemplateDirectory;
pub use error::{Error, Result};
pub use ingest::{Disposition, IngestReport, IngestStage, Ingestor};
pub use types::*;

// Public modules
pub mod aggregate;
pub mod alerts;
pub mod analyzer;
pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod types;
