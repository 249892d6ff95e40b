//! Database layer for callpulse
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Atomic delta accumulation for aggregate rows
//! - The idempotency ledger and in-flight call markers

pub mod repo;
pub mod schema;

pub use repo::Database;
