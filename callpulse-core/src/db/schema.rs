//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: aggregate rows
    r#"
    -- ============================================
    -- Template aggregates: one row per (template, period)
    -- ============================================

    CREATE TABLE IF NOT EXISTS template_aggregates (
        template_id           TEXT NOT NULL,
        period                TEXT NOT NULL,   -- '2024-03' or '2024-03-15T14'
        period_kind           TEXT NOT NULL,   -- 'month' | 'hour'

        total_calls           INTEGER NOT NULL DEFAULT 0,
        successful_calls      INTEGER NOT NULL DEFAULT 0,
        failed_calls          INTEGER NOT NULL DEFAULT 0,
        escalations_triggered INTEGER NOT NULL DEFAULT 0,
        total_duration        REAL NOT NULL DEFAULT 0,
        quality_score_sum     REAL NOT NULL DEFAULT 0,
        quality_score_count   INTEGER NOT NULL DEFAULT 0,
        total_usages          INTEGER NOT NULL DEFAULT 0,
        template_views        INTEGER NOT NULL DEFAULT 0,
        total_ratings         INTEGER NOT NULL DEFAULT 0,
        rating_sum            INTEGER NOT NULL DEFAULT 0,
        active_assistants     INTEGER NOT NULL DEFAULT 0,
        deployed_assistants   INTEGER NOT NULL DEFAULT 0,
        calls_started         INTEGER NOT NULL DEFAULT 0,
        function_calls        INTEGER NOT NULL DEFAULT 0,

        computed_at           DATETIME NOT NULL,

        PRIMARY KEY (template_id, period)
    );

    -- Keyed counters: rating distribution and per-objective tallies
    CREATE TABLE IF NOT EXISTS template_buckets (
        template_id      TEXT NOT NULL,
        period           TEXT NOT NULL,
        bucket_kind      TEXT NOT NULL,   -- 'rating' | 'objective'
        bucket_key       TEXT NOT NULL,
        value            INTEGER NOT NULL DEFAULT 0,

        PRIMARY KEY (template_id, period, bucket_kind, bucket_key)
    );

    -- Denormalized sets: unique users, failure/escalation reasons, functions
    CREATE TABLE IF NOT EXISTS template_set_members (
        template_id      TEXT NOT NULL,
        period           TEXT NOT NULL,
        set_name         TEXT NOT NULL,
        member           TEXT NOT NULL,
        added_at         DATETIME NOT NULL,

        PRIMARY KEY (template_id, period, set_name, member)
    );

    -- ============================================
    -- Assistant aggregates
    -- ============================================

    CREATE TABLE IF NOT EXISTS assistant_aggregates (
        assistant_id        TEXT PRIMARY KEY,
        total_calls         INTEGER NOT NULL DEFAULT 0,
        successful_calls    INTEGER NOT NULL DEFAULT 0,
        last_call_at        DATETIME,
        performance_metrics JSON,
        updated_at          DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_template_aggregates_kind ON template_aggregates(period_kind, period);
    "#,
    // Version 2: idempotency ledger, in-flight call markers, assistant directory
    r#"
    CREATE TABLE IF NOT EXISTS processed_events (
        idempotency_key  TEXT PRIMARY KEY,
        processed_at     DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS active_calls (
        call_id          TEXT PRIMARY KEY,
        template_id      TEXT NOT NULL,
        started_at       DATETIME NOT NULL,
        expires_at       DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS assistant_directory (
        assistant_id     TEXT PRIMARY KEY,
        template_id      TEXT NOT NULL,
        user_id          TEXT,
        category         TEXT,
        updated_at       DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_active_calls_template ON active_calls(template_id, expires_at);
    CREATE INDEX IF NOT EXISTS idx_processed_events_at ON processed_events(processed_at);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get current schema version
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
