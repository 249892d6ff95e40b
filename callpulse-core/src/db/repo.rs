//! Database repository layer
//!
//! SQLite implementation of [`AggregateStore`] and [`TemplateDirectory`].
//! Counter deltas are applied as `column = column + ?` statements inside one
//! transaction, so accumulation never reads a value back into Rust.

use crate::aggregate::{
    ActiveCall, AggregateStore, AssistantAggregate, AssistantUpdate, CommitOutcome, Delta, Period,
    RowWrite, TemplateAggregate,
};
use crate::directory::TemplateDirectory;
use crate::error::{Error, Result};
use crate::types::AssistantProfile;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

/// Database handle (single connection behind a mutex)
pub struct Database {
    conn: Mutex<Connection>,
}

/// Timestamps are stored as fixed-width UTC RFC 3339 so they sort as text.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Concurrent invocations wait on the writer lock instead of failing
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        // WAL so dashboard reads do not block ingestion writes
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        super::schema::run_migrations(&conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Store("database connection lock poisoned".to_string()))
    }

    // ============================================
    // Template aggregate operations
    // ============================================

    fn apply_row_write(tx: &Transaction<'_>, write: &RowWrite, now: &str) -> Result<()> {
        let period = write.period.key();

        tx.execute(
            r#"
            INSERT INTO template_aggregates (template_id, period, period_kind, computed_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(template_id, period) DO UPDATE SET
                computed_at = excluded.computed_at
            "#,
            params![write.template_id, period, write.period.kind(), now],
        )?;

        for delta in &write.deltas {
            if !delta.is_effective() {
                tracing::warn!(template_id = %write.template_id, ?delta, "Skipping ineffective delta");
                continue;
            }
            match delta {
                Delta::Counter { counter, amount } => {
                    let column = counter.column();
                    let sql = format!(
                        "UPDATE template_aggregates SET {column} = {column} + ?1 \
                         WHERE template_id = ?2 AND period = ?3"
                    );
                    if counter.is_fractional() {
                        tx.execute(&sql, params![amount, write.template_id, period])?;
                    } else {
                        let amount = amount.round() as i64;
                        tx.execute(&sql, params![amount, write.template_id, period])?;
                    }
                }
                Delta::Bucket { bucket, amount } => {
                    tx.execute(
                        r#"
                        INSERT INTO template_buckets (template_id, period, bucket_kind, bucket_key, value)
                        VALUES (?1, ?2, ?3, ?4, ?5)
                        ON CONFLICT(template_id, period, bucket_kind, bucket_key) DO UPDATE SET
                            value = value + excluded.value
                        "#,
                        params![write.template_id, period, bucket.kind(), bucket.key(), amount],
                    )?;
                }
                Delta::SetAdd { set, member } => {
                    Self::insert_set_member(tx, write, &period, set.name(), member, now)?;
                }
                Delta::SetUnion { set, members } => {
                    for member in members.iter().filter(|m| !m.trim().is_empty()) {
                        Self::insert_set_member(tx, write, &period, set.name(), member, now)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn insert_set_member(
        tx: &Transaction<'_>,
        write: &RowWrite,
        period: &str,
        set_name: &str,
        member: &str,
        now: &str,
    ) -> Result<()> {
        tx.execute(
            r#"
            INSERT OR IGNORE INTO template_set_members (template_id, period, set_name, member, added_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![write.template_id, period, set_name, member, now],
        )?;
        Ok(())
    }

    fn row_to_template_aggregate(row: &Row) -> rusqlite::Result<TemplateAggregate> {
        let computed_at: String = row.get("computed_at")?;

        Ok(TemplateAggregate {
            template_id: row.get("template_id")?,
            period: row.get("period")?,
            total_calls: row.get("total_calls")?,
            successful_calls: row.get("successful_calls")?,
            failed_calls: row.get("failed_calls")?,
            escalations_triggered: row.get("escalations_triggered")?,
            total_duration: row.get("total_duration")?,
            quality_score_sum: row.get("quality_score_sum")?,
            quality_score_count: row.get("quality_score_count")?,
            total_usages: row.get("total_usages")?,
            template_views: row.get("template_views")?,
            total_ratings: row.get("total_ratings")?,
            rating_sum: row.get("rating_sum")?,
            active_assistants: row.get("active_assistants")?,
            deployed_assistants: row.get("deployed_assistants")?,
            calls_started: row.get("calls_started")?,
            function_calls: row.get("function_calls")?,
            rating_distribution: [0; 5],
            objective_counts: BTreeMap::new(),
            unique_users: BTreeSet::new(),
            failure_reasons: BTreeSet::new(),
            escalation_reasons: BTreeSet::new(),
            functions_invoked: BTreeSet::new(),
            computed_at: parse_ts(&computed_at).unwrap_or_else(Utc::now),
        })
    }

    /// All periods recorded for a template, newest first.
    pub fn list_periods(&self, template_id: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT period FROM template_aggregates WHERE template_id = ?1 ORDER BY period DESC",
        )?;
        let periods = stmt
            .query_map([template_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(periods)
    }

    /// Number of idempotency keys claimed so far.
    pub fn processed_event_count(&self) -> Result<i64> {
        let conn = self.lock()?;
        let count = conn.query_row("SELECT COUNT(*) FROM processed_events", [], |r| r.get(0))?;
        Ok(count)
    }

    /// Drop idempotency keys claimed before `before`. Returns how many went.
    pub fn prune_processed_events(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let pruned = conn.execute(
            "DELETE FROM processed_events WHERE processed_at < ?1",
            [ts(&before)],
        )?;
        if pruned > 0 {
            tracing::info!(pruned, before = %before, "Pruned idempotency ledger");
        }
        Ok(pruned)
    }

    // ============================================
    // Directory operations
    // ============================================

    /// Insert or update an assistant's directory entry
    pub fn register_assistant(&self, profile: &AssistantProfile) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO assistant_directory (assistant_id, template_id, user_id, category, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(assistant_id) DO UPDATE SET
                template_id = excluded.template_id,
                user_id = excluded.user_id,
                category = excluded.category,
                updated_at = excluded.updated_at
            "#,
            params![
                profile.assistant_id,
                profile.template_id,
                profile.user_id,
                profile.category,
                ts(&Utc::now()),
            ],
        )?;
        tracing::debug!(assistant_id = %profile.assistant_id, template_id = %profile.template_id, "Registered assistant");
        Ok(())
    }

    fn row_to_profile(row: &Row) -> rusqlite::Result<AssistantProfile> {
        Ok(AssistantProfile {
            assistant_id: row.get("assistant_id")?,
            template_id: row.get("template_id")?,
            user_id: row.get("user_id")?,
            category: row.get("category")?,
        })
    }

    fn row_to_assistant_aggregate(row: &Row) -> rusqlite::Result<AssistantAggregate> {
        let last_call_at: Option<String> = row.get("last_call_at")?;
        let metrics: Option<String> = row.get("performance_metrics")?;
        let updated_at: String = row.get("updated_at")?;

        Ok(AssistantAggregate {
            assistant_id: row.get("assistant_id")?,
            total_calls: row.get("total_calls")?,
            successful_calls: row.get("successful_calls")?,
            last_call_at: last_call_at.as_deref().and_then(parse_ts),
            performance_metrics: metrics.and_then(|m| serde_json::from_str(&m).ok()),
            updated_at: parse_ts(&updated_at).unwrap_or_else(Utc::now),
        })
    }
}

impl AggregateStore for Database {
    fn commit(&self, idempotency_key: Option<&str>, writes: &[RowWrite]) -> Result<CommitOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = ts(&Utc::now());

        if let Some(key) = idempotency_key {
            let claimed = tx.execute(
                "INSERT OR IGNORE INTO processed_events (idempotency_key, processed_at) VALUES (?1, ?2)",
                params![key, now],
            )?;
            if claimed == 0 {
                tracing::info!(idempotency_key = key, "Event already processed, skipping");
                return Ok(CommitOutcome::Duplicate);
            }
        }

        for write in writes {
            Self::apply_row_write(&tx, write, &now)?;
        }
        tx.commit()?;

        tracing::debug!(
            rows = writes.len(),
            deltas = writes.iter().map(|w| w.deltas.len()).sum::<usize>(),
            "Committed aggregate deltas"
        );
        Ok(CommitOutcome::Applied)
    }

    fn template_aggregate(
        &self,
        template_id: &str,
        period: &Period,
    ) -> Result<Option<TemplateAggregate>> {
        let conn = self.lock()?;
        let key = period.key();

        let row = conn
            .query_row(
                "SELECT * FROM template_aggregates WHERE template_id = ?1 AND period = ?2",
                params![template_id, key],
                Self::row_to_template_aggregate,
            )
            .optional()?;
        let Some(mut aggregate) = row else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT bucket_kind, bucket_key, value FROM template_buckets
             WHERE template_id = ?1 AND period = ?2",
        )?;
        let buckets = stmt
            .query_map(params![template_id, key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for (kind, bucket_key, value) in buckets {
            match kind.as_str() {
                "rating" => match bucket_key.parse::<usize>() {
                    Ok(rating @ 1..=5) => aggregate.rating_distribution[rating - 1] = value,
                    _ => tracing::warn!(bucket_key = %bucket_key, "Unexpected rating bucket"),
                },
                "objective" => {
                    aggregate.objective_counts.insert(bucket_key, value);
                }
                other => tracing::warn!(kind = other, "Unknown bucket kind"),
            }
        }

        let mut stmt = conn.prepare(
            "SELECT set_name, member FROM template_set_members
             WHERE template_id = ?1 AND period = ?2",
        )?;
        let members = stmt
            .query_map(params![template_id, key], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for (set_name, member) in members {
            let set = match set_name.as_str() {
                "unique_users" => &mut aggregate.unique_users,
                "failure_reasons" => &mut aggregate.failure_reasons,
                "escalation_reasons" => &mut aggregate.escalation_reasons,
                "functions_invoked" => &mut aggregate.functions_invoked,
                other => {
                    tracing::warn!(set_name = other, "Unknown set name");
                    continue;
                }
            };
            set.insert(member);
        }

        Ok(Some(aggregate))
    }

    fn update_assistant(&self, assistant_id: &str, update: &AssistantUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let metrics = update
            .performance_metrics
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO assistant_aggregates
                (assistant_id, total_calls, successful_calls, last_call_at, performance_metrics, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(assistant_id) DO UPDATE SET
                total_calls = total_calls + excluded.total_calls,
                successful_calls = successful_calls + excluded.successful_calls,
                last_call_at = COALESCE(excluded.last_call_at, last_call_at),
                performance_metrics = COALESCE(excluded.performance_metrics, performance_metrics),
                updated_at = excluded.updated_at
            "#,
            params![
                assistant_id,
                update.total_calls.max(0),
                update.successful_calls.max(0),
                update.last_call_at.as_ref().map(ts),
                metrics,
                ts(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    fn assistant_aggregate(&self, assistant_id: &str) -> Result<Option<AssistantAggregate>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT * FROM assistant_aggregates WHERE assistant_id = ?1",
            [assistant_id],
            Self::row_to_assistant_aggregate,
        )
        .optional()
        .map_err(Error::from)
    }

    fn open_call(&self, call: &ActiveCall) -> Result<()> {
        let conn = self.lock()?;
        // Expiry is in event time, so purge against the new call's start.
        let purged = conn.execute(
            "DELETE FROM active_calls WHERE expires_at <= ?1",
            [ts(&call.started_at)],
        )?;
        if purged > 0 {
            tracing::debug!(purged, "Purged expired in-flight call markers");
        }

        conn.execute(
            r#"
            INSERT OR IGNORE INTO active_calls (call_id, template_id, started_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                call.call_id,
                call.template_id,
                ts(&call.started_at),
                ts(&call.expires_at),
            ],
        )?;
        Ok(())
    }

    fn close_call(&self, call_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM active_calls WHERE call_id = ?1", [call_id])?;
        Ok(removed > 0)
    }

    fn concurrent_calls(&self, template_id: &str, at: DateTime<Utc>) -> Result<i64> {
        let conn = self.lock()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM active_calls WHERE template_id = ?1 AND started_at <= ?2 AND expires_at > ?2",
            params![template_id, ts(&at)],
            |r| r.get(0),
        )?;
        Ok(count)
    }
}

impl TemplateDirectory for Database {
    fn lookup(&self, assistant_id: &str) -> Result<Option<AssistantProfile>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT * FROM assistant_directory WHERE assistant_id = ?1",
            [assistant_id],
            Self::row_to_profile,
        )
        .optional()
        .map_err(Error::from)
    }
}
