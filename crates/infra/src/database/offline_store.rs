//! SQLite-backed implementation of the offline store port.
//!
//! Every call borrows a pooled connection on the blocking thread pool.
//! Headers and metadata are stored as JSON text columns.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use netguard_core::{OfflineStore, StatusCounts};
use netguard_domain::{
    DurableEntry, EntryStatus, HttpMethod, NetguardError, Priority, Result as DomainResult,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::task;
use tracing::warn;

use super::manager::DbManager;
use crate::errors::InfraError;

/// SQLite-backed offline store.
#[derive(Debug, Clone)]
pub struct SqliteOfflineStore {
    db: Arc<DbManager>,
}

impl SqliteOfflineStore {
    /// Construct a store backed by the shared manager. The schema must already
    /// be migrated.
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    fn insert_entry(conn: &Connection, entry: &DurableEntry) -> DomainResult<()> {
        let headers = to_json(&entry.headers)?;
        let metadata = to_json(&entry.metadata)?;
        conn.execute(
            ENTRY_INSERT_SQL,
            params![
                entry.id,
                entry.url,
                entry.method.as_str(),
                headers,
                entry.body,
                entry.created_at,
                entry.updated_at,
                entry.expires_at,
                entry.next_attempt_at,
                entry.priority.as_i64(),
                entry.retry_count,
                entry.max_retries,
                entry.status.as_str(),
                entry.last_error,
                metadata,
            ],
        )
        .map_err(map_sql_error)?;
        Ok(())
    }

    fn update_entry(conn: &Connection, entry: &DurableEntry) -> DomainResult<()> {
        let headers = to_json(&entry.headers)?;
        let metadata = to_json(&entry.metadata)?;
        let changed = conn
            .execute(
                ENTRY_UPDATE_SQL,
                params![
                    entry.id,
                    entry.url,
                    entry.method.as_str(),
                    headers,
                    entry.body,
                    entry.updated_at,
                    entry.expires_at,
                    entry.next_attempt_at,
                    entry.priority.as_i64(),
                    entry.retry_count,
                    entry.max_retries,
                    entry.status.as_str(),
                    entry.last_error,
                    metadata,
                ],
            )
            .map_err(map_sql_error)?;
        if changed == 0 {
            return Err(NetguardError::NotFound(format!("offline entry {}", entry.id)));
        }
        Ok(())
    }

    fn get_entry(conn: &Connection, id: &str) -> DomainResult<Option<DurableEntry>> {
        conn.query_row(&format!("{ENTRY_SELECT_SQL} WHERE id = ?1"), params![id], map_entry_row)
            .optional()
            .map_err(map_sql_error)
    }

    fn query_entries(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> DomainResult<Vec<DurableEntry>> {
        let mut stmt = conn.prepare(sql).map_err(map_sql_error)?;
        let rows = stmt.query_map(params, map_entry_row).map_err(map_sql_error)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_sql_error)
    }

    fn status_counts(conn: &Connection) -> DomainResult<StatusCounts> {
        let mut stmt = conn.prepare(STATUS_COUNTS_SQL).map_err(map_sql_error)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(map_sql_error)?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (raw, n) = row.map_err(map_sql_error)?;
            match raw.parse::<EntryStatus>() {
                Ok(status) => counts.add(status, i64_to_usize(n)),
                Err(err) => warn!(raw_status = %raw, error = %err, "unknown status in offline_entries"),
            }
        }
        Ok(counts)
    }

    /// Run `op` with a pooled connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: F) -> DomainResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> DomainResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || -> DomainResult<T> {
            let conn = db.get_connection()?;
            op(&conn)
        })
        .await
        .map_err(map_join_error)?
    }
}

#[async_trait]
impl OfflineStore for SqliteOfflineStore {
    async fn insert(&self, entry: &DurableEntry) -> DomainResult<()> {
        let entry = entry.clone();
        self.with_conn(move |conn| Self::insert_entry(conn, &entry)).await
    }

    async fn update(&self, entry: &DurableEntry) -> DomainResult<()> {
        let entry = entry.clone();
        self.with_conn(move |conn| Self::update_entry(conn, &entry)).await
    }

    async fn get(&self, id: &str) -> DomainResult<Option<DurableEntry>> {
        let id = id.to_string();
        self.with_conn(move |conn| Self::get_entry(conn, &id)).await
    }

    async fn delete(&self, id: &str) -> DomainResult<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let removed = conn
                .execute("DELETE FROM offline_entries WHERE id = ?1", params![id])
                .map_err(map_sql_error)?;
            Ok(removed > 0)
        })
        .await
    }

    async fn count(&self) -> DomainResult<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn
                .query_row("SELECT COUNT(*) FROM offline_entries", [], |row| row.get(0))
                .map_err(map_sql_error)?;
            Ok(i64_to_usize(n))
        })
        .await
    }

    async fn count_by_status(&self) -> DomainResult<StatusCounts> {
        self.with_conn(Self::status_counts).await
    }

    async fn list(&self) -> DomainResult<Vec<DurableEntry>> {
        self.with_conn(|conn| {
            Self::query_entries(conn, &format!("{ENTRY_SELECT_SQL} {ENTRY_ORDER_SQL}"), [])
        })
        .await
    }

    async fn fetch_ready(&self, now_ms: i64, limit: usize) -> DomainResult<Vec<DurableEntry>> {
        let limit = usize_to_i64(limit);
        self.with_conn(move |conn| {
            Self::query_entries(
                conn,
                &format!(
                    "{ENTRY_SELECT_SQL}
                     WHERE status = 'pending' AND next_attempt_at <= ?1 AND expires_at > ?1
                     {ENTRY_ORDER_SQL}
                     LIMIT ?2"
                ),
                params![now_ms, limit],
            )
        })
        .await
    }

    async fn fetch_expired(&self, now_ms: i64) -> DomainResult<Vec<DurableEntry>> {
        self.with_conn(move |conn| {
            Self::query_entries(
                conn,
                &format!("{ENTRY_SELECT_SQL} WHERE expires_at <= ?1 {ENTRY_ORDER_SQL}"),
                params![now_ms],
            )
        })
        .await
    }

    async fn requeue_processing(&self, now_ms: i64) -> DomainResult<usize> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE offline_entries SET status = 'pending', updated_at = ?1
                 WHERE status = 'processing'",
                params![now_ms],
            )
            .map_err(map_sql_error)
        })
        .await
    }

    async fn delete_by_status(&self, status: EntryStatus) -> DomainResult<usize> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM offline_entries WHERE status = ?1", params![status.as_str()])
                .map_err(map_sql_error)
        })
        .await
    }

    async fn next_attempt_at(&self) -> DomainResult<Option<i64>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT MIN(next_attempt_at) FROM offline_entries WHERE status = 'pending'",
                [],
                |row| row.get::<_, Option<i64>>(0),
            )
            .map_err(map_sql_error)
        })
        .await
    }
}

const ENTRY_INSERT_SQL: &str = "INSERT INTO offline_entries (
        id, url, method, headers_json, body, created_at, updated_at, expires_at,
        next_attempt_at, priority, retry_count, max_retries, status, last_error, metadata_json
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)";

const ENTRY_UPDATE_SQL: &str = "UPDATE offline_entries SET
        url = ?2, method = ?3, headers_json = ?4, body = ?5, updated_at = ?6,
        expires_at = ?7, next_attempt_at = ?8, priority = ?9, retry_count = ?10,
        max_retries = ?11, status = ?12, last_error = ?13, metadata_json = ?14
    WHERE id = ?1";

const ENTRY_SELECT_SQL: &str = "SELECT
        id, url, method, headers_json, body, created_at, updated_at, expires_at,
        next_attempt_at, priority, retry_count, max_retries, status, last_error, metadata_json
    FROM offline_entries";

const ENTRY_ORDER_SQL: &str = "ORDER BY priority DESC, created_at ASC, id ASC";

const STATUS_COUNTS_SQL: &str =
    "SELECT status, COUNT(*) FROM offline_entries GROUP BY status";

fn map_entry_row(row: &Row<'_>) -> rusqlite::Result<DurableEntry> {
    let id: String = row.get(0)?;
    let method_raw: String = row.get(2)?;
    let method = method_raw
        .parse::<HttpMethod>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, err.into()))?;
    let status_raw: String = row.get(12)?;
    let status = parse_status(&id, &status_raw);

    Ok(DurableEntry {
        url: row.get(1)?,
        method,
        headers: from_json_column(row, 3)?,
        body: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        expires_at: row.get(7)?,
        next_attempt_at: row.get(8)?,
        priority: Priority::from_i64(row.get(9)?),
        retry_count: row.get(10)?,
        max_retries: row.get(11)?,
        status,
        last_error: row.get(13)?,
        metadata: from_json_column(row, 14)?,
        id,
    })
}

fn from_json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<BTreeMap<String, String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn parse_status(id: &str, raw: &str) -> EntryStatus {
    match raw.parse::<EntryStatus>() {
        Ok(status) => status,
        Err(err) => {
            warn!(
                entry_id = %id,
                raw_status = %raw,
                error = %err,
                "invalid offline entry status in sqlite, defaulting to pending"
            );
            EntryStatus::Pending
        }
    }
}

fn to_json(map: &BTreeMap<String, String>) -> DomainResult<String> {
    serde_json::to_string(map).map_err(|err| NetguardError::from(InfraError::from(err)))
}

fn map_sql_error(err: rusqlite::Error) -> NetguardError {
    NetguardError::from(InfraError::from(err))
}

fn map_join_error(err: task::JoinError) -> NetguardError {
    if err.is_cancelled() {
        NetguardError::Internal("offline store task cancelled".into())
    } else {
        NetguardError::Internal(format!("offline store task panic: {err}"))
    }
}

fn usize_to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn i64_to_usize(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}
