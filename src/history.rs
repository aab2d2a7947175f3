//! Durable log of terminal download outcomes.
//!
//! One row per attempt that reached `Completed`, `Error`, or `Cancelled`.
//! Inserts are atomic, reads never block each other (WAL), and every write
//! retries transient `SQLITE_BUSY`/`SQLITE_LOCKED` conditions with
//! exponential backoff before surfacing an error.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::{debug, instrument, warn};

use crate::db::Database;

/// Default page size for [`HistoryStore::list`].
const DEFAULT_LIST_LIMIT: usize = 200;

/// Upper bound on a single read, regardless of the requested limit.
const MAX_LIST_LIMIT: usize = 10_000;

/// Busy-retry schedule: 5 attempts, starting at 50 ms, doubling.
const BUSY_RETRY_ATTEMPTS: u32 = 5;
const BUSY_RETRY_BASE: Duration = Duration::from_millis(50);

/// Result type for history operations.
pub type Result<T> = std::result::Result<T, HistoryError>;

/// Errors from the history store.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// Underlying database failure (after busy retries were exhausted).
    #[error("history database error: {0}")]
    Database(#[from] sqlx::Error),

    /// No row with the given id.
    #[error("history entry {0} not found")]
    EntryNotFound(i64),

    /// Export serialization failed.
    #[error("history export error: {0}")]
    Export(#[from] serde_json::Error),
}

/// Terminal status recorded for an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    /// Download finished and the file is in place.
    Completed,
    /// Download failed after engine retries.
    Error,
    /// Download was cancelled cooperatively.
    Cancelled,
}

impl HistoryStatus {
    /// Returns the storage representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for HistoryStatus {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid history status: {value}")),
        }
    }
}

/// Insert payload for one terminal outcome.
#[derive(Debug, Clone)]
pub struct NewHistoryEntry<'a> {
    /// Requested URL.
    pub url: &'a str,
    /// Resolved media title when known.
    pub title: Option<&'a str>,
    /// Final saved path for completed attempts.
    pub output_path: Option<&'a str>,
    /// Terminal status.
    pub status: HistoryStatus,
    /// Saved size in bytes.
    pub size_bytes: Option<i64>,
    /// Media duration in seconds when known.
    pub duration_seconds: Option<i64>,
    /// Sanitized error text for failures.
    pub error: Option<&'a str>,
}

/// Read model for persisted rows.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Row id.
    pub id: i64,
    /// Requested URL.
    pub url: String,
    /// Media title when captured.
    pub title: Option<String>,
    /// Saved path for completed attempts.
    pub output_path: Option<String>,
    /// Stored status text.
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Saved size in bytes.
    pub size_bytes: Option<i64>,
    /// Media duration in seconds.
    pub duration_seconds: Option<i64>,
    /// Insertion timestamp (UTC, `datetime('now')`).
    pub timestamp: String,
    /// Error text for failures.
    pub error: Option<String>,
}

impl HistoryEntry {
    /// Returns the parsed status, defaulting to `Error` on bad data.
    #[must_use]
    pub fn status(&self) -> HistoryStatus {
        self.status_str.parse().unwrap_or(HistoryStatus::Error)
    }
}

/// Filters for [`HistoryStore::list`].
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Restrict to a status.
    pub status: Option<HistoryStatus>,
    /// Lower timestamp bound (inclusive).
    pub since: Option<String>,
    /// Upper timestamp bound (inclusive).
    pub until: Option<String>,
}

/// Which columns a search query matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchField {
    /// Match on the stored title.
    Title,
    /// Match on the URL.
    Url,
}

/// Aggregate counters for [`HistoryStore::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    /// Total rows.
    pub total: i64,
    /// Completed rows.
    pub completed: i64,
    /// Error rows.
    pub errors: i64,
    /// Cancelled rows.
    pub cancelled: i64,
    /// Sum of `size_bytes` over completed rows.
    pub total_bytes: i64,
}

/// Export formats supported by [`HistoryStore::export`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// JSON array of entries.
    Json,
    /// RFC 4180-ish CSV with a header row.
    Csv,
}

/// SQLite-backed history store.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    db: Database,
}

impl HistoryStore {
    /// Creates a store over an open database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts one terminal outcome, returning its row id.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] after busy retries are exhausted.
    #[instrument(skip(self, entry), fields(url = %entry.url, status = %entry.status))]
    pub async fn add(&self, entry: &NewHistoryEntry<'_>) -> Result<i64> {
        self.with_busy_retry(|| async {
            let row: (i64,) = sqlx::query_as(
                r"INSERT INTO history (url, title, output_path, status, size_bytes, duration_seconds, error)
                  VALUES (?, ?, ?, ?, ?, ?, ?)
                  RETURNING id",
            )
            .bind(entry.url)
            .bind(entry.title)
            .bind(entry.output_path)
            .bind(entry.status.as_str())
            .bind(entry.size_bytes)
            .bind(entry.duration_seconds)
            .bind(entry.error)
            .fetch_one(self.db.pool())
            .await?;
            Ok(row.0)
        })
        .await
    }

    /// Lists entries newest-first with paging and optional filters.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list(
        &self,
        limit: usize,
        offset: usize,
        filter: &HistoryFilter,
    ) -> Result<Vec<HistoryEntry>> {
        let limit = if limit == 0 {
            DEFAULT_LIST_LIMIT
        } else {
            limit.min(MAX_LIST_LIMIT)
        };

        let mut sql = String::from("SELECT * FROM history WHERE 1=1");
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.since.is_some() {
            sql.push_str(" AND timestamp >= ?");
        }
        if filter.until.is_some() {
            sql.push_str(" AND timestamp <= ?");
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query_as::<_, HistoryEntry>(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(since) = &filter.since {
            query = query.bind(since.clone());
        }
        if let Some(until) = &filter.until {
            query = query.bind(until.clone());
        }
        let entries = query
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(self.db.pool())
            .await?;

        Ok(entries)
    }

    /// Searches title/url with substring match, ranked by fuzzy similarity.
    ///
    /// The SQL side narrows candidates with `LIKE`; ranking uses
    /// Jaro-Winkler so near-matches sort above incidental substring hits.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn search(
        &self,
        query: &str,
        fields: &[SearchField],
        range: Option<(&str, &str)>,
    ) -> Result<Vec<HistoryEntry>> {
        let fields = if fields.is_empty() {
            &[SearchField::Title, SearchField::Url][..]
        } else {
            fields
        };

        let mut clauses = Vec::new();
        if fields.contains(&SearchField::Title) {
            clauses.push("title LIKE ? ESCAPE '\\'");
        }
        if fields.contains(&SearchField::Url) {
            clauses.push("url LIKE ? ESCAPE '\\'");
        }
        let mut sql = format!("SELECT * FROM history WHERE ({})", clauses.join(" OR "));
        if range.is_some() {
            sql.push_str(" AND timestamp >= ? AND timestamp <= ?");
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ?");

        let needle = format!("%{}%", escape_like(query));
        let mut q = sqlx::query_as::<_, HistoryEntry>(&sql);
        for _ in &clauses {
            q = q.bind(needle.clone());
        }
        if let Some((since, until)) = range {
            q = q.bind(since.to_string()).bind(until.to_string());
        }
        let mut entries = q
            .bind(MAX_LIST_LIMIT as i64)
            .fetch_all(self.db.pool())
            .await?;

        let query_lower = query.to_lowercase();
        entries.sort_by(|a, b| {
            let score_a = search_score(a, &query_lower);
            let score_b = search_score(b, &query_lower);
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(entries)
    }

    /// Deletes one entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::EntryNotFound`] when no row matched.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<()> {
        let result = self
            .with_busy_retry(|| async {
                Ok(sqlx::query("DELETE FROM history WHERE id = ?")
                    .bind(id)
                    .execute(self.db.pool())
                    .await?)
            })
            .await?;

        if result.rows_affected() == 0 {
            return Err(HistoryError::EntryNotFound(id));
        }
        Ok(())
    }

    /// Exports every entry in the requested format.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] or [`HistoryError::Export`].
    #[instrument(skip(self))]
    pub async fn export(&self, format: ExportFormat) -> Result<String> {
        let entries = sqlx::query_as::<_, HistoryEntry>(
            "SELECT * FROM history ORDER BY timestamp ASC, id ASC",
        )
        .fetch_all(self.db.pool())
        .await?;

        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&entries)?),
            ExportFormat::Csv => {
                let mut out = String::from(
                    "id,url,title,output_path,status,size_bytes,duration_seconds,timestamp,error\n",
                );
                for e in &entries {
                    out.push_str(&format!(
                        "{},{},{},{},{},{},{},{},{}\n",
                        e.id,
                        csv_field(&e.url),
                        csv_field(e.title.as_deref().unwrap_or("")),
                        csv_field(e.output_path.as_deref().unwrap_or("")),
                        e.status_str,
                        e.size_bytes.map_or(String::new(), |v| v.to_string()),
                        e.duration_seconds.map_or(String::new(), |v| v.to_string()),
                        csv_field(&e.timestamp),
                        csv_field(e.error.as_deref().unwrap_or("")),
                    ));
                }
                Ok(out)
            }
        }
    }

    /// Imports entries previously produced by a JSON export.
    ///
    /// Row ids are not preserved; the set of entries is.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Export`] on malformed input or
    /// [`HistoryError::Database`] on insert failure.
    #[instrument(skip(self, json))]
    pub async fn import_json(&self, json: &str) -> Result<usize> {
        let entries: Vec<HistoryEntry> = serde_json::from_str(json)?;
        let count = entries.len();
        for e in &entries {
            self.with_busy_retry(|| async {
                Ok(sqlx::query(
                    r"INSERT INTO history (url, title, output_path, status, size_bytes, duration_seconds, timestamp, error)
                      VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&e.url)
                .bind(&e.title)
                .bind(&e.output_path)
                .bind(&e.status_str)
                .bind(e.size_bytes)
                .bind(e.duration_seconds)
                .bind(&e.timestamp)
                .bind(&e.error)
                .execute(self.db.pool())
                .await?)
            })
            .await?;
        }
        Ok(count)
    }

    /// Returns aggregate counters.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn stats(&self) -> Result<HistoryStats> {
        let row: (i64, i64, i64, i64, Option<i64>) = sqlx::query_as(
            r"SELECT
                COUNT(*),
                COALESCE(SUM(status = 'completed'), 0),
                COALESCE(SUM(status = 'error'), 0),
                COALESCE(SUM(status = 'cancelled'), 0),
                SUM(CASE WHEN status = 'completed' THEN size_bytes ELSE 0 END)
              FROM history",
        )
        .fetch_one(self.db.pool())
        .await?;

        Ok(HistoryStats {
            total: row.0,
            completed: row.1,
            errors: row.2,
            cancelled: row.3,
            total_bytes: row.4.unwrap_or(0),
        })
    }

    /// Compacts the database file.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if VACUUM fails.
    #[instrument(skip(self))]
    pub async fn vacuum(&self) -> Result<()> {
        self.with_busy_retry(|| async {
            Ok(sqlx::query("VACUUM").execute(self.db.pool()).await?)
        })
        .await?;
        Ok(())
    }

    /// Runs `op`, retrying transient busy/locked failures with backoff.
    async fn with_busy_retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut delay = BUSY_RETRY_BASE;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(HistoryError::Database(e))
                    if is_busy(&e) && attempt < BUSY_RETRY_ATTEMPTS =>
                {
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "history write busy, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

fn is_busy(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            let code = db.code();
            matches!(code.as_deref(), Some("5" | "6" | "517"))
                || db.message().contains("database is locked")
        }
        _ => false,
    }
}

fn search_score(entry: &HistoryEntry, query_lower: &str) -> f64 {
    let title_score = entry
        .title
        .as_deref()
        .map(|t| strsim::jaro_winkler(&t.to_lowercase(), query_lower))
        .unwrap_or(0.0);
    let url_score = strsim::jaro_winkler(&entry.url.to_lowercase(), query_lower);
    title_score.max(url_score)
}

fn escape_like(value: &str) -> String {
    value.replace('%', "\\%").replace('_', "\\_")
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
