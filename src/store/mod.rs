//! Storage ports.
//!
//! The engine talks to the database only through [`IngestStore`] (pool-level
//! operations) and [`UploadTx`] (the single transaction an upload runs in).
//! [`PgStore`] is the PostgreSQL implementation.

mod pg;

pub use pg::{PgStore, PgUploadTx};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditFilter, NewAuditEntry};
use crate::schema::{TableDefinition, ValidatedRow};

/// Lifecycle of a committed upload. Only ever moves `Active -> RolledBack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Active,
    RolledBack,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected input row. Persisted for export, never dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRow {
    pub file_name: String,
    /// 1-indexed line in the source file.
    pub line: u64,
    pub reason: String,
    pub raw: Vec<String>,
}

impl FailedRow {
    pub fn new(file_name: &str, line: u64, reason: impl fmt::Display, raw: Vec<String>) -> Self {
        Self {
            file_name: file_name.to_string(),
            line,
            reason: format!("line {line}: {reason}"),
            raw,
        }
    }

    pub fn from_row(file_name: &str, row: &ValidatedRow, reason: impl fmt::Display) -> Self {
        Self::new(file_name, row.line, reason, row.raw.clone())
    }
}

/// Summary written once per committed upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewUploadRecord {
    pub id: Uuid,
    pub table_key: String,
    pub file_name: String,
    pub rows_total: u64,
    pub rows_inserted: u64,
    pub rows_skipped: u64,
    pub duration_ms: u64,
    pub checksum: u32,
    /// CSV header as read, for failed-row export.
    pub header: Vec<String>,
    pub uploaded_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadRecord {
    pub id: Uuid,
    pub table_key: String,
    pub file_name: String,
    pub rows_total: u64,
    pub rows_inserted: u64,
    pub rows_skipped: u64,
    pub duration_ms: u64,
    pub checksum: u32,
    pub header: Vec<String>,
    pub uploaded_by: Option<String>,
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl UploadRecord {
    pub fn from_new(new: NewUploadRecord, created_at: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            table_key: new.table_key,
            file_name: new.file_name,
            rows_total: new.rows_total,
            rows_inserted: new.rows_inserted,
            rows_skipped: new.rows_skipped,
            duration_ms: new.duration_ms,
            checksum: new.checksum,
            header: new.header,
            uploaded_by: new.uploaded_by,
            status: UploadStatus::Active,
            created_at,
            rolled_back_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// One open upload transaction.
///
/// Savepoint names are generated by the engine and are plain identifiers.
#[async_trait]
pub trait UploadTx: Send {
    async fn savepoint(&mut self, name: &str) -> Result<(), sqlx::Error>;

    async fn rollback_to(&mut self, name: &str) -> Result<(), sqlx::Error>;

    async fn release(&mut self, name: &str) -> Result<(), sqlx::Error>;

    async fn insert(&mut self, row: &ValidatedRow) -> Result<(), sqlx::Error>;

    fn supports_copy(&self) -> bool;

    async fn copy(&mut self, rows: &[ValidatedRow]) -> Result<u64, sqlx::Error>;

    async fn record_upload(&mut self, record: &NewUploadRecord) -> Result<(), sqlx::Error>;

    async fn record_failed_rows(&mut self, upload_id: Uuid, rows: &[FailedRow]) -> Result<(), sqlx::Error>;

    async fn commit(self: Box<Self>) -> Result<(), sqlx::Error>;

    async fn rollback(self: Box<Self>) -> Result<(), sqlx::Error>;
}

/// Pool-level persistence used outside an upload transaction.
#[async_trait]
pub trait IngestStore: Send + Sync {
    async fn begin_upload(
        &self,
        table: Arc<dyn TableDefinition>,
        upload_id: Uuid,
    ) -> Result<Box<dyn UploadTx>, sqlx::Error>;

    async fn find_upload(&self, upload_id: Uuid) -> Result<Option<UploadRecord>, sqlx::Error>;

    async fn list_uploads(&self, table_key: Option<&str>, limit: i64) -> Result<Vec<UploadRecord>, sqlx::Error>;

    async fn failed_rows(&self, upload_id: Uuid) -> Result<Vec<FailedRow>, sqlx::Error>;

    async fn delete_upload_rows(&self, table: &dyn TableDefinition, upload_id: Uuid) -> Result<u64, sqlx::Error>;

    /// Flip an active upload to rolled back. `false` if it was not active.
    async fn mark_rolled_back(&self, upload_id: Uuid) -> Result<bool, sqlx::Error>;

    async fn reset_table(&self, table: &dyn TableDefinition) -> Result<u64, sqlx::Error>;

    async fn insert_audit(&self, entry: &NewAuditEntry) -> Result<AuditEntry, sqlx::Error>;

    /// Filtered page, newest first. `filter.limit == None` returns everything.
    async fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, sqlx::Error>;

    async fn count_audit(&self, filter: &AuditFilter) -> Result<i64, sqlx::Error>;

    /// Keyset page in ascending id order, for streaming exports.
    async fn audit_page_after(
        &self,
        filter: &AuditFilter,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<AuditEntry>, sqlx::Error>;

    /// Move up to `limit` hot entries older than `cutoff` to the archive.
    async fn archive_audit_batch(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64, sqlx::Error>;

    /// Delete archived entries older than `cutoff`.
    async fn purge_audit_archive(&self, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error>;
}
