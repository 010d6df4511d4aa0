//! In-memory storage for integration tests.
//!
//! Rows written in an upload transaction are staged until commit; savepoints
//! snapshot the staged length so rollback-to discards exactly what came after.
//! Tables with unique key columns reject duplicates like a unique index would.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bulk_ingest::audit::NewAuditEntry;
use bulk_ingest::store::NewUploadRecord;
use bulk_ingest::{
    AuditEntry, AuditFilter, FailedRow, FieldSpec, IngestConfig, IngestStore, Ingestor, LogAuditParams,
    SqlTable, TableDefinition, TableRegistry, UploadRecord, UploadStatus, UploadTx, ValidatedRow,
};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

pub type RejectFn = Arc<dyn Fn(&ValidatedRow) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct StoredRow {
    pub upload_id: Uuid,
    pub row: ValidatedRow,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Vec<StoredRow>>,
    uploads: HashMap<Uuid, UploadRecord>,
    failed: HashMap<Uuid, Vec<FailedRow>>,
    audit: Vec<AuditEntry>,
    archive: Vec<AuditEntry>,
    next_audit_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    reject: Mutex<Option<RejectFn>>,
    pub fail_begin: AtomicBool,
    pub fail_commit: AtomicBool,
    pub fail_mark: AtomicBool,
    pub fail_archive: AtomicBool,
    pub fail_purge: AtomicBool,
    pub fail_audit: AtomicBool,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn injected(what: &str) -> sqlx::Error {
    sqlx::Error::Protocol(format!("injected {what} failure"))
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Rows for which `f` returns true fail to insert.
    pub fn reject_rows(&self, f: impl Fn(&ValidatedRow) -> bool + Send + Sync + 'static) {
        *self.reject.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        lock(&self.state).tables.get(table).cloned().unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.rows(table).len()
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        lock(&self.state).audit.clone()
    }

    pub fn archived_entries(&self) -> Vec<AuditEntry> {
        lock(&self.state).archive.clone()
    }

    pub fn upload_count(&self) -> usize {
        lock(&self.state).uploads.len()
    }

    /// Write a ledger entry with a chosen timestamp.
    pub fn seed_audit(&self, params: LogAuditParams, age: Duration) -> AuditEntry {
        let created_at = Utc::now() - chrono::Duration::from_std(age).unwrap();
        let mut state = lock(&self.state);
        state.next_audit_id += 1;
        let entry = AuditEntry::from_new(state.next_audit_id, params.into_entry(), created_at);
        state.audit.push(entry.clone());
        entry
    }
}

#[async_trait]
impl IngestStore for MemoryStore {
    async fn begin_upload(
        &self,
        table: Arc<dyn TableDefinition>,
        upload_id: Uuid,
    ) -> Result<Box<dyn UploadTx>, sqlx::Error> {
        if self.fail_begin.load(Ordering::SeqCst) {
            return Err(injected("begin"));
        }
        Ok(Box::new(MemoryTx {
            state: Arc::clone(&self.state),
            table,
            upload_id,
            staged: Vec::new(),
            savepoints: Vec::new(),
            record: None,
            failed: Vec::new(),
            reject: self.reject.lock().unwrap().clone(),
            fail_commit: self.fail_commit.load(Ordering::SeqCst),
        }))
    }

    async fn find_upload(&self, upload_id: Uuid) -> Result<Option<UploadRecord>, sqlx::Error> {
        Ok(lock(&self.state).uploads.get(&upload_id).cloned())
    }

    async fn list_uploads(&self, table_key: Option<&str>, limit: i64) -> Result<Vec<UploadRecord>, sqlx::Error> {
        let state = lock(&self.state);
        let mut records: Vec<UploadRecord> = state
            .uploads
            .values()
            .filter(|r| table_key.map_or(true, |k| r.table_key.eq_ignore_ascii_case(k)))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }

    async fn failed_rows(&self, upload_id: Uuid) -> Result<Vec<FailedRow>, sqlx::Error> {
        let mut rows = lock(&self.state).failed.get(&upload_id).cloned().unwrap_or_default();
        rows.sort_by_key(|r| r.line);
        Ok(rows)
    }

    async fn delete_upload_rows(&self, table: &dyn TableDefinition, upload_id: Uuid) -> Result<u64, sqlx::Error> {
        let mut state = lock(&self.state);
        let rows = state.tables.entry(table.key().to_string()).or_default();
        let before = rows.len();
        rows.retain(|r| r.upload_id != upload_id);
        Ok((before - rows.len()) as u64)
    }

    async fn mark_rolled_back(&self, upload_id: Uuid) -> Result<bool, sqlx::Error> {
        if self.fail_mark.load(Ordering::SeqCst) {
            return Err(injected("mark"));
        }
        let mut state = lock(&self.state);
        match state.uploads.get_mut(&upload_id) {
            Some(r) if r.status == UploadStatus::Active => {
                r.status = UploadStatus::RolledBack;
                r.rolled_back_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_table(&self, table: &dyn TableDefinition) -> Result<u64, sqlx::Error> {
        let mut state = lock(&self.state);
        let removed = state.tables.remove(table.key()).map_or(0, |rows| rows.len());
        Ok(removed as u64)
    }

    async fn insert_audit(&self, entry: &NewAuditEntry) -> Result<AuditEntry, sqlx::Error> {
        if self.fail_audit.load(Ordering::SeqCst) {
            return Err(injected("audit"));
        }
        let mut state = lock(&self.state);
        state.next_audit_id += 1;
        let stored = AuditEntry::from_new(state.next_audit_id, entry.clone(), Utc::now());
        state.audit.push(stored.clone());
        Ok(stored)
    }

    async fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, sqlx::Error> {
        let state = lock(&self.state);
        let mut entries: Vec<AuditEntry> = state.audit.iter().filter(|e| filter.matches(e)).cloned().collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.map_or(usize::MAX, |l| l.max(0) as usize);
        Ok(entries.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_audit(&self, filter: &AuditFilter) -> Result<i64, sqlx::Error> {
        Ok(lock(&self.state).audit.iter().filter(|e| filter.matches(e)).count() as i64)
    }

    async fn audit_page_after(
        &self,
        filter: &AuditFilter,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<AuditEntry>, sqlx::Error> {
        let state = lock(&self.state);
        let mut entries: Vec<AuditEntry> = state
            .audit
            .iter()
            .filter(|e| e.id > after_id && filter.matches(e))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.id);
        entries.truncate(limit.max(0) as usize);
        Ok(entries)
    }

    async fn archive_audit_batch(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64, sqlx::Error> {
        if self.fail_archive.load(Ordering::SeqCst) {
            return Err(injected("archive"));
        }
        let mut state = lock(&self.state);
        let mut ids: Vec<i64> = state
            .audit
            .iter()
            .filter(|e| e.created_at < cutoff)
            .map(|e| e.id)
            .collect();
        ids.sort_unstable();
        ids.truncate(limit.max(0) as usize);

        let (moved, kept): (Vec<AuditEntry>, Vec<AuditEntry>) =
            std::mem::take(&mut state.audit).into_iter().partition(|e| ids.contains(&e.id));
        state.audit = kept;
        let n = moved.len() as u64;
        state.archive.extend(moved);
        Ok(n)
    }

    async fn purge_audit_archive(&self, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        if self.fail_purge.load(Ordering::SeqCst) {
            return Err(injected("purge"));
        }
        let mut state = lock(&self.state);
        let before = state.archive.len();
        state.archive.retain(|e| e.created_at >= cutoff);
        Ok((before - state.archive.len()) as u64)
    }
}

pub struct MemoryTx {
    state: Arc<Mutex<State>>,
    table: Arc<dyn TableDefinition>,
    upload_id: Uuid,
    staged: Vec<ValidatedRow>,
    savepoints: Vec<(String, usize)>,
    record: Option<NewUploadRecord>,
    failed: Vec<FailedRow>,
    reject: Option<RejectFn>,
    fail_commit: bool,
}

impl MemoryTx {
    fn check(&self, row: &ValidatedRow, batch: &[ValidatedRow]) -> Result<(), sqlx::Error> {
        if self.reject.as_ref().is_some_and(|f| f(row)) {
            return Err(sqlx::Error::Protocol(format!("row rejected by constraint at line {}", row.line)));
        }
        let keys = self.table.unique_key_columns();
        if keys.is_empty() {
            return Ok(());
        }
        let same_key = |other: &ValidatedRow| keys.iter().all(|k| other.get(k) == row.get(k));
        let state = lock(&self.state);
        let committed = state
            .tables
            .get(self.table.key())
            .is_some_and(|rows| rows.iter().any(|r| same_key(&r.row)));
        if committed || self.staged.iter().any(same_key) || batch.iter().any(same_key) {
            return Err(sqlx::Error::Protocol(format!(
                "duplicate key value violates unique constraint ({})",
                keys.join(", ")
            )));
        }
        Ok(())
    }

    fn find(&self, name: &str) -> Result<usize, sqlx::Error> {
        self.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| sqlx::Error::Protocol(format!("savepoint {name} does not exist")))
    }
}

#[async_trait]
impl UploadTx for MemoryTx {
    async fn savepoint(&mut self, name: &str) -> Result<(), sqlx::Error> {
        self.savepoints.push((name.to_string(), self.staged.len()));
        Ok(())
    }

    async fn rollback_to(&mut self, name: &str) -> Result<(), sqlx::Error> {
        let pos = self.find(name)?;
        let mark = self.savepoints[pos].1;
        self.staged.truncate(mark);
        self.savepoints.truncate(pos + 1);
        Ok(())
    }

    async fn release(&mut self, name: &str) -> Result<(), sqlx::Error> {
        let pos = self.find(name)?;
        self.savepoints.truncate(pos);
        Ok(())
    }

    async fn insert(&mut self, row: &ValidatedRow) -> Result<(), sqlx::Error> {
        self.check(row, &[])?;
        self.staged.push(row.clone());
        Ok(())
    }

    fn supports_copy(&self) -> bool {
        self.table.supports_copy()
    }

    async fn copy(&mut self, rows: &[ValidatedRow]) -> Result<u64, sqlx::Error> {
        for (i, row) in rows.iter().enumerate() {
            self.check(row, &rows[..i])?;
        }
        self.staged.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn record_upload(&mut self, record: &NewUploadRecord) -> Result<(), sqlx::Error> {
        self.record = Some(record.clone());
        Ok(())
    }

    async fn record_failed_rows(&mut self, _upload_id: Uuid, rows: &[FailedRow]) -> Result<(), sqlx::Error> {
        self.failed.extend_from_slice(rows);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), sqlx::Error> {
        if self.fail_commit {
            return Err(injected("commit"));
        }
        let this = *self;
        let mut state = lock(&this.state);
        let upload_id = this.upload_id;
        state
            .tables
            .entry(this.table.key().to_string())
            .or_default()
            .extend(this.staged.into_iter().map(|row| StoredRow { upload_id, row }));
        if let Some(record) = this.record {
            state.uploads.insert(upload_id, UploadRecord::from_new(record, Utc::now()));
        }
        if !this.failed.is_empty() {
            state.failed.insert(upload_id, this.failed);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), sqlx::Error> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn vendor_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::text("Vendor").required(),
        FieldSpec::numeric("Amount").required(),
        FieldSpec::date("Due"),
        FieldSpec::one_of("Status", ["open", "paid"]),
    ]
}

/// `vendors`: unique on Vendor, bulk copy enabled.
pub fn vendors() -> Arc<dyn TableDefinition> {
    Arc::new(SqlTable::new("vendors", "vendors", vendor_fields()).unique_key(["Vendor"]))
}

/// `notes`: no copy, and a normalizer that panics on the text `PANIC`.
pub fn notes() -> Arc<dyn TableDefinition> {
    let fields = vec![FieldSpec::text("Note").required().normalize(|v| {
        if v == "PANIC" {
            panic!("normalizer exploded");
        }
        v.to_string()
    })];
    Arc::new(SqlTable::new("notes", "notes", fields).without_copy())
}

/// A table whose rows cannot be removed per upload.
pub struct AppendOnly {
    fields: Vec<FieldSpec>,
}

impl AppendOnly {
    pub fn new() -> Self {
        Self {
            fields: vec![FieldSpec::text("Entry").required()],
        }
    }
}

#[async_trait]
impl TableDefinition for AppendOnly {
    fn key(&self) -> &str {
        "ledger"
    }

    fn unique_key_columns(&self) -> &[String] {
        &[]
    }

    fn field_specs(&self) -> &[FieldSpec] {
        &self.fields
    }

    async fn insert(&self, _conn: &mut PgConnection, _upload_id: Uuid, _row: &ValidatedRow) -> Result<(), sqlx::Error> {
        Ok(())
    }

    async fn reset(&self, _pool: &PgPool) -> Result<u64, sqlx::Error> {
        Ok(0)
    }

    fn supports_upload_delete(&self) -> bool {
        false
    }

    async fn delete_by_upload_id(&self, _pool: &PgPool, _upload_id: Uuid) -> Result<u64, sqlx::Error> {
        Err(sqlx::Error::Protocol("ledger rows are permanent".into()))
    }
}

pub fn registry() -> TableRegistry {
    TableRegistry::new()
        .with(vendors())
        .with(notes())
        .with(Arc::new(AppendOnly::new()))
}

pub fn test_config() -> IngestConfig {
    IngestConfig {
        max_concurrent_uploads: 2,
        admission_wait: Duration::ZERO,
        batch_size: 4,
        cancel_check_rows: 1,
        progress_every_rows: 1,
        drain_poll_interval: Duration::from_millis(5),
        ..IngestConfig::default()
    }
}

pub fn ingestor(store: Arc<MemoryStore>) -> Ingestor {
    ingestor_with(test_config(), store)
}

pub fn ingestor_with(config: IngestConfig, store: Arc<MemoryStore>) -> Ingestor {
    Ingestor::new(config, registry(), store)
}
