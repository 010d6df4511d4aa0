//! PostgreSQL implementation of the storage ports.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{FailedRow, IngestStore, NewUploadRecord, UploadRecord, UploadStatus, UploadTx};
use crate::audit::{AuditAction, AuditEntry, AuditFilter, NewAuditEntry, Severity};
use crate::schema::{TableDefinition, ValidatedRow};
use crate::table::quote_ident;

// ---------------------------------------------------------------------------
// Column lists
// ---------------------------------------------------------------------------

const UPLOAD_COLUMNS: &str = "\
    id, table_key, file_name, rows_total, rows_inserted, rows_skipped, \
    duration_ms, checksum, header, uploaded_by, status, created_at, rolled_back_at";

/// Shared by `audit_log` and `audit_log_archive`.
const AUDIT_COLUMNS: &str = "\
    id, action, severity, table_key, user_name, ip_address, user_agent, \
    row_key, column_name, old_value, new_value, row_data, rows_affected, \
    upload_id, batch_id, related_entry_id, reason, created_at";

const AUDIT_INSERT_COLUMNS: &str = "\
    action, severity, table_key, user_name, ip_address, user_agent, \
    row_key, column_name, old_value, new_value, row_data, rows_affected, \
    upload_id, batch_id, related_entry_id, reason";

/// Rows per multi-row `INSERT` into `failed_rows` (5 binds each).
const FAILED_ROW_CHUNK: usize = 1000;

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_u64(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

fn decode_err(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct UploadRecordRow {
    id: Uuid,
    table_key: String,
    file_name: String,
    rows_total: i64,
    rows_inserted: i64,
    rows_skipped: i64,
    duration_ms: i64,
    checksum: i64,
    header: Vec<String>,
    uploaded_by: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    rolled_back_at: Option<DateTime<Utc>>,
}

impl TryFrom<UploadRecordRow> for UploadRecord {
    type Error = sqlx::Error;

    fn try_from(row: UploadRecordRow) -> Result<Self, Self::Error> {
        let status = UploadStatus::parse(&row.status)
            .ok_or_else(|| decode_err(format!("unknown upload status {:?}", row.status)))?;
        Ok(Self {
            id: row.id,
            table_key: row.table_key,
            file_name: row.file_name,
            rows_total: to_u64(row.rows_total),
            rows_inserted: to_u64(row.rows_inserted),
            rows_skipped: to_u64(row.rows_skipped),
            duration_ms: to_u64(row.duration_ms),
            checksum: u32::try_from(row.checksum).unwrap_or_default(),
            header: row.header,
            uploaded_by: row.uploaded_by,
            status,
            created_at: row.created_at,
            rolled_back_at: row.rolled_back_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct FailedRowRow {
    file_name: String,
    line: i64,
    reason: String,
    raw: Vec<String>,
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: i64,
    action: String,
    severity: String,
    table_key: String,
    user_name: Option<String>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    row_key: Option<String>,
    column_name: Option<String>,
    old_value: Option<String>,
    new_value: Option<String>,
    row_data: Option<serde_json::Value>,
    rows_affected: Option<i64>,
    upload_id: Option<Uuid>,
    batch_id: Option<Uuid>,
    related_entry_id: Option<i64>,
    reason: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = sqlx::Error;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let action = AuditAction::parse(&row.action)
            .ok_or_else(|| decode_err(format!("unknown audit action {:?}", row.action)))?;
        let severity = Severity::parse(&row.severity)
            .ok_or_else(|| decode_err(format!("unknown severity {:?}", row.severity)))?;
        Ok(Self {
            id: row.id,
            action,
            severity,
            table_key: row.table_key,
            user: row.user_name,
            ip: row.ip_address,
            user_agent: row.user_agent,
            row_key: row.row_key,
            column_name: row.column_name,
            old_value: row.old_value,
            new_value: row.new_value,
            row_data: row.row_data,
            rows_affected: row.rows_affected,
            upload_id: row.upload_id,
            batch_id: row.batch_id,
            related_entry_id: row.related_entry_id,
            reason: row.reason,
            created_at: row.created_at,
        })
    }
}

fn into_entries(rows: Vec<AuditRow>) -> Result<Vec<AuditEntry>, sqlx::Error> {
    rows.into_iter().map(AuditEntry::try_from).collect()
}

// ---------------------------------------------------------------------------
// PgStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        Ok(Self::new(PgPool::connect(database_url).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

#[async_trait]
impl IngestStore for PgStore {
    async fn begin_upload(
        &self,
        table: Arc<dyn TableDefinition>,
        upload_id: Uuid,
    ) -> Result<Box<dyn UploadTx>, sqlx::Error> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUploadTx {
            tx,
            table,
            upload_id,
        }))
    }

    async fn find_upload(&self, upload_id: Uuid) -> Result<Option<UploadRecord>, sqlx::Error> {
        let query = format!("SELECT {UPLOAD_COLUMNS} FROM upload_records WHERE id = $1");
        sqlx::query_as::<_, UploadRecordRow>(&query)
            .bind(upload_id)
            .fetch_optional(&self.pool)
            .await?
            .map(UploadRecord::try_from)
            .transpose()
    }

    async fn list_uploads(&self, table_key: Option<&str>, limit: i64) -> Result<Vec<UploadRecord>, sqlx::Error> {
        let rows = match table_key {
            Some(key) => {
                let query = format!(
                    "SELECT {UPLOAD_COLUMNS} FROM upload_records \
                     WHERE lower(table_key) = lower($1) \
                     ORDER BY created_at DESC LIMIT $2"
                );
                sqlx::query_as::<_, UploadRecordRow>(&query)
                    .bind(key)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!(
                    "SELECT {UPLOAD_COLUMNS} FROM upload_records ORDER BY created_at DESC LIMIT $1"
                );
                sqlx::query_as::<_, UploadRecordRow>(&query)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(UploadRecord::try_from).collect()
    }

    async fn failed_rows(&self, upload_id: Uuid) -> Result<Vec<FailedRow>, sqlx::Error> {
        let rows = sqlx::query_as::<_, FailedRowRow>(
            "SELECT file_name, line, reason, raw FROM failed_rows \
             WHERE upload_id = $1 ORDER BY line, id",
        )
        .bind(upload_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| FailedRow {
                file_name: r.file_name,
                line: to_u64(r.line),
                reason: r.reason,
                raw: r.raw,
            })
            .collect())
    }

    async fn delete_upload_rows(&self, table: &dyn TableDefinition, upload_id: Uuid) -> Result<u64, sqlx::Error> {
        table.delete_by_upload_id(&self.pool, upload_id).await
    }

    async fn mark_rolled_back(&self, upload_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE upload_records SET status = 'rolled_back', rolled_back_at = now() \
             WHERE id = $1 AND status = 'active'",
        )
        .bind(upload_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_table(&self, table: &dyn TableDefinition) -> Result<u64, sqlx::Error> {
        table.reset(&self.pool).await
    }

    async fn insert_audit(&self, entry: &NewAuditEntry) -> Result<AuditEntry, sqlx::Error> {
        let p = &entry.params;
        let query = format!(
            "INSERT INTO audit_log ({AUDIT_INSERT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
             RETURNING {AUDIT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, AuditRow>(&query)
            .bind(p.action.as_str())
            .bind(entry.severity.as_str())
            .bind(&p.table_key)
            .bind(&p.actor.user)
            .bind(&p.actor.ip)
            .bind(&p.actor.user_agent)
            .bind(&p.row_key)
            .bind(&p.column_name)
            .bind(&p.old_value)
            .bind(&p.new_value)
            .bind(&p.row_data)
            .bind(p.rows_affected)
            .bind(p.upload_id)
            .bind(p.batch_id)
            .bind(p.related_entry_id)
            .bind(&p.reason)
            .fetch_one(&self.pool)
            .await?;
        AuditEntry::try_from(row)
    }

    async fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, sqlx::Error> {
        let (conditions, bind_values, mut bind_idx) = build_audit_filter(filter);
        let mut query = format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_log {} ORDER BY created_at DESC, id DESC",
            where_clause(&conditions)
        );
        if filter.limit.is_some() {
            query.push_str(&format!(" LIMIT ${bind_idx}"));
            bind_idx += 1;
        }
        if filter.offset.is_some() {
            query.push_str(&format!(" OFFSET ${bind_idx}"));
        }

        let mut q = bind_audit_values(sqlx::query_as::<_, AuditRow>(&query), &bind_values);
        if let Some(limit) = filter.limit {
            q = q.bind(limit);
        }
        if let Some(offset) = filter.offset {
            q = q.bind(offset);
        }
        into_entries(q.fetch_all(&self.pool).await?)
    }

    async fn count_audit(&self, filter: &AuditFilter) -> Result<i64, sqlx::Error> {
        let (conditions, bind_values, _) = build_audit_filter(filter);
        let query = format!(
            "SELECT COUNT(*)::BIGINT AS count FROM audit_log {}",
            where_clause(&conditions)
        );
        bind_audit_values_scalar(sqlx::query_scalar::<_, i64>(&query), &bind_values)
            .fetch_one(&self.pool)
            .await
    }

    async fn audit_page_after(
        &self,
        filter: &AuditFilter,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<AuditEntry>, sqlx::Error> {
        let (mut conditions, bind_values, bind_idx) = build_audit_filter(filter);
        conditions.push(format!("id > ${bind_idx}"));
        let query = format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_log {} ORDER BY id ASC LIMIT ${}",
            where_clause(&conditions),
            bind_idx + 1
        );
        let q = bind_audit_values(sqlx::query_as::<_, AuditRow>(&query), &bind_values);
        into_entries(q.bind(after_id).bind(limit).fetch_all(&self.pool).await?)
    }

    async fn archive_audit_batch(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64, sqlx::Error> {
        let query = format!(
            "WITH moved AS ( \
                 DELETE FROM audit_log WHERE id IN ( \
                     SELECT id FROM audit_log WHERE created_at < $1 \
                     ORDER BY id LIMIT $2 FOR UPDATE SKIP LOCKED \
                 ) RETURNING {AUDIT_COLUMNS} \
             ) \
             INSERT INTO audit_log_archive ({AUDIT_COLUMNS}) \
             SELECT {AUDIT_COLUMNS} FROM moved"
        );
        let result = sqlx::query(&query)
            .bind(cutoff)
            .bind(limit)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_audit_archive(&self, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM audit_log_archive WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// PgUploadTx
// ---------------------------------------------------------------------------

/// The transaction one upload runs in.
pub struct PgUploadTx {
    tx: Transaction<'static, Postgres>,
    table: Arc<dyn TableDefinition>,
    upload_id: Uuid,
}

impl PgUploadTx {
    async fn exec(&mut self, sql: &str) -> Result<(), sqlx::Error> {
        sqlx::query(sql).execute(&mut *self.tx).await?;
        Ok(())
    }
}

#[async_trait]
impl UploadTx for PgUploadTx {
    async fn savepoint(&mut self, name: &str) -> Result<(), sqlx::Error> {
        self.exec(&format!("SAVEPOINT {}", quote_ident(name))).await
    }

    async fn rollback_to(&mut self, name: &str) -> Result<(), sqlx::Error> {
        self.exec(&format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name)))
            .await
    }

    async fn release(&mut self, name: &str) -> Result<(), sqlx::Error> {
        self.exec(&format!("RELEASE SAVEPOINT {}", quote_ident(name)))
            .await
    }

    async fn insert(&mut self, row: &ValidatedRow) -> Result<(), sqlx::Error> {
        self.table.insert(&mut *self.tx, self.upload_id, row).await
    }

    fn supports_copy(&self) -> bool {
        self.table.supports_copy()
    }

    async fn copy(&mut self, rows: &[ValidatedRow]) -> Result<u64, sqlx::Error> {
        self.table.copy(&mut *self.tx, self.upload_id, rows).await
    }

    async fn record_upload(&mut self, record: &NewUploadRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO upload_records \
             (id, table_key, file_name, rows_total, rows_inserted, rows_skipped, \
              duration_ms, checksum, header, uploaded_by) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(record.id)
        .bind(&record.table_key)
        .bind(&record.file_name)
        .bind(to_i64(record.rows_total))
        .bind(to_i64(record.rows_inserted))
        .bind(to_i64(record.rows_skipped))
        .bind(to_i64(record.duration_ms))
        .bind(i64::from(record.checksum))
        .bind(&record.header)
        .bind(&record.uploaded_by)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn record_failed_rows(&mut self, upload_id: Uuid, rows: &[FailedRow]) -> Result<(), sqlx::Error> {
        for chunk in rows.chunks(FAILED_ROW_CHUNK) {
            let mut query =
                String::from("INSERT INTO failed_rows (upload_id, file_name, line, reason, raw) VALUES ");
            let mut param_idx = 1u32;
            for (i, _) in chunk.iter().enumerate() {
                if i > 0 {
                    query.push_str(", ");
                }
                query.push('(');
                for col in 0..5 {
                    if col > 0 {
                        query.push_str(", ");
                    }
                    query.push_str(&format!("${param_idx}"));
                    param_idx += 1;
                }
                query.push(')');
            }

            let mut q = sqlx::query(&query);
            for row in chunk {
                q = q
                    .bind(upload_id)
                    .bind(&row.file_name)
                    .bind(to_i64(row.line))
                    .bind(&row.reason)
                    .bind(&row.raw);
            }
            q.execute(&mut *self.tx).await?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), sqlx::Error> {
        self.tx.rollback().await
    }
}

// ---------------------------------------------------------------------------
// Filter helpers
// ---------------------------------------------------------------------------

enum BindValue {
    Text(String),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
}

/// Build `WHERE` conditions for an audit filter.
///
/// Returns the conditions, their bind values and the next free placeholder.
fn build_audit_filter(filter: &AuditFilter) -> (Vec<String>, Vec<BindValue>, u32) {
    let mut conditions: Vec<String> = Vec::new();
    let mut bind_idx = 1u32;
    let mut bind_values: Vec<BindValue> = Vec::new();

    if let Some(action) = filter.action {
        conditions.push(format!("action = ${bind_idx}"));
        bind_idx += 1;
        bind_values.push(BindValue::Text(action.as_str().to_string()));
    }

    if let Some(severity) = filter.severity {
        conditions.push(format!("severity = ${bind_idx}"));
        bind_idx += 1;
        bind_values.push(BindValue::Text(severity.as_str().to_string()));
    }

    if let Some(ref table_key) = filter.table_key {
        conditions.push(format!("lower(table_key) = lower(${bind_idx})"));
        bind_idx += 1;
        bind_values.push(BindValue::Text(table_key.clone()));
    }

    if let Some(upload_id) = filter.upload_id {
        conditions.push(format!("upload_id = ${bind_idx}"));
        bind_idx += 1;
        bind_values.push(BindValue::Uuid(upload_id));
    }

    if let Some(ref user) = filter.user {
        conditions.push(format!("user_name = ${bind_idx}"));
        bind_idx += 1;
        bind_values.push(BindValue::Text(user.clone()));
    }

    if let Some(from) = filter.from {
        conditions.push(format!("created_at >= ${bind_idx}"));
        bind_idx += 1;
        bind_values.push(BindValue::Timestamp(from));
    }

    if let Some(to) = filter.to {
        conditions.push(format!("created_at <= ${bind_idx}"));
        bind_idx += 1;
        bind_values.push(BindValue::Timestamp(to));
    }

    if let Some(ref search_text) = filter.search_text {
        conditions.push(format!(
            "concat_ws(' ', action, table_key, user_name, row_key, column_name, \
             old_value, new_value, reason, row_data::text) ILIKE ${bind_idx}"
        ));
        bind_idx += 1;
        bind_values.push(BindValue::Text(format!("%{search_text}%")));
    }

    (conditions, bind_values, bind_idx)
}

fn where_clause(conditions: &[String]) -> String {
    if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    }
}

fn bind_audit_values<'q, O>(
    mut q: sqlx::query::QueryAs<'q, Postgres, O, sqlx::postgres::PgArguments>,
    bind_values: &'q [BindValue],
) -> sqlx::query::QueryAs<'q, Postgres, O, sqlx::postgres::PgArguments> {
    for val in bind_values {
        match val {
            BindValue::Text(v) => q = q.bind(v.as_str()),
            BindValue::Uuid(v) => q = q.bind(*v),
            BindValue::Timestamp(v) => q = q.bind(*v),
        }
    }
    q
}

fn bind_audit_values_scalar<'q>(
    mut q: sqlx::query::QueryScalar<'q, Postgres, i64, sqlx::postgres::PgArguments>,
    bind_values: &'q [BindValue],
) -> sqlx::query::QueryScalar<'q, Postgres, i64, sqlx::postgres::PgArguments> {
    for val in bind_values {
        match val {
            BindValue::Text(v) => q = q.bind(v.as_str()),
            BindValue::Uuid(v) => q = q.bind(*v),
            BindValue::Timestamp(v) => q = q.bind(*v),
        }
    }
    q
}
