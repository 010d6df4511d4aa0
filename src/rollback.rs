//! Reversal of a committed upload.

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{Actor, AuditAction, LogAuditParams};
use crate::schema::TableRegistry;
use crate::store::{IngestStore, UploadStatus};
use crate::{IngestError, IngestResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    RolledBack,
    /// Nothing was done; the upload had been rolled back before.
    AlreadyRolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackResult {
    pub upload_id: Uuid,
    pub table_key: String,
    pub rows_deleted: u64,
    pub status: RollbackStatus,
    /// Set when rows were removed but the record or ledger could not be updated.
    pub warning: Option<String>,
}

/// Delete every row an upload wrote, then mark it rolled back and log it.
///
/// Deletion and marking are sequential, not atomic: once the rows are gone the
/// call succeeds even if the bookkeeping after it fails, and the failure is
/// reported through [`RollbackResult::warning`].
pub async fn rollback_upload(
    store: &dyn IngestStore,
    registry: &TableRegistry,
    upload_id: Uuid,
    actor: &Actor,
) -> IngestResult<RollbackResult> {
    let record = store
        .find_upload(upload_id)
        .await?
        .ok_or(IngestError::UploadNotFound(upload_id))?;

    if record.status == UploadStatus::RolledBack {
        info!(upload_id = %upload_id, table = %record.table_key, "upload already rolled back");
        return Ok(RollbackResult {
            upload_id,
            table_key: record.table_key,
            rows_deleted: 0,
            status: RollbackStatus::AlreadyRolledBack,
            warning: None,
        });
    }

    let table = registry
        .get(&record.table_key)
        .ok_or_else(|| IngestError::UnknownTable(record.table_key.clone()))?;
    if !table.supports_upload_delete() {
        return Err(IngestError::RollbackUnsupported(record.table_key));
    }

    let rows_deleted = store.delete_upload_rows(table.as_ref(), upload_id).await?;
    info!(upload_id = %upload_id, table = %record.table_key, rows_deleted, "upload rows deleted");

    let mut warnings = Vec::new();
    match store.mark_rolled_back(upload_id).await {
        Ok(true) => {}
        Ok(false) => warnings.push("upload record was no longer active".to_string()),
        Err(e) => {
            warn!(upload_id = %upload_id, error = %e, "rows deleted but upload record not marked");
            warnings.push(format!("rows deleted but upload record not marked: {e}"));
        }
    }

    let entry = LogAuditParams::new(AuditAction::Rollback, &record.table_key)
        .with_actor(actor)
        .with_upload(upload_id)
        .with_rows_affected(rows_deleted)
        .with_row(serde_json::json!({
            "file_name": record.file_name,
            "rows_inserted": record.rows_inserted,
        }))
        .into_entry();
    if let Err(e) = store.insert_audit(&entry).await {
        warn!(upload_id = %upload_id, error = %e, "rollback not written to audit log");
        warnings.push(format!("rollback not written to audit log: {e}"));
    }

    Ok(RollbackResult {
        upload_id,
        table_key: record.table_key,
        rows_deleted,
        status: RollbackStatus::RolledBack,
        warning: (!warnings.is_empty()).then(|| warnings.join("; ")),
    })
}
