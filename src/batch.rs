//! Three-tier batch insertion inside one upload transaction.
//!
//! A full batch is first bulk-copied under a savepoint. If that fails (or the
//! table cannot copy), every row is inserted under a single batch savepoint.
//! If any of those inserts fails the batch is rolled back and replayed one row
//! at a time, each under its own savepoint, so that only the bad rows are
//! dropped. Savepoint bookkeeping errors mean the connection is unusable and
//! end the upload.

use std::mem;

use serde::Serialize;
use tracing::{debug, warn};

use crate::store::{FailedRow, UploadTx};
use crate::schema::ValidatedRow;
use crate::{IngestError, IngestResult};

pub const DEFAULT_BATCH_SIZE: usize = 500;

/// The path that finally wrote a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertTier {
    Copy,
    SavepointBatch,
    RowByRow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub inserted: u64,
    pub failed: Vec<FailedRow>,
    pub tier: InsertTier,
}

impl BatchOutcome {
    fn empty() -> Self {
        Self {
            inserted: 0,
            failed: Vec::new(),
            tier: InsertTier::SavepointBatch,
        }
    }
}

/// Accumulates validated rows and writes them in fixed-size batches.
pub struct BatchInserter {
    file_name: String,
    batch_size: usize,
    pending: Vec<ValidatedRow>,
    seq: u64,
}

impl BatchInserter {
    pub fn new(file_name: impl Into<String>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            file_name: file_name.into(),
            batch_size,
            pending: Vec::with_capacity(batch_size),
            seq: 0,
        }
    }

    /// Queue a row. Returns `true` once the batch is full and should be flushed.
    pub fn push(&mut self, row: ValidatedRow) -> bool {
        self.pending.push(row);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.batch_size
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Write every pending row. Row failures come back in
    /// [`BatchOutcome::failed`]; only transaction-level errors are returned
    /// as `Err`.
    pub async fn flush(&mut self, tx: &mut dyn UploadTx) -> IngestResult<BatchOutcome> {
        let rows = mem::take(&mut self.pending);
        if rows.is_empty() {
            return Ok(BatchOutcome::empty());
        }
        let first_line = rows.first().map_or(0, |r| r.line);

        if tx.supports_copy() {
            let sp = self.next_savepoint("copy");
            tx.savepoint(&sp).await.map_err(IngestError::transaction("savepoint"))?;
            match tx.copy(&rows).await {
                Ok(_) => {
                    tx.release(&sp).await.map_err(IngestError::transaction("release"))?;
                    debug!(rows = rows.len(), first_line, "batch copied");
                    return Ok(BatchOutcome {
                        inserted: rows.len() as u64,
                        failed: Vec::new(),
                        tier: InsertTier::Copy,
                    });
                }
                Err(e) => {
                    warn!(error = %e, rows = rows.len(), first_line, "bulk copy failed, falling back to savepoint batch");
                    self.unwind(tx, &sp).await?;
                }
            }
        }

        let sp = self.next_savepoint("batch");
        tx.savepoint(&sp).await.map_err(IngestError::transaction("savepoint"))?;
        let mut first_error = None;
        for row in &rows {
            if let Err(e) = tx.insert(row).await {
                first_error = Some((row.line, e));
                break;
            }
        }
        match first_error {
            None => {
                tx.release(&sp).await.map_err(IngestError::transaction("release"))?;
                debug!(rows = rows.len(), first_line, "batch inserted");
                return Ok(BatchOutcome {
                    inserted: rows.len() as u64,
                    failed: Vec::new(),
                    tier: InsertTier::SavepointBatch,
                });
            }
            Some((line, e)) => {
                warn!(error = %e, line, rows = rows.len(), first_line, "batch insert failed, retrying row by row");
                self.unwind(tx, &sp).await?;
            }
        }

        let mut outcome = BatchOutcome {
            inserted: 0,
            failed: Vec::new(),
            tier: InsertTier::RowByRow,
        };
        for row in &rows {
            let sp = self.next_savepoint("row");
            tx.savepoint(&sp).await.map_err(IngestError::transaction("savepoint"))?;
            match tx.insert(row).await {
                Ok(()) => {
                    tx.release(&sp).await.map_err(IngestError::transaction("release"))?;
                    outcome.inserted += 1;
                }
                Err(e) => {
                    self.unwind(tx, &sp).await?;
                    outcome.failed.push(FailedRow::from_row(&self.file_name, row, e));
                }
            }
        }
        debug!(
            inserted = outcome.inserted,
            failed = outcome.failed.len(),
            first_line,
            "batch inserted row by row"
        );
        Ok(outcome)
    }

    /// Roll back to `sp` and drop it.
    async fn unwind(&self, tx: &mut dyn UploadTx, sp: &str) -> IngestResult<()> {
        tx.rollback_to(sp)
            .await
            .map_err(IngestError::transaction("rollback to savepoint"))?;
        tx.release(sp).await.map_err(IngestError::transaction("release"))
    }

    fn next_savepoint(&mut self, kind: &str) -> String {
        self.seq += 1;
        format!("ingest_{kind}_{}", self.seq)
    }
}
