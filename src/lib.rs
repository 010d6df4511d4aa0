//! Bulk CSV ingestion into PostgreSQL with a reversible audit trail.
//!
//! - Reader stack: byte counting, gzip/zstd, BOM removal, streaming UTF-8 repair.
//! - Header detection within a bounded window, or explicit column positions.
//! - Row validation and type coercion driven by [`FieldSpec`]s.
//! - Batched inserts in one transaction: bulk copy, then a savepoint per
//!   batch, then a savepoint per row, so a bad row never sinks the upload.
//! - Bounded upload concurrency with drain on shutdown, live progress
//!   fan-out and cooperative cancellation.
//! - Append-only audit ledger with hot/cold archival, and rollback of any
//!   upload by id.
//!
//! Entry point: [`Ingestor`].
#![cfg_attr(docsrs, feature(doc_cfg))]
//
pub mod archive;
pub mod audit;
mod batch;
mod codec;
pub mod coerce;
pub mod config;
pub mod header;
mod ingest;
pub mod io;
pub mod limiter;
pub mod progress;
pub mod rollback;
pub mod schema;
mod session;
pub mod store;
pub mod table;
pub mod validate;

pub use crate::audit::{Actor, AuditAction, AuditEntry, AuditFilter, LogAuditParams, Severity};
pub use crate::batch::{BatchInserter, BatchOutcome, InsertTier};
pub use crate::codec::{Transcoder, Utf8Sanitizer, PLACEHOLDER};
pub use crate::config::{ArchivePolicy, IngestConfig};
pub use crate::header::{ColumnMapping, HeaderIndex};
pub use crate::ingest::{preview_csv, Ingestor, PreviewOptions, PreviewReport, RowDiagnostics, UploadRequest};
pub use crate::io::{build_csv_reader, reader_from_path, CsvMeta, LineTracker, ReadStats};
pub use crate::limiter::{LimiterStatus, UploadLimiter};
pub use crate::progress::{Phase, Progress};
pub use crate::rollback::{RollbackResult, RollbackStatus};
pub use crate::schema::{CellValue, FieldSpec, FieldType, TableDefinition, TableRegistry, ValidatedRow};
pub use crate::session::UploadResult;
pub use crate::store::{FailedRow, IngestStore, PgStore, UploadRecord, UploadStatus, UploadTx};
pub use crate::table::SqlTable;
pub use crate::validate::{RowError, RowValidator};

use thiserror::Error;
use uuid::Uuid;

/// Error type returned by this crate when not using `anyhow`.
#[derive(Debug, Error)]
pub enum IngestError {
    /// No admission slot freed up within the wait window. Retryable.
    #[error("too many concurrent uploads, try again shortly")]
    TooManyUploads,
    #[error("cancelled")]
    Cancelled,
    #[error("upload {0} not found")]
    UploadNotFound(Uuid),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error(
        "could not find a header row in the first {lookahead} rows; expected columns: {}",
        expected.join(", ")
    )]
    HeaderNotFound {
        expected: Vec<String>,
        lookahead: usize,
    },
    #[error("file contains no rows")]
    EmptyFile,
    #[error("table {0} does not support rollback")]
    RollbackUnsupported(String),
    /// Begin, commit or savepoint failure. Fatal for the whole upload.
    #[error("transaction failed during {stage}: {source}")]
    Transaction {
        stage: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("upload processing panicked: {0}")]
    Panicked(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv_async::Error),
}

impl IngestError {
    pub(crate) fn transaction(stage: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::Transaction { stage, source }
    }

    /// Whether the caller may simply retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TooManyUploads)
    }
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;
