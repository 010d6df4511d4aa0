//! The upload engine: admission, per-upload tasks, and the read, validate,
//! insert pipeline that runs inside them.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::{FutureExt, Stream, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::archive;
use crate::audit::{Actor, AuditAction, AuditEntry, AuditFilter, LogAuditParams, MAX_PAGE_SIZE};
use crate::batch::BatchInserter;
use crate::config::IngestConfig;
use crate::header::{header_matches, ColumnMapping, HeaderIndex};
use crate::io::{build_csv_reader, estimate_rows, CsvMeta, LineTracker, ReadStats};
use crate::limiter::{LimiterStatus, UploadLimiter};
use crate::progress::{Phase, Progress};
use crate::rollback::{self, RollbackResult};
use crate::schema::{required_columns, FieldSpec, TableDefinition, TableRegistry};
use crate::session::{SessionTable, UploadResult, UploadSession};
use crate::store::{FailedRow, IngestStore, NewUploadRecord, UploadRecord, UploadTx};
use crate::validate::RowValidator;
use crate::{IngestError, IngestResult};

/// Entries fetched per round trip when streaming the ledger.
const AUDIT_STREAM_PAGE: i64 = 500;

// ---------------------------------------------------------------------------
// Requests and reports
// ---------------------------------------------------------------------------

/// Everything about an upload except its bytes.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub table: String,
    pub file_name: String,
    pub mapping: Option<ColumnMapping>,
    pub actor: Actor,
    /// Caller lifetime (request, connection). Cancelling it cancels the upload.
    pub cancel: CancellationToken,
    pub meta: CsvMeta,
}

impl UploadRequest {
    pub fn new(table: impl Into<String>, file_name: impl Into<String>) -> Self {
        let file_name = file_name.into();
        Self {
            table: table.into(),
            meta: CsvMeta::for_file(file_name.clone(), None),
            file_name,
            mapping: None,
            actor: Actor::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_mapping(mut self, mapping: ColumnMapping) -> Self {
        self.mapping = Some(mapping);
        self
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Content type and encoding as sent by the client, for decompression.
    pub fn with_content(mut self, content_type: impl Into<String>, content_encoding: impl Into<String>) -> Self {
        self.meta.content_type = content_type.into();
        self.meta.content_encoding = content_encoding.into();
        self
    }

    pub fn with_charset(mut self, charset: &'static encoding_rs::Encoding) -> Self {
        self.meta.charset = charset;
        self
    }
}

/// Every problem found in one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowDiagnostics {
    pub line: u64,
    pub errors: Vec<String>,
    pub raw: Vec<String>,
}

/// Dry-run validation of the head of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewReport {
    pub header_line: u64,
    pub header: Vec<String>,
    pub rows_checked: u64,
    pub valid_rows: u64,
    pub invalid_rows: Vec<RowDiagnostics>,
    pub bytes_read: u64,
}

#[derive(Debug, Clone)]
pub struct PreviewOptions {
    pub mapping: Option<ColumnMapping>,
    pub header_lookahead: usize,
    pub date_pivot: i32,
    /// Stop after this many data rows; `None` reads the whole file.
    pub max_rows: Option<u64>,
}

impl Default for PreviewOptions {
    fn default() -> Self {
        let config = IngestConfig::default();
        Self {
            mapping: None,
            header_lookahead: config.header_lookahead,
            date_pivot: config.date_pivot,
            max_rows: Some(1000),
        }
    }
}

// ---------------------------------------------------------------------------
// Ingestor
// ---------------------------------------------------------------------------

struct Inner {
    config: IngestConfig,
    registry: TableRegistry,
    store: Arc<dyn IngestStore>,
    limiter: UploadLimiter,
    sessions: SessionTable,
}

/// Entry point for uploads, rollback and the audit ledger. Cheap to clone.
#[derive(Clone)]
pub struct Ingestor {
    inner: Arc<Inner>,
}

impl Ingestor {
    pub fn new(config: IngestConfig, registry: TableRegistry, store: Arc<dyn IngestStore>) -> Self {
        let limiter = UploadLimiter::new(config.max_concurrent_uploads, config.admission_wait);
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                store,
                limiter,
                sessions: SessionTable::default(),
            }),
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &TableRegistry {
        &self.inner.registry
    }

    // ---- uploads ----------------------------------------------------------

    /// Start an upload from an in-memory file. Returns once admitted.
    pub async fn start_upload(&self, req: UploadRequest, bytes: Bytes) -> IngestResult<Uuid> {
        let size = bytes.len() as u64;
        let total_rows = estimate_rows(&bytes);
        let reader = std::io::Cursor::new(bytes);
        self.launch(req, Box::new(reader), Some(size), Some(total_rows))
            .await
    }

    /// Start an upload from a byte stream of optionally known size.
    pub async fn start_upload_streaming<R>(&self, req: UploadRequest, reader: R, size: Option<u64>) -> IngestResult<Uuid>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.launch(req, Box::new(reader), size, None).await
    }

    async fn launch(
        &self,
        mut req: UploadRequest,
        reader: Box<dyn AsyncRead + Unpin + Send>,
        size: Option<u64>,
        total_rows: Option<u64>,
    ) -> IngestResult<Uuid> {
        let inner = &self.inner;
        let table = inner
            .registry
            .get(&req.table)
            .ok_or_else(|| IngestError::UnknownTable(req.table.clone()))?;

        let permit = match inner.limiter.acquire(&req.cancel).await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(table = %req.table, file = %req.file_name, error = %e, "upload not admitted");
                return Err(e);
            }
        };

        let id = Uuid::now_v7();
        req.meta.size_hint = size.or(req.meta.size_hint);
        let session = Arc::new(UploadSession::new(
            id,
            table.key().to_string(),
            req.file_name.clone(),
            req.cancel.child_token(),
            req.mapping.take(),
            Progress {
                total_rows,
                total_bytes: req.meta.size_hint,
                ..Default::default()
            },
            inner.config.subscriber_buffer,
        ));
        inner.sessions.insert(Arc::clone(&session));
        info!(upload_id = %id, table = %table.key(), file = %req.file_name, size, "upload admitted");

        let task_inner = Arc::clone(inner);
        let span = tracing::info_span!("upload", upload_id = %id, table = %table.key());
        let work = run_upload(Arc::clone(inner), Arc::clone(&session), table, req.actor, req.meta, reader);
        tokio::spawn(
            async move {
                let result = match AssertUnwindSafe(work).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => {
                        let msg = panic_message(panic.as_ref());
                        error!(panic = %msg, "upload task panicked");
                        panicked_result(&session, msg)
                    }
                };
                session.finish(result);
                task_inner
                    .sessions
                    .schedule_removal(session.id, task_inner.config.session_ttl);
                drop(permit);
            }
            .instrument(span),
        );

        Ok(id)
    }

    /// Live progress. The current snapshot arrives first; the channel closes
    /// once the upload reaches a terminal phase.
    pub fn subscribe_progress(&self, upload_id: Uuid) -> IngestResult<mpsc::Receiver<Progress>> {
        Ok(self.session(upload_id)?.progress.subscribe())
    }

    pub fn progress(&self, upload_id: Uuid) -> IngestResult<Progress> {
        Ok(self.session(upload_id)?.progress.snapshot())
    }

    /// Request cancellation. Takes effect at the next cancellation check.
    pub fn cancel_upload(&self, upload_id: Uuid) -> IngestResult<()> {
        let session = self.session(upload_id)?;
        info!(upload_id = %upload_id, "upload cancellation requested");
        session.cancel.cancel();
        Ok(())
    }

    /// Wait for the upload to finish and return its result.
    pub async fn upload_result(&self, upload_id: Uuid) -> IngestResult<Arc<UploadResult>> {
        self.session(upload_id)?.wait().await
    }

    /// Number of sessions still held in memory, finished or not.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn limiter_status(&self) -> LimiterStatus {
        self.inner.limiter.status()
    }

    /// Wait until no upload is running, or until `cancel` fires.
    pub async fn wait_for_uploads(&self, cancel: &CancellationToken) -> IngestResult<()> {
        self.inner
            .limiter
            .wait_for_drain(cancel, self.inner.config.drain_poll_interval)
            .await
    }

    fn session(&self, upload_id: Uuid) -> IngestResult<Arc<UploadSession>> {
        self.inner
            .sessions
            .get(upload_id)
            .ok_or(IngestError::UploadNotFound(upload_id))
    }

    // ---- persisted uploads ------------------------------------------------

    pub async fn upload(&self, upload_id: Uuid) -> IngestResult<UploadRecord> {
        self.inner
            .store
            .find_upload(upload_id)
            .await?
            .ok_or(IngestError::UploadNotFound(upload_id))
    }

    pub async fn list_uploads(&self, table: Option<&str>, limit: i64) -> IngestResult<Vec<UploadRecord>> {
        Ok(self
            .inner
            .store
            .list_uploads(table, limit.clamp(1, MAX_PAGE_SIZE))
            .await?)
    }

    pub async fn failed_rows(&self, upload_id: Uuid) -> IngestResult<Vec<FailedRow>> {
        Ok(self.inner.store.failed_rows(upload_id).await?)
    }

    /// Write the rejected rows of an upload as CSV: `line`, `reason`, then
    /// the original header. Returns the number of rows written.
    pub async fn export_failed_rows<W>(&self, upload_id: Uuid, writer: W) -> IngestResult<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let record = self.upload(upload_id).await?;
        let rows = self.inner.store.failed_rows(upload_id).await?;

        let mut out = csv_async::AsyncWriterBuilder::new()
            .flexible(true)
            .create_writer(writer);
        let mut header = vec!["line".to_string(), "reason".to_string()];
        header.extend(record.header.iter().cloned());
        out.write_record(&header).await?;
        for row in &rows {
            let mut fields = vec![row.line.to_string(), row.reason.clone()];
            fields.extend(row.raw.iter().cloned());
            out.write_record(&fields).await?;
        }
        out.flush().await?;
        Ok(rows.len() as u64)
    }

    pub async fn rollback_upload(&self, upload_id: Uuid, actor: &Actor) -> IngestResult<RollbackResult> {
        rollback::rollback_upload(self.inner.store.as_ref(), &self.inner.registry, upload_id, actor).await
    }

    /// Delete every row of a table and record a critical audit entry.
    pub async fn reset_table(&self, table: &str, actor: &Actor) -> IngestResult<u64> {
        let def = self
            .inner
            .registry
            .get(table)
            .ok_or_else(|| IngestError::UnknownTable(table.to_string()))?;
        let removed = self.inner.store.reset_table(def.as_ref()).await?;
        warn!(table = %def.key(), removed, user = ?actor.user, "table reset");
        self.log_audit(
            LogAuditParams::new(AuditAction::TableReset, def.key())
                .with_actor(actor)
                .with_rows_affected(removed),
        )
        .await?;
        Ok(removed)
    }

    // ---- preview ----------------------------------------------------------

    /// Validate the head of a file against a table without writing anything.
    pub async fn preview<R>(
        &self,
        table: &str,
        reader: R,
        meta: &CsvMeta,
        mapping: Option<ColumnMapping>,
        max_rows: Option<u64>,
    ) -> IngestResult<PreviewReport>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let def = self
            .inner
            .registry
            .get(table)
            .ok_or_else(|| IngestError::UnknownTable(table.to_string()))?;
        let options = PreviewOptions {
            mapping,
            header_lookahead: self.inner.config.header_lookahead,
            date_pivot: self.inner.config.date_pivot,
            max_rows,
        };
        preview_csv(def.field_specs(), reader, meta, &options).await
    }

    // ---- audit ledger -----------------------------------------------------

    pub async fn log_audit(&self, params: LogAuditParams) -> IngestResult<AuditEntry> {
        Ok(self.inner.store.insert_audit(&params.into_entry()).await?)
    }

    /// Filtered entries, newest first. A `None` limit returns every match.
    pub async fn audit_log(&self, filter: &AuditFilter) -> IngestResult<Vec<AuditEntry>> {
        let mut filter = filter.clone();
        filter.limit = filter.limit.map(|l| l.clamp(1, MAX_PAGE_SIZE));
        Ok(self.inner.store.query_audit(&filter).await?)
    }

    pub async fn count_audit(&self, filter: &AuditFilter) -> IngestResult<i64> {
        Ok(self.inner.store.count_audit(filter).await?)
    }

    /// Every matching entry in id order, fetched page by page.
    ///
    /// `limit` and `offset` on the filter are ignored. Cancellation is checked
    /// before each entry; once it fires the stream yields
    /// [`IngestError::Cancelled`] and ends.
    pub fn stream_audit_log(
        &self,
        filter: AuditFilter,
        cancel: CancellationToken,
    ) -> impl Stream<Item = IngestResult<AuditEntry>> + Send + 'static {
        struct State {
            store: Arc<dyn IngestStore>,
            filter: AuditFilter,
            cancel: CancellationToken,
            after_id: i64,
            page: std::vec::IntoIter<AuditEntry>,
            exhausted: bool,
            done: bool,
        }

        let state = State {
            store: Arc::clone(&self.inner.store),
            filter,
            cancel,
            after_id: 0,
            page: Vec::new().into_iter(),
            exhausted: false,
            done: false,
        };

        futures::stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            if st.cancel.is_cancelled() {
                st.done = true;
                return Some((Err(IngestError::Cancelled), st));
            }
            if st.page.len() == 0 && !st.exhausted {
                match st
                    .store
                    .audit_page_after(&st.filter, st.after_id, AUDIT_STREAM_PAGE)
                    .await
                {
                    Ok(rows) => {
                        st.exhausted = (rows.len() as i64) < AUDIT_STREAM_PAGE;
                        st.page = rows.into_iter();
                    }
                    Err(e) => {
                        st.done = true;
                        return Some((Err(IngestError::from(e)), st));
                    }
                }
            }
            let entry = st.page.next()?;
            st.after_id = entry.id;
            Some((Ok(entry), st))
        })
    }

    /// Write matching entries as CSV. Returns the number of entries written.
    pub async fn export_audit_csv<W>(
        &self,
        filter: AuditFilter,
        writer: W,
        cancel: CancellationToken,
    ) -> IngestResult<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut out = csv_async::AsyncWriter::from_writer(writer);
        out.write_record(AuditEntry::CSV_HEADER).await?;

        let entries = self.stream_audit_log(filter, cancel);
        futures::pin_mut!(entries);
        let mut written = 0u64;
        while let Some(entry) = entries.next().await {
            out.write_record(entry?.to_csv_record()).await?;
            written += 1;
        }
        out.flush().await?;
        Ok(written)
    }

    /// Archive hot entries older than `days` now.
    pub async fn archive_old_audit_logs(&self, days: u32) -> IngestResult<u64> {
        archive::archive_older_than(
            self.inner.store.as_ref(),
            days,
            self.inner.config.archive.batch_size,
        )
        .await
    }

    /// Run the archival scheduler until `cancel` fires.
    pub fn spawn_archiver(&self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(archive::run(
            Arc::clone(&self.inner.store),
            self.inner.config.archive.clone(),
            cancel,
        ))
    }
}

// ---------------------------------------------------------------------------
// CSV source
// ---------------------------------------------------------------------------

struct SourceRow {
    /// 1-indexed line the record starts on.
    line: u64,
    cells: Vec<String>,
}

/// Raw records with line numbers. Blank records are skipped.
struct CsvSource<R> {
    reader: csv_async::AsyncReader<LineTracker<R>>,
    record: csv_async::StringRecord,
}

impl<R> CsvSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    fn new(text: R) -> Self {
        let reader = csv_async::AsyncReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .create_reader(LineTracker::new(text));
        Self {
            reader,
            record: csv_async::StringRecord::new(),
        }
    }

    async fn next_row(&mut self) -> IngestResult<Option<SourceRow>> {
        loop {
            if !self.reader.read_record(&mut self.record).await? {
                return Ok(None);
            }
            if self.record.iter().all(|c| c.trim().is_empty()) {
                continue;
            }
            let start = self.record.position().map_or(0, |p| p.byte());
            let line = self.reader.get_mut().line_at(start);
            return Ok(Some(SourceRow {
                line,
                cells: self.record.iter().map(str::to_string).collect(),
            }));
        }
    }

    /// Consume rows up to and including the header.
    ///
    /// With an explicit mapping the first row is the header. Otherwise the
    /// first `lookahead` rows are searched for the required columns and any
    /// preamble above the match is discarded.
    async fn resolve_header(
        &mut self,
        specs: &[FieldSpec],
        mapping: Option<&ColumnMapping>,
        lookahead: usize,
    ) -> IngestResult<(u64, HeaderIndex)> {
        if let Some(mapping) = mapping {
            let row = self.next_row().await?.ok_or(IngestError::EmptyFile)?;
            return Ok((row.line, HeaderIndex::from_mapping(mapping, &row.cells)));
        }

        let expected = required_columns(specs);
        let mut scanned = 0;
        while scanned < lookahead.max(1) {
            let Some(row) = self.next_row().await? else { break };
            if header_matches(&row.cells, &expected) {
                return Ok((row.line, HeaderIndex::from_row(&row.cells)));
            }
            scanned += 1;
        }
        if scanned == 0 {
            return Err(IngestError::EmptyFile);
        }
        Err(IngestError::HeaderNotFound { expected, lookahead })
    }
}

// ---------------------------------------------------------------------------
// Upload pipeline
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tally {
    rows: u64,
    inserted: u64,
    failed: Vec<FailedRow>,
    checksum: u32,
}

async fn run_upload(
    inner: Arc<Inner>,
    session: Arc<UploadSession>,
    table: Arc<dyn TableDefinition>,
    actor: Actor,
    meta: CsvMeta,
    reader: Box<dyn AsyncRead + Unpin + Send>,
) -> UploadResult {
    let mut tally = Tally::default();
    let outcome = ingest(&inner, &session, &table, &actor, &meta, reader, &mut tally).await;
    let duration_ms = session.started_at.elapsed().as_millis() as u64;
    let skipped = tally.failed.len() as u64;

    let (phase, error, inserted) = match outcome {
        Ok(()) => {
            info!(rows = tally.rows, inserted = tally.inserted, skipped, duration_ms, "upload complete");
            (Phase::Complete, None, tally.inserted)
        }
        Err(IngestError::Cancelled) => {
            info!(rows = tally.rows, duration_ms, "upload cancelled");
            (Phase::Cancelled, Some(IngestError::Cancelled.to_string()), 0)
        }
        // a closed connection usually fails the body read after the token fires
        Err(e) if session.cancel.is_cancelled() => {
            info!(error = %e, rows = tally.rows, duration_ms, "upload cancelled");
            (Phase::Cancelled, Some(IngestError::Cancelled.to_string()), 0)
        }
        Err(e) => {
            error!(error = %e, rows = tally.rows, duration_ms, "upload failed");
            (Phase::Failed, Some(e.to_string()), 0)
        }
    };

    UploadResult {
        upload_id: session.id,
        table_key: session.table_key.clone(),
        file_name: session.file_name.clone(),
        phase,
        total_rows: tally.rows,
        inserted,
        skipped,
        failed_rows: tally.failed,
        error,
        duration_ms,
        checksum: tally.checksum,
    }
}

async fn ingest(
    inner: &Inner,
    session: &UploadSession,
    table: &Arc<dyn TableDefinition>,
    actor: &Actor,
    meta: &CsvMeta,
    reader: Box<dyn AsyncRead + Unpin + Send>,
    tally: &mut Tally,
) -> IngestResult<()> {
    let config = &inner.config;
    session.progress.update(|p| p.phase = Phase::Reading);

    let (text, stats) = build_csv_reader(reader, meta);
    let mut source = CsvSource::new(text);
    let specs = table.field_specs();
    let (header_line, header) = source
        .resolve_header(specs, session.mapping.as_ref(), config.header_lookahead)
        .await?;
    debug!(header_line, columns = header.len(), "header resolved");

    let validator = RowValidator::new(specs, &header).with_pivot(config.date_pivot);

    let mut tx = inner
        .store
        .begin_upload(Arc::clone(table), session.id)
        .await
        .map_err(IngestError::transaction("begin"))?;
    session.progress.update(|p| p.phase = Phase::Validating);

    let written = async {
        write_rows(config, session, &mut source, &validator, &stats, tx.as_mut(), tally).await?;
        if session.cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        tally.checksum = stats.checksum();
        let record = NewUploadRecord {
            id: session.id,
            table_key: table.key().to_string(),
            file_name: session.file_name.clone(),
            rows_total: tally.rows,
            rows_inserted: tally.inserted,
            rows_skipped: tally.failed.len() as u64,
            duration_ms: session.started_at.elapsed().as_millis() as u64,
            checksum: tally.checksum,
            header: header.names().to_vec(),
            uploaded_by: actor.user.clone(),
        };
        tx.record_upload(&record)
            .await
            .map_err(IngestError::transaction("record upload"))?;
        if !tally.failed.is_empty() {
            tx.record_failed_rows(session.id, &tally.failed)
                .await
                .map_err(IngestError::transaction("record failed rows"))?;
        }
        Ok::<(), IngestError>(())
    }
    .await;

    if let Err(e) = written {
        if let Err(rb) = tx.rollback().await {
            warn!(error = %rb, "rollback after failed upload also failed");
        }
        return Err(e);
    }
    tx.commit().await.map_err(IngestError::transaction("commit"))?;
    debug!(inserted = tally.inserted, "upload committed");

    let entry = LogAuditParams::new(AuditAction::Upload, table.key())
        .with_actor(actor)
        .with_upload(session.id)
        .with_rows_affected(tally.inserted)
        .with_row(serde_json::json!({
            "file_name": session.file_name,
            "rows_total": tally.rows,
            "rows_skipped": tally.failed.len(),
            "checksum": format!("{:08x}", tally.checksum),
        }))
        .into_entry();
    if let Err(e) = inner.store.insert_audit(&entry).await {
        // data is committed; a missing ledger entry must not fail the upload
        warn!(error = %e, "upload not written to audit log");
    }
    Ok(())
}

async fn write_rows<R>(
    config: &IngestConfig,
    session: &UploadSession,
    source: &mut CsvSource<R>,
    validator: &RowValidator<'_>,
    stats: &ReadStats,
    tx: &mut dyn UploadTx,
    tally: &mut Tally,
) -> IngestResult<()>
where
    R: AsyncRead + Unpin + Send,
{
    let cancel_every = config.cancel_check_rows.max(1);
    let progress_every = config.progress_every_rows.max(1);
    let mut batch = BatchInserter::new(session.file_name.clone(), config.batch_size);

    while let Some(row) = source.next_row().await? {
        tally.rows += 1;
        let cells: Vec<&str> = row.cells.iter().map(String::as_str).collect();
        match validator.validate(row.line, &cells) {
            Ok(valid) => {
                if batch.push(valid) {
                    flush(&mut batch, session, stats, tx, tally).await?;
                    session.progress.update(|p| p.phase = Phase::Validating);
                }
            }
            Err(e) => tally
                .failed
                .push(FailedRow::new(&session.file_name, row.line, e, row.cells)),
        }

        if tally.rows % cancel_every == 0 && session.cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        if tally.rows % progress_every == 0 {
            report(session, stats, tally);
        }
    }

    flush(&mut batch, session, stats, tx, tally).await?;
    Ok(())
}

async fn flush(
    batch: &mut BatchInserter,
    session: &UploadSession,
    stats: &ReadStats,
    tx: &mut dyn UploadTx,
    tally: &mut Tally,
) -> IngestResult<()> {
    if batch.is_empty() {
        return Ok(());
    }
    session.progress.update(|p| p.phase = Phase::Inserting);
    let outcome = batch.flush(tx).await?;
    tally.inserted += outcome.inserted;
    tally.failed.extend(outcome.failed);
    report(session, stats, tally);
    Ok(())
}

fn report(session: &UploadSession, stats: &ReadStats, tally: &Tally) {
    session.progress.update(|p| {
        p.rows_read = tally.rows;
        p.bytes_read = stats.bytes_read();
        p.inserted = tally.inserted;
        p.skipped = tally.failed.len() as u64;
    });
}

fn panicked_result(session: &UploadSession, msg: String) -> UploadResult {
    let snapshot = session.progress.snapshot();
    UploadResult {
        upload_id: session.id,
        table_key: session.table_key.clone(),
        file_name: session.file_name.clone(),
        phase: Phase::Failed,
        total_rows: snapshot.rows_read,
        inserted: 0,
        skipped: snapshot.skipped,
        failed_rows: Vec::new(),
        error: Some(IngestError::Panicked(msg).to_string()),
        duration_ms: session.started_at.elapsed().as_millis() as u64,
        checksum: 0,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Preview
// ---------------------------------------------------------------------------

/// Resolve the header and run complete-mode validation over the first rows.
pub async fn preview_csv<R>(
    specs: &[FieldSpec],
    reader: R,
    meta: &CsvMeta,
    options: &PreviewOptions,
) -> IngestResult<PreviewReport>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (text, stats) = build_csv_reader(reader, meta);
    let mut source = CsvSource::new(text);
    let (header_line, header) = source
        .resolve_header(specs, options.mapping.as_ref(), options.header_lookahead)
        .await?;
    let validator = RowValidator::new(specs, &header).with_pivot(options.date_pivot);

    let mut report = PreviewReport {
        header_line,
        header: header.names().to_vec(),
        rows_checked: 0,
        valid_rows: 0,
        invalid_rows: Vec::new(),
        bytes_read: 0,
    };
    while options.max_rows.map_or(true, |max| report.rows_checked < max) {
        let Some(row) = source.next_row().await? else { break };
        report.rows_checked += 1;
        let cells: Vec<&str> = row.cells.iter().map(String::as_str).collect();
        let errors = validator.validate_complete(&cells);
        if errors.is_empty() {
            report.valid_rows += 1;
        } else {
            report.invalid_rows.push(RowDiagnostics {
                line: row.line,
                errors: errors.iter().map(ToString::to_string).collect(),
                raw: row.cells,
            });
        }
    }
    report.bytes_read = stats.bytes_read();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn specs() -> Vec<FieldSpec> {
        vec![
            FieldSpec::text("Vendor").required(),
            FieldSpec::numeric("Amount").required(),
            FieldSpec::date("Due"),
        ]
    }

    async fn preview(csv: &'static str, options: PreviewOptions) -> IngestResult<PreviewReport> {
        preview_csv(&specs(), csv.as_bytes(), &CsvMeta::default(), &options).await
    }

    #[tokio::test]
    async fn preview_skips_preamble_and_reports_lines() {
        let csv = "Vendor Aging Report\nAs of 2025-01-31\n\nVendor,Amount,Due\nAcme,\"$1,200.00\",01/15/25\nGlobex,abc,02/01/25\n,(5.00),\n";
        let report = preview(csv, PreviewOptions::default()).await.unwrap();
        assert_eq!(report.header_line, 4);
        assert_eq!(report.header, vec!["Vendor", "Amount", "Due"]);
        assert_eq!(report.rows_checked, 3);
        assert_eq!(report.valid_rows, 1);
        assert_eq!(report.invalid_rows.len(), 2);
        assert_eq!(report.invalid_rows[0].line, 6);
        assert_eq!(report.invalid_rows[1].line, 7);
        assert_eq!(report.invalid_rows[1].errors.len(), 1);
        assert!(report.bytes_read > 0);
    }

    #[tokio::test]
    async fn blank_lines_keep_physical_line_numbers() {
        let csv = "\r\nPayables\r\n\r\n\r\nVendor,Amount\r\nAcme,1\r\n\r\n\r\nGlobex,x\r\n\nInitech,\"x\r\ny\"\r\nHooli,y";
        let report = preview(csv, PreviewOptions::default()).await.unwrap();
        assert_eq!(report.header_line, 5);
        assert_eq!(report.rows_checked, 4);
        let lines: Vec<u64> = report.invalid_rows.iter().map(|r| r.line).collect();
        assert_eq!(lines, vec![9, 11, 13]);
    }

    #[tokio::test]
    async fn preview_honours_row_limit() {
        let csv = "Vendor,Amount\na,1\nb,2\nc,3\n";
        let report = preview(
            csv,
            PreviewOptions {
                max_rows: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(report.rows_checked, 2);
    }

    #[tokio::test]
    async fn header_outside_lookahead_is_an_error() {
        let csv = "x\ny\nz\nVendor,Amount\n";
        let err = preview(
            csv,
            PreviewOptions {
                header_lookahead: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert_matches!(err, IngestError::HeaderNotFound { lookahead: 2, .. });
        assert!(err.to_string().contains("vendor, amount"));
    }

    #[tokio::test]
    async fn explicit_mapping_uses_first_row_as_header() {
        let csv = "name,total\nAcme,5\n";
        let mapping = ColumnMapping::from([("Vendor".to_string(), 0), ("Amount".to_string(), 1), ("Due".to_string(), 9)]);
        let report = preview(
            csv,
            PreviewOptions {
                mapping: Some(mapping),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(report.header_line, 1);
        assert_eq!(report.valid_rows, 1);
    }

    #[tokio::test]
    async fn empty_input_is_reported() {
        assert_matches!(preview("", PreviewOptions::default()).await, Err(IngestError::EmptyFile));
    }

    #[test]
    fn panic_payloads_become_messages() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
