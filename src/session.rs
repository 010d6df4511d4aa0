//! In-flight upload sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::header::ColumnMapping;
use crate::progress::{Phase, Progress, ProgressBroadcaster};
use crate::store::FailedRow;
use crate::{IngestError, IngestResult};

/// Final, immutable outcome of one upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadResult {
    pub upload_id: Uuid,
    pub table_key: String,
    pub file_name: String,
    /// Always terminal.
    pub phase: Phase,
    /// Data rows read, excluding the header and anything above it.
    pub total_rows: u64,
    pub inserted: u64,
    pub skipped: u64,
    pub failed_rows: Vec<FailedRow>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub checksum: u32,
}

impl UploadResult {
    pub fn is_success(&self) -> bool {
        self.phase == Phase::Complete
    }
}

pub(crate) struct UploadSession {
    pub id: Uuid,
    pub table_key: String,
    pub file_name: String,
    pub cancel: CancellationToken,
    pub progress: ProgressBroadcaster,
    pub mapping: Option<ColumnMapping>,
    pub started_at: Instant,
    result: watch::Sender<Option<Arc<UploadResult>>>,
}

impl UploadSession {
    pub fn new(
        id: Uuid,
        table_key: String,
        file_name: String,
        cancel: CancellationToken,
        mapping: Option<ColumnMapping>,
        initial: Progress,
        subscriber_buffer: usize,
    ) -> Self {
        let (result, _) = watch::channel(None);
        Self {
            id,
            table_key,
            file_name,
            cancel,
            progress: ProgressBroadcaster::new(initial, subscriber_buffer),
            mapping,
            started_at: Instant::now(),
            result,
        }
    }

    /// Publish the terminal progress snapshot, then the result. Only the first
    /// call has any effect.
    pub fn finish(&self, result: UploadResult) -> bool {
        self.progress.update(|p| {
            p.phase = result.phase;
            p.inserted = result.inserted;
            p.skipped = result.skipped;
            p.rows_read = p.rows_read.max(result.total_rows);
            p.error = result.error.clone();
        });
        let result = Arc::new(result);
        self.result.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        })
    }

    pub fn result(&self) -> Option<Arc<UploadResult>> {
        self.result.borrow().clone()
    }

    /// Block until [`finish`](Self::finish) has run.
    pub async fn wait(&self) -> IngestResult<Arc<UploadResult>> {
        let mut rx = self.result.subscribe();
        let done = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| IngestError::UploadNotFound(self.id))?;
        (*done).clone().ok_or(IngestError::UploadNotFound(self.id))
    }
}

/// Sessions by id, shared between the engine and its upload tasks.
#[derive(Clone, Default)]
pub(crate) struct SessionTable {
    inner: Arc<Mutex<HashMap<Uuid, Arc<UploadSession>>>>,
}

impl SessionTable {
    pub fn insert(&self, session: Arc<UploadSession>) {
        self.lock().insert(session.id, session);
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<UploadSession>> {
        self.lock().get(&id).cloned()
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<UploadSession>> {
        self.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Forget a finished session after `ttl`, leaving time to fetch its result.
    pub fn schedule_removal(&self, id: Uuid, ttl: Duration) {
        let table = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if table.remove(id).is_some() {
                tracing::debug!(upload_id = %id, "upload session expired");
            }
        });
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<UploadSession>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
