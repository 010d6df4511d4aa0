//! Hot/cold archival of the audit ledger.
//!
//! Entries past the hot window are moved to `audit_log_archive` in bounded
//! batches; archived entries past the archive window are purged. The two steps
//! fail independently and neither failure stops the scheduler.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::ArchivePolicy;
use crate::store::IngestStore;
use crate::IngestResult;

/// Outcome of one archive pass. `None` means that step failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveReport {
    pub archived: Option<u64>,
    pub purged: Option<u64>,
}

/// Move every hot entry older than `days` to the archive, `batch_size` rows
/// per statement. Returns the number of entries moved.
pub async fn archive_older_than(store: &dyn IngestStore, days: u32, batch_size: i64) -> IngestResult<u64> {
    let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
    let batch_size = batch_size.max(1);
    let mut total = 0u64;
    loop {
        let moved = store.archive_audit_batch(cutoff, batch_size).await?;
        total += moved;
        if moved < batch_size as u64 {
            break;
        }
        tracing::debug!(moved, total, "audit archive batch moved");
    }
    Ok(total)
}

/// Delete archived entries older than `days`.
pub async fn purge_older_than(store: &dyn IngestStore, days: u32) -> IngestResult<u64> {
    let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
    Ok(store.purge_audit_archive(cutoff).await?)
}

/// One archive-then-purge pass. Failures are logged, never returned.
pub async fn run_once(store: &dyn IngestStore, policy: &ArchivePolicy) -> ArchiveReport {
    let archived = match archive_older_than(store, policy.hot_retention_days, policy.batch_size).await {
        Ok(n) => {
            if n > 0 {
                tracing::info!(archived = n, "Audit archival: moved entries to archive");
            } else {
                tracing::debug!("Audit archival: nothing to move");
            }
            Some(n)
        }
        Err(e) => {
            tracing::error!(error = %e, "Audit archival failed");
            None
        }
    };

    let purged = match purge_older_than(store, policy.archive_retention_days).await {
        Ok(n) => {
            if n > 0 {
                tracing::info!(purged = n, "Audit archival: purged archived entries");
            }
            Some(n)
        }
        Err(e) => {
            tracing::error!(error = %e, "Audit archive purge failed");
            None
        }
    };

    ArchiveReport { archived, purged }
}

/// Run passes on startup and then every `policy.interval` until `cancel`.
pub async fn run(store: Arc<dyn IngestStore>, policy: ArchivePolicy, cancel: CancellationToken) {
    tracing::info!(
        hot_days = policy.hot_retention_days,
        archive_days = policy.archive_retention_days,
        interval_secs = policy.interval.as_secs(),
        "Audit archiver started"
    );

    // the first tick completes immediately
    let mut interval = tokio::time::interval(policy.interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Audit archiver stopping");
                break;
            }
            _ = interval.tick() => {
                run_once(store.as_ref(), &policy).await;
            }
        }
    }
}
