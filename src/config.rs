//! Engine configuration.

use std::str::FromStr;
use std::time::Duration;

use crate::batch::DEFAULT_BATCH_SIZE;
use crate::coerce::DEFAULT_PIVOT;
use crate::header::DEFAULT_HEADER_LOOKAHEAD;
use crate::{IngestError, IngestResult};

/// Hot/cold retention for the audit ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePolicy {
    /// Entries older than this move to the archive table.
    pub hot_retention_days: u32,
    /// Archived entries older than this are deleted.
    pub archive_retention_days: u32,
    pub interval: Duration,
    /// Rows moved per statement.
    pub batch_size: i64,
}

impl Default for ArchivePolicy {
    fn default() -> Self {
        Self {
            hot_retention_days: 90,
            archive_retention_days: 730,
            interval: Duration::from_secs(24 * 60 * 60),
            batch_size: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    pub max_concurrent_uploads: usize,
    /// How long an upload may wait for an admission slot.
    pub admission_wait: Duration,
    pub batch_size: usize,
    pub header_lookahead: usize,
    pub date_pivot: i32,
    /// Rows between cancellation checks.
    pub cancel_check_rows: u64,
    /// Rows between progress notifications.
    pub progress_every_rows: u64,
    /// Grace period before a finished session is forgotten.
    pub session_ttl: Duration,
    pub subscriber_buffer: usize,
    pub drain_poll_interval: Duration,
    pub archive: ArchivePolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 4,
            admission_wait: Duration::from_secs(30),
            batch_size: DEFAULT_BATCH_SIZE,
            header_lookahead: DEFAULT_HEADER_LOOKAHEAD,
            date_pivot: DEFAULT_PIVOT,
            cancel_check_rows: 100,
            progress_every_rows: 250,
            session_ttl: Duration::from_secs(5 * 60),
            subscriber_buffer: 16,
            drain_poll_interval: Duration::from_millis(250),
            archive: ArchivePolicy::default(),
        }
    }
}

impl IngestConfig {
    /// Defaults overridden by `INGEST_*` environment variables.
    ///
    /// Durations are whole seconds except `INGEST_DRAIN_POLL_MS`.
    pub fn from_env() -> IngestResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> IngestResult<Self> {
        let d = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let secs = |key: &str, default: Duration| -> IngestResult<Duration> {
            Ok(parse_var::<u64>(key, get(key))?.map_or(default, Duration::from_secs))
        };

        let config = Self {
            max_concurrent_uploads: parse_var(
                "INGEST_MAX_CONCURRENT_UPLOADS",
                get("INGEST_MAX_CONCURRENT_UPLOADS"),
            )?
            .unwrap_or(d.max_concurrent_uploads),
            admission_wait: secs("INGEST_ADMISSION_WAIT_SECS", d.admission_wait)?,
            batch_size: parse_var("INGEST_BATCH_SIZE", get("INGEST_BATCH_SIZE"))?.unwrap_or(d.batch_size),
            header_lookahead: parse_var("INGEST_HEADER_LOOKAHEAD", get("INGEST_HEADER_LOOKAHEAD"))?
                .unwrap_or(d.header_lookahead),
            date_pivot: parse_var("INGEST_DATE_PIVOT", get("INGEST_DATE_PIVOT"))?.unwrap_or(d.date_pivot),
            cancel_check_rows: parse_var("INGEST_CANCEL_CHECK_ROWS", get("INGEST_CANCEL_CHECK_ROWS"))?
                .unwrap_or(d.cancel_check_rows),
            progress_every_rows: parse_var("INGEST_PROGRESS_EVERY_ROWS", get("INGEST_PROGRESS_EVERY_ROWS"))?
                .unwrap_or(d.progress_every_rows),
            session_ttl: secs("INGEST_SESSION_TTL_SECS", d.session_ttl)?,
            subscriber_buffer: parse_var("INGEST_SUBSCRIBER_BUFFER", get("INGEST_SUBSCRIBER_BUFFER"))?
                .unwrap_or(d.subscriber_buffer),
            drain_poll_interval: parse_var::<u64>("INGEST_DRAIN_POLL_MS", get("INGEST_DRAIN_POLL_MS"))?
                .map_or(d.drain_poll_interval, Duration::from_millis),
            archive: ArchivePolicy {
                hot_retention_days: parse_var("INGEST_AUDIT_HOT_DAYS", get("INGEST_AUDIT_HOT_DAYS"))?
                    .unwrap_or(d.archive.hot_retention_days),
                archive_retention_days: parse_var(
                    "INGEST_AUDIT_ARCHIVE_DAYS",
                    get("INGEST_AUDIT_ARCHIVE_DAYS"),
                )?
                .unwrap_or(d.archive.archive_retention_days),
                interval: secs("INGEST_AUDIT_ARCHIVE_INTERVAL_SECS", d.archive.interval)?,
                batch_size: parse_var("INGEST_AUDIT_ARCHIVE_BATCH", get("INGEST_AUDIT_ARCHIVE_BATCH"))?
                    .unwrap_or(d.archive.batch_size),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> IngestResult<()> {
        if self.max_concurrent_uploads == 0 {
            return Err(IngestError::Config("max_concurrent_uploads must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(IngestError::Config("batch_size must be at least 1".into()));
        }
        if self.header_lookahead == 0 {
            return Err(IngestError::Config("header_lookahead must be at least 1".into()));
        }
        if self.archive.batch_size <= 0 {
            return Err(IngestError::Config("archive batch size must be positive".into()));
        }
        if self.archive.interval.is_zero() {
            return Err(IngestError::Config("archive interval must be non-zero".into()));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(key: &str, value: Option<String>) -> IngestResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    value
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| IngestError::Config(format!("{key}={v:?}: {e}")))
        })
        .transpose()
}
