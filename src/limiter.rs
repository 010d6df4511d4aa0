//! Admission control for concurrent uploads.
//!
//! Each running upload holds one permit. Waiting for a permit is bounded, so
//! a saturated server answers "try again" instead of queueing forever, and
//! shutdown can wait for the permits to come home.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{IngestError, IngestResult};

/// Snapshot of limiter occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimiterStatus {
    pub active: usize,
    pub available: usize,
    pub max: usize,
}

#[derive(Debug, Clone)]
pub struct UploadLimiter {
    semaphore: Arc<Semaphore>,
    max: usize,
    wait: Duration,
}

impl UploadLimiter {
    pub fn new(max: usize, wait: Duration) -> Self {
        let max = max.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
            wait,
        }
    }

    /// Wait up to the configured window for a slot.
    ///
    /// Returns [`IngestError::TooManyUploads`] when the window elapses and
    /// [`IngestError::Cancelled`] when `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> IngestResult<OwnedSemaphorePermit> {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Ok(permit);
        }
        if self.wait.is_zero() {
            return Err(IngestError::TooManyUploads);
        }

        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IngestError::Cancelled),
            res = tokio::time::timeout(self.wait, acquire) => match res {
                Ok(Ok(permit)) => Ok(permit),
                // the semaphore is never closed
                Ok(Err(_closed)) => Err(IngestError::TooManyUploads),
                Err(_elapsed) => Err(IngestError::TooManyUploads),
            },
        }
    }

    pub fn active_count(&self) -> usize {
        self.max - self.semaphore.available_permits()
    }

    pub fn status(&self) -> LimiterStatus {
        let available = self.semaphore.available_permits();
        LimiterStatus {
            active: self.max - available,
            available,
            max: self.max,
        }
    }

    /// Poll until no upload holds a permit, or until `cancel` fires.
    pub async fn wait_for_drain(&self, cancel: &CancellationToken, poll: Duration) -> IngestResult<()> {
        let mut ticker = tokio::time::interval(poll.max(Duration::from_millis(1)));
        loop {
            if self.active_count() == 0 {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                _ = ticker.tick() => {}
            }
        }
    }
}
