#![forbid(unsafe_code)]

//! Two-phase cancellation shared by every worker.
//!
//! `begin` asks workers to stop taking new items; in-flight work gets a grace
//! period before `abort` fires and the current operation is abandoned.
//! Systemic failures skip the grace period.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    drain: CancellationToken,
    abort: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, grace: Duration) {
        if self.drain.is_cancelled() {
            return;
        }
        self.drain.cancel();
        let abort = self.abort.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = abort.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    warn!(grace_secs = grace.as_secs(), "grace period elapsed; abandoning in-flight work");
                    abort.cancel();
                }
            }
        });
    }

    pub fn abort(&self) {
        self.drain.cancel();
        self.abort.cancel();
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub async fn draining(&self) {
        self.drain.cancelled().await
    }

    pub async fn aborted(&self) {
        self.abort.cancelled().await
    }
}
