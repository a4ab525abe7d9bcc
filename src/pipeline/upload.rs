#![forbid(unsafe_code)]

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error};

use super::{ABANDONED, Shared, cleanup_staged};
use crate::{
    encoding::WaitOutcome,
    error::{Classify, SinkError},
    model::{DownloadResult, SlotId, UploadRecord, WorkerStatus},
    queue::QueueReceiver,
    retry::RetryFailure,
};

/// Uploads staged items and, when enabled, waits for their encoding to
/// settle. Returns the error that made the destination unusable.
pub(super) async fn run_worker(
    shared: Arc<Shared>,
    slot: SlotId,
    queue: QueueReceiver<DownloadResult>,
) -> Result<(), SinkError> {
    let reporter = &shared.reporter;
    let shutdown = &shared.ctx.shutdown;
    let result = loop {
        reporter.worker_state(slot, None, WorkerStatus::Idle);
        let next = tokio::select! {
            biased;
            _ = shutdown.draining() => None,
            item = queue.pop() => item,
        };
        let Some(download) = next else {
            break Ok(());
        };
        let id = download.task.identifier.clone();
        reporter.worker_state(slot, Some(&id), WorkerStatus::Uploading);

        let sink = &shared.ctx.sink;
        let item = &download;
        let uploaded = shared
            .settings
            .retry
            .run(
                "upload",
                shared.ctx.pacer.as_ref(),
                shutdown,
                move |attempt| async move {
                    if attempt > 1 {
                        reporter.progress(slot, &item.task.identifier, format!("upload attempt {attempt}"));
                    }
                    sink.upload(item).await
                },
            )
            .await;

        let handle = match uploaded {
            Ok(handle) => handle,
            Err(RetryFailure::Failed { error, attempts }) => {
                let systemic = error.is_systemic();
                reporter.failed(
                    Some(slot),
                    download.task,
                    format!("upload failed after {attempts} attempt(s): {error}"),
                );
                if systemic {
                    error!(worker = %slot, video = %id, %error, "destination unusable; stopping run");
                    shutdown.abort();
                    break Err(error);
                }
                continue;
            }
            Err(RetryFailure::Abandoned) => {
                reporter.failed(Some(slot), download.task, ABANDONED);
                break Ok(());
            }
        };

        let record = UploadRecord {
            task: download.task.clone(),
            handle,
            uploaded_at: Utc::now(),
        };
        let published_at = download.published_at();
        reporter.progress(slot, &id, format!("uploaded as {}", record.handle));
        pace_uploads(&shared).await;

        if !shared.settings.wait_for_encoding {
            cleanup_staged(&shared, &download);
            reporter.completed(slot, &record, published_at, None);
            continue;
        }

        reporter.worker_state(slot, Some(&id), WorkerStatus::WaitingForEncoding);
        let outcome = shared
            .settings
            .encoding
            .wait(
                shared.ctx.sink.as_ref(),
                shared.ctx.pacer.as_ref(),
                shutdown,
                &record.handle,
                |ladder| reporter.progress(slot, &id, ladder.to_string()),
            )
            .await;
        debug!(worker = %slot, video = %id, ?outcome, "encoding wait finished");
        match outcome {
            WaitOutcome::Ready => {
                cleanup_staged(&shared, &download);
                reporter.completed(slot, &record, published_at, None);
            }
            WaitOutcome::Failed(reason) => {
                reporter.failed(Some(slot), download.task, format!("uploaded as {} but {reason}", record.handle));
            }
            WaitOutcome::TimedOut { polls } => {
                reporter.completed(
                    slot,
                    &record,
                    published_at,
                    Some(format!("encoding not confirmed after {polls} polls")),
                );
            }
            WaitOutcome::Abandoned => {
                reporter.completed(
                    slot,
                    &record,
                    published_at,
                    Some("encoding wait interrupted".to_string()),
                );
                break Ok(());
            }
            WaitOutcome::Systemic(err) => {
                reporter.completed(
                    slot,
                    &record,
                    published_at,
                    Some(format!("encoding status unavailable: {err}")),
                );
                error!(worker = %slot, video = %id, %err, "destination unusable; stopping run");
                shutdown.abort();
                break Err(err);
            }
        }
    };
    reporter.worker_state(slot, None, WorkerStatus::Stopped);
    result
}

/// Spaces consecutive uploads of one worker; shutdown cuts the pause short.
async fn pace_uploads(shared: &Shared) {
    let delay = shared.settings.upload_delay;
    if delay.is_zero() {
        return;
    }
    tokio::select! {
        biased;
        _ = shared.ctx.shutdown.draining() => {}
        _ = shared.ctx.pacer.pause(delay) => {}
    }
}
