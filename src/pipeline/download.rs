#![forbid(unsafe_code)]

use std::{fs, sync::Arc};
use tracing::debug;

use super::{ABANDONED, Shared};
use crate::{
    error::SourceError,
    model::{DownloadResult, SlotId, VideoTask, WorkerStatus},
    queue::{QueueReceiver, QueueSender},
    retry::RetryFailure,
};

/// Pulls tasks until the download queue closes or shutdown begins.
pub(super) async fn run_worker(
    shared: Arc<Shared>,
    slot: SlotId,
    tasks: QueueReceiver<VideoTask>,
    uploads: QueueSender<DownloadResult>,
) {
    let reporter = &shared.reporter;
    let shutdown = &shared.ctx.shutdown;
    loop {
        reporter.worker_state(slot, None, WorkerStatus::Idle);
        let next = tokio::select! {
            biased;
            _ = shutdown.draining() => None,
            task = tasks.pop() => task,
        };
        let Some(task) = next else {
            break;
        };
        reporter.worker_state(slot, Some(&task.identifier), WorkerStatus::Downloading);

        let source = &shared.ctx.source;
        let attempt_task = &task;
        let result = shared
            .settings
            .retry
            .run(
                "download",
                shared.ctx.pacer.as_ref(),
                shutdown,
                move |attempt| async move {
                    if attempt > 1 {
                        reporter.progress(
                            slot,
                            &attempt_task.identifier,
                            format!("download attempt {attempt}"),
                        );
                    }
                    let download = source.resolve(attempt_task).await?;
                    validate_download(&download)?;
                    Ok::<_, SourceError>(download)
                },
            )
            .await;

        let download = match result {
            Ok(download) => download,
            Err(RetryFailure::Failed { error, attempts }) => {
                reporter.failed(
                    Some(slot),
                    task,
                    format!("download failed after {attempts} attempt(s): {error}"),
                );
                continue;
            }
            Err(RetryFailure::Abandoned) => {
                reporter.failed(Some(slot), task, ABANDONED);
                break;
            }
        };

        reporter.progress(slot, &download.task.identifier, "downloaded; waiting for upload slot");
        debug!(worker = %slot, video = %download.task.identifier, "queueing for upload");
        // Upload workers stop taking items once draining starts, so a slot
        // freed after that would never be consumed.
        let permit = tokio::select! {
            biased;
            _ = shutdown.draining() => None,
            permit = uploads.reserve() => permit,
        };
        let Some(permit) = permit else {
            debug!(worker = %slot, video = %download.task.identifier, "upload queue unavailable");
            reporter.failed(Some(slot), download.task, ABANDONED);
            break;
        };
        permit.send(download);
    }
    reporter.worker_state(slot, None, WorkerStatus::Stopped);
}

/// A download only counts when the media file is non-empty and the metadata
/// is usable.
pub(super) fn validate_download(download: &DownloadResult) -> Result<(), SourceError> {
    let size = fs::metadata(&download.media_path)
        .map(|meta| meta.len())
        .map_err(|err| {
            SourceError::Invalid(format!("{}: {err}", download.media_path.display()))
        })?;
    if size == 0 {
        return Err(SourceError::Invalid(format!(
            "{} is empty",
            download.media_path.display()
        )));
    }
    download.metadata.validate()
}
