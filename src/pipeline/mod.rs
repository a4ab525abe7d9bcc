#![forbid(unsafe_code)]

//! Two bounded worker pools joined by a bounded queue.
//!
//! ```text
//! tasks -> [download queue] -> D download workers -> [upload queue, K] -> U upload workers
//! ```
//!
//! Every task handed to [`run_pipeline`] yields exactly one [`ItemOutcome`]:
//! items left in a queue or interrupted mid-flight by shutdown are reported as
//! failed with reason `abandoned`.

mod download;
mod upload;

use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{error, info, warn};

use crate::{
    encoding::EncodingWaiter,
    error::SinkError,
    mediacms::UploadSink,
    model::{
        DownloadResult, ItemOutcome, RunSummary, SlotId, UploadRecord, VideoTask, WorkerState,
        WorkerStatus,
    },
    queue::{self, QueueSender},
    retry::{Pacer, RetryPolicy},
    shutdown::Shutdown,
    source::VideoSource,
    staging::StagingArea,
    status::{StatusBus, StatusEvent},
};

pub const ABANDONED: &str = "abandoned";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub download_workers: usize,
    pub upload_workers: usize,
    pub upload_queue_capacity: usize,
    pub retry: RetryPolicy,
    pub wait_for_encoding: bool,
    pub encoding: EncodingWaiter,
    pub keep_files: bool,
    /// Pause an upload worker takes after each finished upload.
    pub upload_delay: Duration,
    /// Failed items are re-queued by later runs until they have failed this
    /// many times.
    pub max_item_retries: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            download_workers: 2,
            upload_workers: 1,
            upload_queue_capacity: 2,
            retry: RetryPolicy::default(),
            wait_for_encoding: true,
            encoding: EncodingWaiter::new(Duration::from_secs(30), 240),
            keep_files: false,
            upload_delay: Duration::ZERO,
            max_item_retries: 5,
        }
    }
}

/// Collaborators shared by every worker of one pipeline run.
#[derive(Clone)]
pub struct PipelineContext {
    pub source: Arc<dyn VideoSource>,
    pub sink: Arc<dyn UploadSink>,
    pub staging: StagingArea,
    pub bus: StatusBus,
    pub pacer: Arc<dyn Pacer>,
    pub shutdown: Shutdown,
    /// Receives each outcome as soon as it is known.
    pub ledger: Option<mpsc::UnboundedSender<ItemOutcome>>,
}

#[derive(Debug, Default)]
pub struct PipelineReport {
    pub summary: RunSummary,
    pub outcomes: Vec<ItemOutcome>,
    /// Set when a worker stopped the run because of a credential or quota
    /// failure at the destination.
    pub systemic: Option<SinkError>,
    pub interrupted: bool,
}

impl PipelineReport {
    pub fn drained_cleanly(&self) -> bool {
        self.systemic.is_none() && !self.interrupted
    }
}

/// Emits status events and forwards outcomes to the collector.
#[derive(Clone)]
pub(crate) struct Reporter {
    bus: StatusBus,
    outcomes: mpsc::UnboundedSender<ItemOutcome>,
}

impl Reporter {
    pub(crate) fn worker_state(&self, slot: SlotId, item: Option<&str>, status: WorkerStatus) {
        self.bus.emit(StatusEvent::WorkerStateChanged(WorkerState {
            slot,
            current_item: item.map(str::to_string),
            status,
        }));
    }

    pub(crate) fn progress(&self, slot: SlotId, identifier: &str, message: impl Into<String>) {
        self.bus.emit(StatusEvent::ItemProgress {
            slot,
            identifier: identifier.to_string(),
            message: message.into(),
        });
    }

    pub(crate) fn completed(
        &self,
        slot: SlotId,
        record: &UploadRecord,
        published_at: Option<chrono::DateTime<chrono::Utc>>,
        unverified_reason: Option<String>,
    ) {
        let outcome = match unverified_reason {
            Some(reason) => ItemOutcome::unverified(record, published_at, reason),
            None => ItemOutcome::succeeded(record, published_at),
        };
        self.bus.emit(StatusEvent::ItemCompleted {
            slot,
            identifier: record.task.identifier.clone(),
            outcome: outcome.kind,
            handle: Some(record.handle.clone()),
        });
        let _ = self.outcomes.send(outcome);
    }

    pub(crate) fn failed(&self, slot: Option<SlotId>, task: VideoTask, reason: impl Into<String>) {
        let reason = reason.into();
        self.bus.emit(StatusEvent::ItemFailed {
            slot,
            identifier: task.identifier.clone(),
            reason: reason.clone(),
        });
        let _ = self.outcomes.send(ItemOutcome::failed(task, reason));
    }
}

pub(crate) struct Shared {
    pub settings: PipelineSettings,
    pub ctx: PipelineContext,
    pub reporter: Reporter,
}

/// Runs every task through download and upload and waits for both pools to
/// drain.
pub async fn run_pipeline(
    settings: PipelineSettings,
    ctx: PipelineContext,
    tasks: Vec<VideoTask>,
) -> PipelineReport {
    let total = tasks.len();
    let download_workers = settings.download_workers.max(1);
    let upload_workers = settings.upload_workers.max(1);
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
    let collector = tokio::spawn(collect_outcomes(outcome_rx, ctx.ledger.clone()));

    let shared = Arc::new(Shared {
        reporter: Reporter {
            bus: ctx.bus.clone(),
            outcomes: outcome_tx,
        },
        settings,
        ctx,
    });
    info!(
        items = total,
        download_workers,
        upload_workers,
        queue_capacity = shared.settings.upload_queue_capacity,
        "starting pipeline"
    );

    let (download_tx, download_rx) = queue::bounded::<VideoTask>(download_workers);
    let (upload_tx, upload_rx) =
        queue::bounded::<DownloadResult>(shared.settings.upload_queue_capacity);

    let feeder = tokio::spawn(feed(Arc::clone(&shared), download_tx, tasks));

    let downloads: Vec<JoinHandle<()>> = (0..download_workers)
        .map(|index| {
            tokio::spawn(download::run_worker(
                Arc::clone(&shared),
                SlotId::download(index),
                download_rx.clone(),
                upload_tx.clone(),
            ))
        })
        .collect();
    drop(upload_tx);

    let uploads: Vec<JoinHandle<Result<(), SinkError>>> = (0..upload_workers)
        .map(|index| {
            tokio::spawn(upload::run_worker(
                Arc::clone(&shared),
                SlotId::upload(index),
                upload_rx.clone(),
            ))
        })
        .collect();

    if let Err(err) = feeder.await {
        error!(%err, "feeder task panicked");
    }
    for handle in downloads {
        if let Err(err) = handle.await {
            error!(%err, "download worker panicked");
        }
    }
    let mut systemic = None;
    for handle in uploads {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                systemic.get_or_insert(err);
            }
            Err(err) => error!(%err, "upload worker panicked"),
        }
    }

    for task in download_rx.close_and_drain().await {
        shared.reporter.failed(None, task, ABANDONED);
    }
    for download in upload_rx.close_and_drain().await {
        shared.reporter.failed(None, download.task, ABANDONED);
    }

    let interrupted = shared.ctx.shutdown.is_draining() && systemic.is_none();
    drop(shared);
    let (summary, outcomes) = match collector.await {
        Ok(collected) => collected,
        Err(err) => {
            error!(%err, "outcome collector panicked");
            Default::default()
        }
    };
    if outcomes.len() != total {
        error!(
            expected = total,
            reported = outcomes.len(),
            "pipeline outcome count mismatch"
        );
    }
    PipelineReport {
        summary,
        outcomes,
        systemic,
        interrupted,
    }
}

async fn feed(shared: Arc<Shared>, queue: QueueSender<VideoTask>, tasks: Vec<VideoTask>) {
    let mut pending = tasks.into_iter();
    while let Some(task) = pending.next() {
        let permit = tokio::select! {
            biased;
            _ = shared.ctx.shutdown.draining() => None,
            permit = queue.reserve() => permit,
        };
        let Some(permit) = permit else {
            shared.reporter.failed(None, task, ABANDONED);
            for rest in pending.by_ref() {
                shared.reporter.failed(None, rest, ABANDONED);
            }
            break;
        };
        permit.send(task);
    }
}

async fn collect_outcomes(
    mut rx: mpsc::UnboundedReceiver<ItemOutcome>,
    ledger: Option<mpsc::UnboundedSender<ItemOutcome>>,
) -> (RunSummary, Vec<ItemOutcome>) {
    let mut summary = RunSummary::default();
    let mut outcomes = Vec::new();
    while let Some(outcome) = rx.recv().await {
        summary.record(outcome.kind);
        if let Some(ledger) = &ledger {
            let _ = ledger.send(outcome.clone());
        }
        outcomes.push(outcome);
    }
    (summary, outcomes)
}

/// Removes staged files after a confirmed upload unless asked to keep them.
pub(crate) fn cleanup_staged(shared: &Shared, download: &DownloadResult) {
    if shared.settings.keep_files {
        return;
    }
    if let Err(err) = shared.ctx.staging.remove(&download.task.identifier) {
        warn!(video = %download.task.identifier, %err, "could not remove staged files");
    }
}
