#![forbid(unsafe_code)]

//! Progress events fanned out from the workers to any number of consumers.
//!
//! The bus is a `tokio::sync::broadcast` channel: producers never wait, and a
//! consumer that falls behind loses the oldest events and is told how many it
//! missed. The bus closes once every handle is dropped, so consumers drain the
//! remaining events and exit on their own.

use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::model::{OutcomeKind, SlotId, WorkerState};

pub const DEFAULT_STATUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    WorkerStateChanged(WorkerState),
    ItemProgress {
        slot: SlotId,
        identifier: String,
        message: String,
    },
    ItemCompleted {
        slot: SlotId,
        identifier: String,
        outcome: OutcomeKind,
        handle: Option<String>,
    },
    ItemFailed {
        slot: Option<SlotId>,
        identifier: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct StatusBus {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Never blocks. Events emitted with no subscriber are discarded.
    pub fn emit(&self, event: StatusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}

/// Reads events until the bus closes, reporting how many were skipped
/// through `on_lag`.
pub async fn consume(
    mut rx: broadcast::Receiver<StatusEvent>,
    mut on_event: impl FnMut(StatusEvent),
    mut on_lag: impl FnMut(u64),
) {
    loop {
        match rx.recv().await {
            Ok(event) => on_event(event),
            Err(RecvError::Lagged(skipped)) => on_lag(skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Turns every event into a log line.
pub fn spawn_line_logger(rx: broadcast::Receiver<StatusEvent>) -> JoinHandle<()> {
    tokio::spawn(consume(rx, log_event, |skipped| {
        warn!(skipped, "status logger fell behind; events dropped");
    }))
}

fn log_event(event: StatusEvent) {
    match event {
        StatusEvent::WorkerStateChanged(state) => debug!(
            worker = %state.slot,
            status = state.status.label(),
            video = state.current_item.as_deref().unwrap_or("-"),
            "worker state"
        ),
        StatusEvent::ItemProgress {
            slot,
            identifier,
            message,
        } => info!(worker = %slot, video = %identifier, "{message}"),
        StatusEvent::ItemCompleted {
            slot,
            identifier,
            outcome: OutcomeKind::Unverified,
            handle,
        } => warn!(
            worker = %slot,
            video = %identifier,
            handle = handle.as_deref().unwrap_or("-"),
            "uploaded but encoding not confirmed"
        ),
        StatusEvent::ItemCompleted {
            slot,
            identifier,
            outcome,
            handle,
        } => info!(
            worker = %slot,
            video = %identifier,
            handle = handle.as_deref().unwrap_or("-"),
            %outcome,
            "item finished"
        ),
        StatusEvent::ItemFailed {
            slot,
            identifier,
            reason,
        } => {
            let worker = slot.map_or_else(|| "-".to_string(), |slot| slot.to_string());
            warn!(worker = %worker, video = %identifier, %reason, "item failed");
        }
    }
}
