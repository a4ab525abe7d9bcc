#![forbid(unsafe_code)]

//! Live terminal view of the worker slots.
//!
//! A collector task folds bus events into a shared [`StatusBoard`]; a painter
//! task redraws the board on a fixed interval. Rendering never blocks the
//! workers: the board is only touched by the collector and the painter.

use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, VecDeque},
    fmt::Write as _,
    io::{self, Write},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    model::{OutcomeKind, RunSummary, SlotId, WorkerState, WorkerStatus},
    status::{StatusEvent, consume},
};

const RECENT_LINES: usize = 8;
const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

#[derive(Debug, Clone)]
struct SlotView {
    status: WorkerStatus,
    item: Option<String>,
    detail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StatusBoard {
    slots: BTreeMap<SlotId, SlotView>,
    summary: RunSummary,
    recent: VecDeque<String>,
    dropped: u64,
    started: Instant,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self {
            slots: BTreeMap::new(),
            summary: RunSummary::default(),
            recent: VecDeque::new(),
            dropped: 0,
            started: Instant::now(),
        }
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: StatusEvent) {
        match event {
            StatusEvent::WorkerStateChanged(WorkerState {
                slot,
                current_item,
                status,
            }) => {
                let view = self.slots.entry(slot).or_insert(SlotView {
                    status,
                    item: None,
                    detail: None,
                });
                if view.item != current_item {
                    view.detail = None;
                }
                view.status = status;
                view.item = current_item;
            }
            StatusEvent::ItemProgress {
                slot,
                identifier,
                message,
            } => {
                if let Some(view) = self.slots.get_mut(&slot)
                    && view.item.as_deref() == Some(identifier.as_str())
                {
                    view.detail = Some(message);
                }
            }
            StatusEvent::ItemCompleted {
                identifier,
                outcome,
                handle,
                ..
            } => {
                self.summary.record(outcome);
                let handle = handle.unwrap_or_default();
                self.push_recent(format!("{outcome:<10} {identifier} {handle}"));
            }
            StatusEvent::ItemFailed {
                identifier, reason, ..
            } => {
                self.summary.record(OutcomeKind::Failed);
                self.push_recent(format!("failed     {identifier} {reason}"));
            }
        }
    }

    pub fn note_dropped(&mut self, skipped: u64) {
        self.dropped += skipped;
    }

    fn push_recent(&mut self, line: String) {
        if self.recent.len() == RECENT_LINES {
            self.recent.pop_front();
        }
        self.recent.push_back(line);
    }

    pub fn render(&self) -> String {
        let elapsed = self.started.elapsed().as_secs();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "tubemirror  {:02}:{:02}:{:02}  {}",
            elapsed / 3600,
            (elapsed / 60) % 60,
            elapsed % 60,
            self.summary
        );
        if self.dropped > 0 {
            let _ = writeln!(out, "({} status updates skipped)", self.dropped);
        }
        out.push('\n');
        for (slot, view) in &self.slots {
            let _ = writeln!(
                out,
                "  {:<12} {:<17} {:<14} {}",
                slot.to_string(),
                view.status.label(),
                view.item.as_deref().unwrap_or("-"),
                view.detail.as_deref().unwrap_or("")
            );
        }
        if !self.recent.is_empty() {
            out.push_str("\nrecent:\n");
            for line in &self.recent {
                let _ = writeln!(out, "  {line}");
            }
        }
        out
    }
}

/// Handle to the collector and painter tasks.
pub struct LiveRenderer {
    collector: JoinHandle<()>,
    painter: JoinHandle<()>,
}

impl LiveRenderer {
    pub fn spawn(rx: broadcast::Receiver<StatusEvent>, refresh: Duration) -> Self {
        let board = Arc::new(RwLock::new(StatusBoard::new()));
        let done = CancellationToken::new();

        let collector = {
            let board = Arc::clone(&board);
            let done = done.clone();
            tokio::spawn(async move {
                let lag_board = Arc::clone(&board);
                consume(
                    rx,
                    |event| board.write().apply(event),
                    |skipped| lag_board.write().note_dropped(skipped),
                )
                .await;
                done.cancel();
            })
        };

        let painter = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh);
            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = ticker.tick() => paint(&snapshot(&board)),
                }
            }
            paint(&snapshot(&board));
        });

        Self { collector, painter }
    }

    /// Waits for the bus to close and the final frame to be drawn.
    pub async fn finish(self) {
        let _ = self.collector.await;
        let _ = self.painter.await;
    }
}

/// Renders under the read lock and releases it before any terminal I/O.
fn snapshot(board: &RwLock<StatusBoard>) -> String {
    board.read().render()
}

fn paint(frame: &str) {
    let mut stderr = io::stderr().lock();
    let _ = write!(stderr, "{CLEAR_SCREEN}{frame}");
    let _ = stderr.flush();
}
