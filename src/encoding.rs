#![forbid(unsafe_code)]

//! Tracks server-side transcoding of an uploaded item until it settles.
//!
//! [`EncodingTracker`] is the pure state machine; [`EncodingWaiter`] drives it
//! by polling an [`UploadSink`] at a fixed interval.

use std::{collections::BTreeMap, fmt, time::Duration};
use tracing::debug;

use crate::{
    error::{Classify, SinkError},
    mediacms::UploadSink,
    retry::Pacer,
    shutdown::Shutdown,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl ResolutionState {
    /// Maps MediaCMS status strings. Unknown values yield `None`.
    pub fn from_server(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" => Some(Self::Pending),
            "running" | "processing" => Some(Self::Processing),
            "success" | "ready" => Some(Self::Ready),
            "fail" | "failed" | "error" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Ready | Self::Failed => 2,
        }
    }

    /// A state never moves backwards and a terminal state never changes.
    pub fn advance(self, next: Self) -> Self {
        if self.is_terminal() || next.rank() < self.rank() {
            self
        } else {
            next
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

/// Per-resolution encoding states, keyed by labels such as `720p`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodingLadder {
    entries: BTreeMap<String, ResolutionState>,
}

impl EncodingLadder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, ResolutionState)>,
        S: Into<String>,
    {
        let mut ladder = Self::new();
        for (label, state) in entries {
            ladder.observe(label, state);
        }
        ladder
    }

    pub fn observe(&mut self, label: impl Into<String>, state: ResolutionState) {
        self.entries
            .entry(label.into())
            .and_modify(|current| *current = current.advance(state))
            .or_insert(state);
    }

    pub fn merge(&mut self, other: &EncodingLadder) {
        for (label, state) in &other.entries {
            self.observe(label.clone(), *state);
        }
    }

    pub fn get(&self, label: &str) -> Option<ResolutionState> {
        self.entries.get(label).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn any_failed(&self) -> bool {
        self.entries
            .values()
            .any(|state| *state == ResolutionState::Failed)
    }

    pub fn all_ready(&self) -> bool {
        !self.entries.is_empty()
            && self
                .entries
                .values()
                .all(|state| *state == ResolutionState::Ready)
    }
}

impl fmt::Display for EncodingLadder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return f.write_str("no renditions yet");
        }
        let mut first = true;
        for (label, state) in &self.entries {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{label}:{}", state.label())?;
        }
        Ok(())
    }
}

/// One poll response: the item-wide status plus the per-resolution ladder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodingSnapshot {
    pub overall: Option<ResolutionState>,
    pub ladder: EncodingLadder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    InProgress,
    Ready,
    Failed,
}

/// Decides whether an accumulated snapshot is terminal.
///
/// Any failed rendition fails the item. A non-empty ladder is ready once every
/// rendition is ready and the overall status, when reported, agrees. With no
/// renditions listed the overall status alone decides.
pub fn classify(overall: Option<ResolutionState>, ladder: &EncodingLadder) -> Verdict {
    if overall == Some(ResolutionState::Failed) || ladder.any_failed() {
        return Verdict::Failed;
    }
    if ladder.is_empty() {
        return match overall {
            Some(ResolutionState::Ready) => Verdict::Ready,
            _ => Verdict::InProgress,
        };
    }
    let overall_settled = matches!(overall, None | Some(ResolutionState::Ready));
    if ladder.all_ready() && overall_settled {
        Verdict::Ready
    } else {
        Verdict::InProgress
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitState {
    Submitted,
    Polling { polls: u32 },
    Ready { polls: u32 },
    Failed { polls: u32, reason: String },
    TimedOut { polls: u32 },
}

impl WaitState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Ready { .. } | Self::Failed { .. } | Self::TimedOut { .. }
        )
    }
}

/// Pure transition logic for one uploaded item.
#[derive(Debug, Clone)]
pub struct EncodingTracker {
    state: WaitState,
    overall: Option<ResolutionState>,
    ladder: EncodingLadder,
    max_polls: u32,
}

impl EncodingTracker {
    pub fn new(max_polls: u32) -> Self {
        Self {
            state: WaitState::Submitted,
            overall: None,
            ladder: EncodingLadder::new(),
            max_polls: max_polls.max(1),
        }
    }

    pub fn state(&self) -> &WaitState {
        &self.state
    }

    pub fn ladder(&self) -> &EncodingLadder {
        &self.ladder
    }

    pub fn polls(&self) -> u32 {
        match &self.state {
            WaitState::Submitted => 0,
            WaitState::Polling { polls }
            | WaitState::Ready { polls }
            | WaitState::Failed { polls, .. }
            | WaitState::TimedOut { polls } => *polls,
        }
    }

    /// Folds one poll response into the state. Transient poll errors still
    /// consume a poll attempt. Terminal states ignore further input.
    pub fn observe(&mut self, response: Result<EncodingSnapshot, SinkError>) -> &WaitState {
        if self.state.is_terminal() {
            return &self.state;
        }
        let polls = self.polls() + 1;
        let verdict = match response {
            Ok(snapshot) => {
                if let Some(overall) = snapshot.overall {
                    self.overall = Some(match self.overall {
                        Some(current) => current.advance(overall),
                        None => overall,
                    });
                }
                self.ladder.merge(&snapshot.ladder);
                classify(self.overall, &self.ladder)
            }
            Err(err) if err.is_transient() => Verdict::InProgress,
            Err(err) => {
                self.state = WaitState::Failed {
                    polls,
                    reason: err.to_string(),
                };
                return &self.state;
            }
        };
        self.state = match verdict {
            Verdict::Ready => WaitState::Ready { polls },
            Verdict::Failed => WaitState::Failed {
                polls,
                reason: format!("encoding failed ({})", self.ladder),
            },
            Verdict::InProgress if polls >= self.max_polls => WaitState::TimedOut { polls },
            Verdict::InProgress => WaitState::Polling { polls },
        };
        &self.state
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    Failed(String),
    TimedOut { polls: u32 },
    /// The destination rejected our credentials or quota while polling.
    Systemic(SinkError),
    /// Shutdown interrupted the wait.
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct EncodingWaiter {
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl EncodingWaiter {
    pub fn new(poll_interval: Duration, max_polls: u32) -> Self {
        Self {
            poll_interval,
            max_polls,
        }
    }

    pub async fn wait(
        &self,
        sink: &dyn UploadSink,
        pacer: &dyn Pacer,
        shutdown: &Shutdown,
        handle: &str,
        mut on_poll: impl FnMut(&EncodingLadder) + Send,
    ) -> WaitOutcome {
        let mut tracker = EncodingTracker::new(self.max_polls);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.aborted() => return WaitOutcome::Abandoned,
                _ = pacer.pause(self.poll_interval) => {}
            }
            let response = tokio::select! {
                biased;
                _ = shutdown.aborted() => return WaitOutcome::Abandoned,
                response = sink.poll_status(handle) => response,
            };
            if let Err(err) = &response
                && err.is_systemic()
            {
                return WaitOutcome::Systemic(err.clone());
            }
            if let Err(err) = &response {
                debug!(handle, %err, "encoding poll failed");
            }
            let state = tracker.observe(response).clone();
            on_poll(tracker.ladder());
            match state {
                WaitState::Ready { .. } => return WaitOutcome::Ready,
                WaitState::Failed { reason, .. } => return WaitOutcome::Failed(reason),
                WaitState::TimedOut { polls } => return WaitOutcome::TimedOut { polls },
                WaitState::Submitted | WaitState::Polling { .. } => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mediacms::testing::ScriptedSink, retry::testing::InstantPacer};
    use ResolutionState::*;

    fn ladder(entries: &[(&str, ResolutionState)]) -> EncodingLadder {
        EncodingLadder::from_entries(entries.iter().map(|(label, state)| (*label, *state)))
    }

    fn snapshot(entries: &[(&str, ResolutionState)]) -> EncodingSnapshot {
        EncodingSnapshot {
            overall: None,
            ladder: ladder(entries),
        }
    }

    #[test]
    fn server_strings_map_to_states() {
        assert_eq!(ResolutionState::from_server("pending"), Some(Pending));
        assert_eq!(ResolutionState::from_server("running"), Some(Processing));
        assert_eq!(ResolutionState::from_server("success"), Some(Ready));
        assert_eq!(ResolutionState::from_server("fail"), Some(Failed));
        assert_eq!(ResolutionState::from_server("mystery"), None);
    }

    #[test]
    fn ladder_classification() {
        assert_eq!(
            classify(None, &ladder(&[("480p", Ready), ("1080p", Ready)])),
            Verdict::Ready
        );
        assert_eq!(
            classify(None, &ladder(&[("480p", Ready), ("1080p", Processing)])),
            Verdict::InProgress
        );
        assert_eq!(
            classify(None, &ladder(&[("480p", Ready), ("1080p", Failed)])),
            Verdict::Failed
        );
        assert_eq!(classify(None, &EncodingLadder::new()), Verdict::InProgress);
        assert_eq!(
            classify(Some(Ready), &EncodingLadder::new()),
            Verdict::Ready
        );
        assert_eq!(
            classify(Some(Processing), &ladder(&[("480p", Ready)])),
            Verdict::InProgress
        );
        assert_eq!(
            classify(Some(Failed), &ladder(&[("480p", Ready)])),
            Verdict::Failed
        );
    }

    #[test]
    fn ladder_states_never_regress() {
        let mut ladder = ladder(&[("720p", Processing)]);
        ladder.observe("720p", Pending);
        assert_eq!(ladder.get("720p"), Some(Processing));
        ladder.observe("720p", Ready);
        ladder.observe("720p", Failed);
        assert_eq!(ladder.get("720p"), Some(Ready));
        assert_eq!(ladder.to_string(), "720p:ready");
    }

    #[test]
    fn tracker_walks_to_ready() {
        let mut tracker = EncodingTracker::new(10);
        assert_eq!(tracker.state(), &WaitState::Submitted);
        tracker.observe(Ok(snapshot(&[("480p", Processing)])));
        assert_eq!(tracker.state(), &WaitState::Polling { polls: 1 });
        tracker.observe(Err(SinkError::Transient("502".into())));
        assert_eq!(tracker.state(), &WaitState::Polling { polls: 2 });
        tracker.observe(Ok(snapshot(&[("480p", Ready), ("1080p", Ready)])));
        assert_eq!(tracker.state(), &WaitState::Ready { polls: 3 });
        tracker.observe(Ok(snapshot(&[("480p", Failed)])));
        assert_eq!(tracker.state(), &WaitState::Ready { polls: 3 });
    }

    #[test]
    fn tracker_times_out_after_max_polls() {
        let mut tracker = EncodingTracker::new(2);
        tracker.observe(Ok(snapshot(&[("480p", Pending)])));
        tracker.observe(Ok(snapshot(&[("480p", Processing)])));
        assert_eq!(tracker.state(), &WaitState::TimedOut { polls: 2 });
    }

    #[test]
    fn tracker_fails_on_rejected_poll() {
        let mut tracker = EncodingTracker::new(5);
        tracker.observe(Err(SinkError::Rejected("404".into())));
        assert!(matches!(tracker.state(), WaitState::Failed { polls: 1, .. }));
    }

    #[tokio::test]
    async fn waiter_polls_until_ready() {
        let sink = ScriptedSink::with_polls(vec![
            Ok(snapshot(&[("480p", Pending)])),
            Ok(snapshot(&[("480p", Processing), ("1080p", Pending)])),
            Ok(snapshot(&[("480p", Ready), ("1080p", Ready)])),
        ]);
        let pacer = InstantPacer::default();
        let waiter = EncodingWaiter::new(Duration::from_secs(30), 10);
        let mut seen = Vec::new();
        let outcome = waiter
            .wait(&sink, &pacer, &Shutdown::new(), "tok", |ladder| {
                seen.push(ladder.len())
            })
            .await;
        assert_eq!(outcome, WaitOutcome::Ready);
        assert_eq!(seen, vec![1, 2, 2]);
        assert_eq!(pacer.delays.lock().len(), 3);
        assert!(pacer
            .delays
            .lock()
            .iter()
            .all(|delay| *delay == Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn waiter_reports_timeout_and_systemic_errors() {
        let pacer = InstantPacer::default();
        let waiter = EncodingWaiter::new(Duration::from_secs(1), 2);

        let pending = ScriptedSink::with_polls(vec![
            Ok(snapshot(&[("480p", Pending)])),
            Ok(snapshot(&[("480p", Pending)])),
        ]);
        let outcome = waiter
            .wait(&pending, &pacer, &Shutdown::new(), "tok", |_| {})
            .await;
        assert_eq!(outcome, WaitOutcome::TimedOut { polls: 2 });

        let revoked = ScriptedSink::with_polls(vec![Err(SinkError::Auth("401".into()))]);
        let outcome = waiter
            .wait(&revoked, &pacer, &Shutdown::new(), "tok", |_| {})
            .await;
        assert!(matches!(outcome, WaitOutcome::Systemic(SinkError::Auth(_))));
    }

    #[tokio::test]
    async fn waiter_stops_on_abort() {
        let sink = ScriptedSink::with_polls(Vec::new());
        let shutdown = Shutdown::new();
        shutdown.abort();
        let outcome = EncodingWaiter::new(Duration::from_secs(1), 5)
            .wait(&sink, &InstantPacer::default(), &shutdown, "tok", |_| {})
            .await;
        assert_eq!(outcome, WaitOutcome::Abandoned);
    }
}
