#![forbid(unsafe_code)]

//! Channel-level driver: picks the tasks for a run mode, feeds them through a
//! fresh pipeline per channel and moves the sync cutoff afterwards.
//!
//! Channels are processed one after another. A channel's pools are fully
//! drained before the next channel starts.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::{collections::HashSet, fmt, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    discovery::{Discovery, extract_channel_id},
    error::{Classify, DiscoveryError},
    mediacms::{DestinationAccount, DestinationConnector, DestinationLink},
    model::{ItemOutcome, RunSummary, VideoTask, dedupe_tasks},
    pipeline::{PipelineContext, PipelineSettings, run_pipeline},
    retry::{Pacer, RetryFailure},
    shutdown::Shutdown,
    source::VideoSource,
    staging::StagingArea,
    state::{SyncStore, next_cutoff},
    status::StatusBus,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Videos newer than the stored cutoff plus earlier failures.
    New { since: Option<DateTime<Utc>> },
    /// The entire channel listing.
    Full,
    /// A fixed list of identifiers, uploaded to the selected channel.
    VideoIds(Vec<String>),
    /// Only refresh the destination profile.
    UpdateChannel,
}

impl RunMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::New { .. } => "new",
            Self::Full => "full",
            Self::VideoIds(_) => "video-ids",
            Self::UpdateChannel => "update-channel",
        }
    }

    fn runs_pipeline(&self) -> bool {
        !matches!(self, Self::UpdateChannel)
    }
}

/// One configured source channel and the destination token it uploads with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    pub name: String,
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Completed,
    /// Nothing to do for this channel.
    Skipped(String),
    Interrupted,
    /// A credential, quota or configuration failure stopped the run.
    Aborted(String),
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Skipped(reason) => write!(f, "skipped ({reason})"),
            Self::Interrupted => f.write_str("interrupted"),
            Self::Aborted(reason) => write!(f, "aborted: {reason}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelReport {
    pub name: String,
    pub channel_id: String,
    pub status: ChannelStatus,
    pub summary: RunSummary,
    pub profile_updated: bool,
    /// Stored cutoff after the run.
    pub cutoff: Option<DateTime<Utc>>,
    pub outcomes: Vec<ItemOutcome>,
}

impl ChannelReport {
    fn new(target: &ChannelTarget, channel_id: &str) -> Self {
        Self {
            name: target.name.clone(),
            channel_id: channel_id.to_string(),
            status: ChannelStatus::Completed,
            summary: RunSummary::default(),
            profile_updated: false,
            cutoff: None,
            outcomes: Vec::new(),
        }
    }

    fn with_status(mut self, status: ChannelStatus) -> Self {
        self.status = status;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub channels: Vec<ChannelReport>,
    pub total: RunSummary,
    pub interrupted: bool,
    pub aborted: Option<String>,
}

impl RunReport {
    /// Item failures alone still count as a successful run.
    pub fn is_success(&self) -> bool {
        !self.interrupted && self.aborted.is_none()
    }
}

pub struct Orchestrator {
    pub settings: PipelineSettings,
    pub discovery: Arc<dyn Discovery>,
    pub source: Arc<dyn VideoSource>,
    pub connector: Arc<dyn DestinationConnector>,
    pub staging: StagingArea,
    pub store: SyncStore,
    pub bus: StatusBus,
    pub pacer: Arc<dyn Pacer>,
    pub shutdown: Shutdown,
    pub skip_channel_update: bool,
}

impl Orchestrator {
    /// Processes `channels` in order. Errors are reserved for local failures
    /// such as an unusable state database; remote failures end up in the
    /// report.
    pub async fn run(&self, mode: &RunMode, channels: &[ChannelTarget]) -> Result<RunReport> {
        let mut report = RunReport::default();
        for (index, target) in channels.iter().enumerate() {
            if self.shutdown.is_draining() {
                report.interrupted = true;
                break;
            }
            println!();
            println!(
                "[{}/{}] Mirroring channel ({}): {}",
                index + 1,
                channels.len(),
                mode.label(),
                target.name
            );
            let channel = self
                .run_channel(mode, target)
                .await
                .with_context(|| format!("mirroring channel {}", target.name))?;
            report.total.merge(&channel.summary);
            println!("  {}: {} ({})", target.name, channel.status, channel.summary);
            match &channel.status {
                ChannelStatus::Interrupted => report.interrupted = true,
                ChannelStatus::Aborted(reason) => {
                    report.aborted = Some(format!("{}: {reason}", target.name))
                }
                ChannelStatus::Completed | ChannelStatus::Skipped(_) => {}
            }
            let stop = !report.is_success();
            report.channels.push(channel);
            if stop {
                break;
            }
        }
        Ok(report)
    }

    async fn run_channel(&self, mode: &RunMode, target: &ChannelTarget) -> Result<ChannelReport> {
        let channel_id = extract_channel_id(&target.url);
        let mut report = ChannelReport::new(target, &channel_id);
        let link = match self.connector.connect(&target.token) {
            Ok(link) => link,
            Err(err) => return Ok(report.with_status(ChannelStatus::Aborted(format!("{err:#}")))),
        };

        let account = Arc::clone(&link.account);
        let username = self
            .settings
            .retry
            .run("whoami", self.pacer.as_ref(), &self.shutdown, |_| account.username())
            .await;
        match username {
            Ok(username) => info!(channel = %target.name, %username, "destination account verified"),
            Err(RetryFailure::Abandoned) => return Ok(report.with_status(ChannelStatus::Interrupted)),
            Err(RetryFailure::Failed { error, .. }) => {
                error!(channel = %target.name, %error, "destination account unusable");
                return Ok(report.with_status(ChannelStatus::Aborted(error.to_string())));
            }
        }

        let refresh = match mode {
            RunMode::UpdateChannel => true,
            RunMode::New { .. } | RunMode::Full => !self.skip_channel_update,
            RunMode::VideoIds(_) => false,
        };
        if refresh {
            report.profile_updated = self.refresh_profile(&channel_id, link.account.as_ref()).await;
        }
        if !mode.runs_pipeline() {
            return Ok(report);
        }

        let previous = self.store.load(&channel_id).await?;
        let tasks = match self
            .resolve_tasks(mode, &channel_id, previous.as_ref().map(|s| s.last_synced_at), &link)
            .await?
        {
            Ok(tasks) => tasks,
            Err(status) => return Ok(report.with_status(status)),
        };
        let tasks = self.drop_completed(tasks).await?;
        report.cutoff = previous.as_ref().map(|state| state.last_synced_at);
        if tasks.is_empty() {
            println!("  No videos to mirror for {}.", target.name);
            return Ok(report);
        }
        println!("  Found {} video(s) to mirror.", tasks.len());

        let (ledger_tx, mut ledger_rx) = mpsc::unbounded_channel::<ItemOutcome>();
        let store = self.store.clone();
        let recorder = tokio::spawn(async move {
            while let Some(outcome) = ledger_rx.recv().await {
                if let Err(err) = store.record_outcome(&outcome).await {
                    error!(video = %outcome.identifier(), %err, "could not record outcome");
                }
            }
        });

        let ctx = PipelineContext {
            source: Arc::clone(&self.source),
            sink: Arc::clone(&link.sink),
            staging: self.staging.clone(),
            bus: self.bus.clone(),
            pacer: Arc::clone(&self.pacer),
            shutdown: self.shutdown.clone(),
            ledger: Some(ledger_tx),
        };
        let pipeline = run_pipeline(self.settings.clone(), ctx, tasks).await;
        if let Err(err) = recorder.await {
            error!(%err, "outcome recorder panicked");
        }

        report.summary = pipeline.summary;
        report.status = if let Some(err) = &pipeline.systemic {
            ChannelStatus::Aborted(err.to_string())
        } else if pipeline.interrupted {
            ChannelStatus::Interrupted
        } else {
            ChannelStatus::Completed
        };

        let writes_cutoff = !matches!(mode, RunMode::VideoIds(_));
        if writes_cutoff && pipeline.drained_cleanly() {
            let previous_cutoff = previous.as_ref().map(|state| state.last_synced_at);
            if let Some((synced_at, last_id)) = next_cutoff(previous_cutoff, &pipeline.outcomes) {
                let state = self.store.advance(&channel_id, synced_at, &last_id).await?;
                info!(channel = %target.name, cutoff = %state.last_synced_at, video = %last_id, "sync cutoff advanced");
                report.cutoff = Some(state.last_synced_at);
            }
        } else if writes_cutoff {
            warn!(channel = %target.name, "run did not drain cleanly; sync cutoff left unchanged");
        }
        report.outcomes = pipeline.outcomes;
        Ok(report)
    }

    /// Inner `Err` carries the channel status when listing could not finish.
    async fn resolve_tasks(
        &self,
        mode: &RunMode,
        channel_id: &str,
        stored_cutoff: Option<DateTime<Utc>>,
        link: &DestinationLink,
    ) -> Result<Result<Vec<VideoTask>, ChannelStatus>> {
        let (since, mut tasks) = match mode {
            RunMode::VideoIds(ids) => {
                // Explicit identifiers may not belong to this channel, so they stay
                // out of its retry ledger.
                let tasks = ids
                    .iter()
                    .map(|id| VideoTask::new(id.clone(), None, None))
                    .collect::<Result<Vec<_>>>()?;
                return Ok(Ok(dedupe_tasks(tasks)));
            }
            RunMode::UpdateChannel => return Ok(Ok(Vec::new())),
            RunMode::Full => (None, Vec::new()),
            RunMode::New { since } => {
                let cutoff = match since.or(stored_cutoff) {
                    Some(cutoff) => Some(cutoff),
                    None => self.bootstrap_cutoff(channel_id, link.account.as_ref()).await,
                };
                let retries = self
                    .store
                    .pending_retries(channel_id, self.settings.max_item_retries)
                    .await?;
                if !retries.is_empty() {
                    info!(channel = channel_id, count = retries.len(), "re-queueing earlier failures");
                }
                (cutoff, retries)
            }
        };

        let discovery = &self.discovery;
        let listed = self
            .settings
            .retry
            .run("list videos", self.pacer.as_ref(), &self.shutdown, |_| {
                discovery.list_videos(channel_id, since)
            })
            .await;
        let listed = match listed {
            Ok(listed) => listed,
            Err(failure) => return Ok(Err(discovery_status(failure))),
        };
        debug!(channel = channel_id, listed = listed.len(), since = ?since, "channel listing resolved");
        for video in listed {
            tasks.push(VideoTask::new(
                video.identifier,
                Some(channel_id.to_string()),
                video.published_at,
            )?);
        }
        Ok(Ok(dedupe_tasks(tasks)))
    }

    /// Channels without stored state start after the newest upload already
    /// on the destination.
    async fn bootstrap_cutoff(
        &self,
        channel_id: &str,
        account: &dyn DestinationAccount,
    ) -> Option<DateTime<Utc>> {
        match account.latest_upload_date().await {
            Ok(Some(latest)) => {
                info!(channel = channel_id, %latest, "no stored cutoff; starting after latest destination upload");
                Some(latest)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(channel = channel_id, %err, "could not read latest destination upload; resolving whole listing");
                None
            }
        }
    }

    async fn drop_completed(&self, tasks: Vec<VideoTask>) -> Result<Vec<VideoTask>> {
        let ids: Vec<String> = tasks.iter().map(|task| task.identifier.clone()).collect();
        let done: HashSet<String> = self.store.completed_among(&ids).await?;
        if !done.is_empty() {
            info!(skipped = done.len(), "skipping videos already mirrored");
        }
        Ok(tasks
            .into_iter()
            .filter(|task| !done.contains(&task.identifier))
            .collect())
    }

    /// Copies name, description and logo to the destination. Failures are
    /// logged and never stop the run.
    async fn refresh_profile(&self, channel_id: &str, account: &dyn DestinationAccount) -> bool {
        let discovery = &self.discovery;
        let profile = self
            .settings
            .retry
            .run("channel profile", self.pacer.as_ref(), &self.shutdown, |_| {
                discovery.channel_profile(channel_id)
            })
            .await;
        let profile = match profile {
            Ok(profile) => profile,
            Err(RetryFailure::Failed { error, .. }) => {
                warn!(channel = channel_id, %error, "could not fetch channel profile");
                return false;
            }
            Err(RetryFailure::Abandoned) => return false,
        };
        match account.update_profile(&profile).await {
            Ok(()) => {
                println!("  Updated destination profile: {}", profile.name);
                true
            }
            Err(err) => {
                warn!(channel = channel_id, %err, "could not update destination profile");
                false
            }
        }
    }
}

fn discovery_status(failure: RetryFailure<DiscoveryError>) -> ChannelStatus {
    match failure {
        RetryFailure::Abandoned => ChannelStatus::Interrupted,
        RetryFailure::Failed { error, .. } if error.is_systemic() => {
            error!(%error, "channel listing failed");
            ChannelStatus::Aborted(error.to_string())
        }
        RetryFailure::Failed { error, attempts } => {
            warn!(%error, attempts, "channel listing failed");
            ChannelStatus::Skipped(error.to_string())
        }
    }
}
