#![forbid(unsafe_code)]

//! Value types that travel between discovery, the worker pools and the
//! orchestrator.

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashSet},
    fmt,
    path::PathBuf,
};

use crate::error::SourceError;

const MAX_IDENTIFIER_LEN: usize = 64;

/// Source identifiers double as staging directory names, so only the URL-safe
/// alphabet YouTube uses is accepted.
pub fn is_valid_identifier(identifier: &str) -> bool {
    !identifier.is_empty()
        && identifier.len() <= MAX_IDENTIFIER_LEN
        && identifier
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoTask {
    pub identifier: String,
    pub channel_id: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl VideoTask {
    pub fn new(
        identifier: impl Into<String>,
        channel_id: Option<String>,
        published_at: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let identifier = identifier.into();
        if !is_valid_identifier(&identifier) {
            bail!("invalid video identifier: {identifier:?}");
        }
        Ok(Self {
            identifier,
            channel_id,
            published_at,
        })
    }
}

/// Drops repeated identifiers while keeping the first occurrence in place.
pub fn dedupe_tasks(tasks: Vec<VideoTask>) -> Vec<VideoTask> {
    let mut seen = HashSet::new();
    tasks
        .into_iter()
        .filter(|task| seen.insert(task.identifier.clone()))
        .collect()
}

/// Normalized metadata persisted next to the staged media as `metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_sec: u64,
}

impl Metadata {
    pub fn validate(&self) -> Result<(), SourceError> {
        if self.title.trim().is_empty() {
            return Err(SourceError::Invalid("metadata has an empty title".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    pub task: VideoTask,
    pub media_path: PathBuf,
    pub thumbnail_path: Option<PathBuf>,
    pub metadata: Metadata,
}

impl DownloadResult {
    /// Timestamp used to advance the sync cutoff: the discovery value wins,
    /// the downloaded metadata fills in when discovery had none.
    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.task.published_at.or(self.metadata.published_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    pub task: VideoTask,
    pub handle: String,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Succeeded,
    Failed,
    Unverified,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Unverified => "unverified",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result for one task. Exactly one is produced per task handed to
/// the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub task: VideoTask,
    pub kind: OutcomeKind,
    pub handle: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl ItemOutcome {
    pub fn succeeded(record: &UploadRecord, published_at: Option<DateTime<Utc>>) -> Self {
        Self {
            task: record.task.clone(),
            kind: OutcomeKind::Succeeded,
            handle: Some(record.handle.clone()),
            published_at,
            reason: None,
        }
    }

    pub fn unverified(
        record: &UploadRecord,
        published_at: Option<DateTime<Utc>>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            task: record.task.clone(),
            kind: OutcomeKind::Unverified,
            handle: Some(record.handle.clone()),
            published_at,
            reason: Some(reason.into()),
        }
    }

    pub fn failed(task: VideoTask, reason: impl Into<String>) -> Self {
        let published_at = task.published_at;
        Self {
            task,
            kind: OutcomeKind::Failed,
            handle: None,
            published_at,
            reason: Some(reason.into()),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.task.identifier
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub unverified: usize,
}

impl RunSummary {
    pub fn record(&mut self, kind: OutcomeKind) {
        match kind {
            OutcomeKind::Succeeded => self.succeeded += 1,
            OutcomeKind::Failed => self.failed += 1,
            OutcomeKind::Unverified => self.unverified += 1,
        }
    }

    pub fn merge(&mut self, other: &RunSummary) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.unverified += other.unverified;
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.unverified
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} unverified",
            self.succeeded, self.failed, self.unverified
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelProfile {
    pub id: String,
    pub name: String,
    pub description: String,
    pub logo_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Download,
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId {
    pub stage: Stage,
    pub index: usize,
}

impl SlotId {
    pub fn download(index: usize) -> Self {
        Self {
            stage: Stage::Download,
            index,
        }
    }

    pub fn upload(index: usize) -> Self {
        Self {
            stage: Stage::Upload,
            index,
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self.stage {
            Stage::Download => "download",
            Stage::Upload => "upload",
        };
        write!(f, "{stage}-{}", self.index + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Downloading,
    Uploading,
    WaitingForEncoding,
    Stopped,
}

impl WorkerStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Downloading => "downloading",
            Self::Uploading => "uploading",
            Self::WaitingForEncoding => "waiting-encoding",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerState {
    pub slot: SlotId,
    pub current_item: Option<String>,
    pub status: WorkerStatus,
}
