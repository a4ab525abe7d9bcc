#![forbid(unsafe_code)]

//! Video acquisition through yt-dlp.
//!
//! One yt-dlp process per video writes the merged mp4, its info JSON and a
//! thumbnail into the staging directory. The info JSON is then normalized into
//! [`Metadata`] and persisted as `metadata.json`.

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::{
    collections::BTreeSet,
    fs,
    path::PathBuf,
    process::{Command as StdCommand, Stdio},
};
use tokio::process::Command;
use tracing::{debug, info};

use crate::{
    error::SourceError,
    model::{DownloadResult, Metadata, VideoTask},
    staging::StagingArea,
};

pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
const FORMAT_SELECTOR: &str = "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best";
const STDERR_TAIL_CHARS: usize = 400;

#[async_trait]
pub trait VideoSource: Send + Sync {
    async fn resolve(&self, task: &VideoTask) -> Result<DownloadResult, SourceError>;
}

pub fn watch_url(identifier: &str) -> String {
    format!("https://www.youtube.com/watch?v={identifier}")
}

/// Runs `<name> --version` to fail loudly when yt-dlp is missing.
pub fn ensure_program_available(name: &str) -> Result<()> {
    let status = StdCommand::new(name)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!("{} is installed but returned a failure status", name),
        Err(err) => bail!("{} is not installed or not in PATH: {}", name, err),
    }
}

#[derive(Debug, Clone)]
pub struct YtDlpSource {
    binary: PathBuf,
    staging: StagingArea,
}

impl YtDlpSource {
    pub fn new(binary: impl Into<PathBuf>, staging: StagingArea) -> Self {
        Self {
            binary: binary.into(),
            staging,
        }
    }

    fn command(&self, task: &VideoTask, dir: &std::path::Path) -> Command {
        let output = dir.join(format!("{}.%(ext)s", task.identifier));
        let mut command = Command::new(&self.binary);
        command
            .arg("--ignore-config")
            .arg("--no-colors")
            .arg("--no-progress")
            .arg("--format")
            .arg(FORMAT_SELECTOR)
            .arg("--merge-output-format")
            .arg("mp4")
            .arg("--write-info-json")
            .arg("--write-thumbnail")
            .arg("--convert-thumbnails")
            .arg("jpg")
            .arg("--continue")
            .arg("--no-overwrites")
            .arg("--output")
            .arg(output);
        if let Some(cookies) = self.staging.cookies_path() {
            command.arg("--cookies").arg(cookies);
        }
        command
            .arg(watch_url(&task.identifier))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn finalize(&self, task: &VideoTask) -> Result<DownloadResult, SourceError> {
        let id = &task.identifier;
        let media_path = self
            .staging
            .find_media(id)
            .ok_or_else(|| SourceError::Invalid(format!("{id}: no non-empty mp4 produced")))?;
        let info_path = self
            .staging
            .find_info_json(id)
            .ok_or_else(|| SourceError::Invalid(format!("{id}: info JSON missing")))?;
        let raw = fs::read_to_string(&info_path)
            .map_err(|err| SourceError::Transient(format!("reading {}: {err}", info_path.display())))?;
        let metadata = parse_info_json(&raw)?;
        self.staging
            .write_metadata(id, &metadata)
            .map_err(|err| SourceError::Transient(format!("{id}: writing metadata: {err}")))?;
        Ok(DownloadResult {
            task: task.clone(),
            media_path,
            thumbnail_path: self.staging.find_thumbnail(id),
            metadata,
        })
    }
}

#[async_trait]
impl VideoSource for YtDlpSource {
    async fn resolve(&self, task: &VideoTask) -> Result<DownloadResult, SourceError> {
        if let Some(existing) = self.staging.completed_download(task) {
            info!(video = %task.identifier, "reusing staged download");
            return Ok(existing);
        }
        let dir = self
            .staging
            .create_dir_for(&task.identifier)
            .map_err(|err| SourceError::Transient(format!("creating staging dir: {err}")))?;
        if self.staging.has_partial(&task.identifier) {
            debug!(video = %task.identifier, "resuming partial download");
        }

        let output = self
            .command(task, &dir)
            .output()
            .await
            .map_err(|err| SourceError::Transient(format!("spawning yt-dlp: {err}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr));
        }
        self.finalize(task)
    }
}

/// Maps yt-dlp's stderr onto the error taxonomy.
pub fn classify_failure(stderr: &str) -> SourceError {
    let lowered = stderr.to_ascii_lowercase();
    let detail = stderr_tail(stderr);
    const NOT_FOUND: &[&str] = &[
        "video unavailable",
        "private video",
        "has been removed",
        "does not exist",
        "this video is unavailable",
        "account associated with this video has been terminated",
    ];
    const RATE_LIMITED: &[&str] = &[
        "http error 429",
        "too many requests",
        "rate limit",
        "sign in to confirm",
    ];
    if NOT_FOUND.iter().any(|needle| lowered.contains(needle)) {
        SourceError::NotFound(detail)
    } else if RATE_LIMITED.iter().any(|needle| lowered.contains(needle)) {
        SourceError::RateLimited(detail)
    } else {
        SourceError::Transient(detail)
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - STDERR_TAIL_CHARS).collect()
}

/// Subset of yt-dlp's info JSON consumed here.
#[derive(Debug, Deserialize)]
struct InfoJson {
    #[serde(default)]
    fulltitle: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    upload_date: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    release_timestamp: Option<i64>,
    #[serde(default)]
    duration: Option<f64>,
}

pub fn parse_info_json(raw: &str) -> Result<Metadata, SourceError> {
    let info: InfoJson = serde_json::from_str(raw)
        .map_err(|err| SourceError::Invalid(format!("info JSON does not parse: {err}")))?;
    let title = info
        .fulltitle
        .filter(|value| !value.trim().is_empty())
        .or(info.title)
        .unwrap_or_default()
        .trim()
        .to_string();
    let tags: BTreeSet<String> = info
        .tags
        .unwrap_or_default()
        .into_iter()
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect();
    let published_at = info
        .release_timestamp
        .or(info.timestamp)
        .and_then(timestamp_to_utc)
        .or_else(|| info.upload_date.as_deref().and_then(upload_date_to_utc));
    let duration_sec = info
        .duration
        .filter(|value| value.is_finite() && *value > 0.0)
        .map(|value| value.round() as u64)
        .unwrap_or(0);
    let metadata = Metadata {
        title,
        description: info.description.unwrap_or_default(),
        tags,
        published_at,
        duration_sec,
    };
    metadata.validate()?;
    Ok(metadata)
}

/// Converts yt-dlp's `YYYYMMDD` upload date into midnight UTC.
pub fn upload_date_to_utc(value: &str) -> Option<DateTime<Utc>> {
    if value.len() != 8 {
        return None;
    }
    let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

fn timestamp_to_utc(timestamp: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;

    const INFO_JSON: &str = r#"{
  "id": "alpha",
  "fulltitle": "Alpha Title",
  "title": "Alpha",
  "description": "Sample description",
  "upload_date": "20240101",
  "duration": 120.4,
  "tags": ["tech", "rust", "tech", " "]
}"#;

    fn install_stub(dir: &Path, body: &str) -> PathBuf {
        let script_path = dir.join("yt-dlp");
        let script = format!(
            r#"#!/usr/bin/env bash
set -eu
output=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    --output)
      shift
      output="$1"
      ;;
  esac
  shift
done
base="${{output//.%(ext)s/}}"
{body}
"#
        );
        fs::write(&script_path, script).unwrap();
        #[cfg(unix)]
        {
            let mut perms = fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&script_path, perms).unwrap();
        }
        script_path
    }

    fn successful_stub(dir: &Path) -> PathBuf {
        install_stub(
            dir,
            &format!(
                "mkdir -p \"$(dirname \"$base\")\"\necho video > \"$base.mp4\"\necho thumb > \"$base.jpg\"\ncat > \"$base.info.json\" <<'JSON'\n{INFO_JSON}\nJSON\n"
            ),
        )
    }

    #[test]
    fn info_json_is_normalized() {
        let metadata = parse_info_json(INFO_JSON).unwrap();
        assert_eq!(metadata.title, "Alpha Title");
        assert_eq!(metadata.description, "Sample description");
        assert_eq!(
            metadata.tags.iter().cloned().collect::<Vec<_>>(),
            vec!["rust", "tech"]
        );
        assert_eq!(metadata.duration_sec, 120);
        assert_eq!(
            metadata.published_at.unwrap().to_rfc3339(),
            "2024-01-01T00:00:00+00:00"
        );
    }

    #[test]
    fn release_timestamp_beats_upload_date() {
        let metadata = parse_info_json(
            r#"{"title": "T", "upload_date": "20240101", "release_timestamp": 1700000000}"#,
        )
        .unwrap();
        assert_eq!(metadata.published_at.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(metadata.duration_sec, 0);
    }

    #[test]
    fn info_json_without_title_is_invalid() {
        assert!(matches!(
            parse_info_json(r#"{"description": "x"}"#),
            Err(SourceError::Invalid(_))
        ));
        assert!(matches!(
            parse_info_json("not json"),
            Err(SourceError::Invalid(_))
        ));
    }

    #[test]
    fn upload_date_rejects_garbage() {
        assert!(upload_date_to_utc("2024").is_none());
        assert!(upload_date_to_utc("20241340").is_none());
    }

    #[test]
    fn stderr_is_classified() {
        assert!(matches!(
            classify_failure("ERROR: [youtube] abc: Video unavailable"),
            SourceError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure("ERROR: [youtube] abc: Private video. Sign in if you've been granted access"),
            SourceError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure("ERROR: unable to download webpage: HTTP Error 429: Too Many Requests"),
            SourceError::RateLimited(_)
        ));
        assert!(matches!(
            classify_failure("ERROR: Sign in to confirm you're not a bot"),
            SourceError::RateLimited(_)
        ));
        assert!(matches!(
            classify_failure("ERROR: Connection reset by peer"),
            SourceError::Transient(_)
        ));
    }

    #[test]
    fn long_stderr_is_truncated_to_tail() {
        let noisy = format!("{}END", "x".repeat(1000));
        let SourceError::Transient(detail) = classify_failure(&noisy) else {
            panic!("expected transient");
        };
        assert_eq!(detail.chars().count(), STDERR_TAIL_CHARS);
        assert!(detail.ends_with("END"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_downloads_and_writes_metadata() {
        let temp = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(temp.path().join("staging"));
        staging.prepare().unwrap();
        let source = YtDlpSource::new(successful_stub(temp.path()), staging.clone());
        let task = VideoTask::new("alpha", None, None).unwrap();

        let result = source.resolve(&task).await.unwrap();
        assert_eq!(result.media_path, staging.dir_for("alpha").join("alpha.mp4"));
        assert_eq!(
            result.thumbnail_path,
            Some(staging.dir_for("alpha").join("alpha.jpg"))
        );
        assert_eq!(result.metadata.title, "Alpha Title");
        assert_eq!(staging.read_metadata("alpha"), Some(result.metadata));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_reuses_finished_download_without_running_ytdlp() {
        let temp = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(temp.path().join("staging"));
        let dir = staging.create_dir_for("alpha").unwrap();
        fs::write(dir.join("alpha.mp4"), b"video").unwrap();
        staging
            .write_metadata("alpha", &parse_info_json(INFO_JSON).unwrap())
            .unwrap();
        let failing = install_stub(temp.path(), "echo 'should not run' >&2\nexit 1");
        let source = YtDlpSource::new(failing, staging);
        let task = VideoTask::new("alpha", None, None).unwrap();

        let result = source.resolve(&task).await.unwrap();
        assert_eq!(result.metadata.title, "Alpha Title");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_reports_unavailable_video() {
        let temp = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(temp.path().join("staging"));
        let stub = install_stub(
            temp.path(),
            "echo 'ERROR: [youtube] gone: Video unavailable' >&2\nexit 1",
        );
        let source = YtDlpSource::new(stub, staging);
        let task = VideoTask::new("gone", None, None).unwrap();
        assert!(matches!(
            source.resolve(&task).await,
            Err(SourceError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_rejects_missing_media() {
        let temp = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(temp.path().join("staging"));
        let stub = install_stub(temp.path(), "mkdir -p \"$(dirname \"$base\")\"\nexit 0");
        let source = YtDlpSource::new(stub, staging);
        let task = VideoTask::new("empty", None, None).unwrap();
        assert!(matches!(
            source.resolve(&task).await,
            Err(SourceError::Invalid(_))
        ));
    }
}
