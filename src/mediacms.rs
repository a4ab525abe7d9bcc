#![forbid(unsafe_code)]

//! MediaCMS destination: uploads, encoding status and channel profile.
//!
//! Every request carries `Authorization: Token <token>`. HTTP failures are
//! mapped onto [`SinkError`] so the pipeline can tell a bad credential (stop
//! everything) from a rejected file (fail one item) from a flaky server
//! (retry).

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{
    Client, RequestBuilder, Response, StatusCode,
    multipart::{Form, Part},
};
use serde::Deserialize;
use serde_json::Value;
use std::{path::Path, sync::Arc, time::Duration};
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::{
    encoding::{EncodingLadder, EncodingSnapshot, ResolutionState},
    error::SinkError,
    model::{ChannelProfile, DownloadResult},
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT_CAP: Duration = Duration::from_secs(3600);
const BYTES_PER_MIB: u64 = 1024 * 1024;
const BODY_SNIPPET_CHARS: usize = 300;

/// Upload and status polling, the two calls the upload pool needs.
#[async_trait]
pub trait UploadSink: Send + Sync {
    /// Returns the destination handle for the new item.
    async fn upload(&self, download: &DownloadResult) -> Result<String, SinkError>;
    async fn poll_status(&self, handle: &str) -> Result<EncodingSnapshot, SinkError>;
}

/// Account-level calls made once per channel around the pipeline.
#[async_trait]
pub trait DestinationAccount: Send + Sync {
    async fn username(&self) -> Result<String, SinkError>;
    async fn latest_upload_date(&self) -> Result<Option<DateTime<Utc>>, SinkError>;
    async fn update_profile(&self, profile: &ChannelProfile) -> Result<(), SinkError>;
}

#[derive(Clone)]
pub struct DestinationLink {
    pub sink: Arc<dyn UploadSink>,
    pub account: Arc<dyn DestinationAccount>,
}

/// Opens a destination for one channel's token.
pub trait DestinationConnector: Send + Sync {
    fn connect(&self, token: &str) -> Result<DestinationLink>;
}

#[derive(Debug, Clone)]
pub struct MediaCmsConnector {
    http: Client,
    base_url: String,
}

impl MediaCmsConnector {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .context("building MediaCMS HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl DestinationConnector for MediaCmsConnector {
    fn connect(&self, token: &str) -> Result<DestinationLink> {
        let client = Arc::new(MediaCmsClient::with_client(
            self.http.clone(),
            &self.base_url,
            token,
        ));
        Ok(DestinationLink {
            sink: client.clone(),
            account: client,
        })
    }
}

#[derive(Debug)]
pub struct MediaCmsClient {
    http: Client,
    base_url: String,
    token: String,
    username: OnceCell<String>,
}

impl MediaCmsClient {
    pub fn with_client(http: Client, base_url: &str, token: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            username: OnceCell::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("Authorization", format!("Token {}", self.token))
            .header("Accept", "application/json")
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, SinkError> {
        let response = self
            .authorized(builder)
            .send()
            .await
            .map_err(|err| SinkError::Transient(format!("request failed: {err}")))?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }

    async fn json<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, SinkError> {
        response
            .json::<T>()
            .await
            .map_err(|err| SinkError::Transient(format!("decoding response: {err}")))
    }

    async fn fetch_logo(&self, url: &str) -> Option<Part> {
        let response = match self.http.get(url).timeout(REQUEST_TIMEOUT).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(status = %response.status(), "logo fetch failed; updating profile without it");
                return None;
            }
            Err(err) => {
                warn!(%err, "logo fetch failed; updating profile without it");
                return None;
            }
        };
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let bytes = response.bytes().await.ok()?;
        Part::bytes(bytes.to_vec())
            .file_name("logo.jpg")
            .mime_str(&mime)
            .ok()
    }
}

#[async_trait]
impl UploadSink for MediaCmsClient {
    async fn upload(&self, download: &DownloadResult) -> Result<String, SinkError> {
        let media = &download.media_path;
        let file = tokio::fs::File::open(media)
            .await
            .map_err(|err| SinkError::Rejected(format!("opening {}: {err}", media.display())))?;
        let size = file
            .metadata()
            .await
            .map_err(|err| SinkError::Rejected(format!("reading {}: {err}", media.display())))?
            .len();
        let media_part = Part::stream_with_length(
            reqwest::Body::wrap_stream(ReaderStream::new(file)),
            size,
        )
        .file_name(file_name(media))
        .mime_str(&mime_for(media))
        .map_err(|err| SinkError::Rejected(format!("media content type: {err}")))?;

        let metadata = &download.metadata;
        let mut form = Form::new()
            .part("media_file", media_part)
            .text("title", metadata.title.clone())
            .text("description", metadata.description.clone());
        if !metadata.tags.is_empty() {
            let tags: Vec<&str> = metadata.tags.iter().map(String::as_str).collect();
            form = form.text("tags", tags.join(","));
        }
        if let Some(published) = download.published_at() {
            form = form.text(
                "publication_date",
                published.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
        }
        if let Some(thumbnail) = &download.thumbnail_path {
            match tokio::fs::read(thumbnail).await {
                Ok(bytes) => {
                    let part = Part::bytes(bytes)
                        .file_name(file_name(thumbnail))
                        .mime_str(&mime_for(thumbnail))
                        .map_err(|err| SinkError::Rejected(format!("thumbnail content type: {err}")))?;
                    form = form.part("thumbnail", part);
                }
                Err(err) => warn!(video = %download.task.identifier, %err, "skipping unreadable thumbnail"),
            }
        }

        let timeout = upload_timeout(size);
        info!(
            video = %download.task.identifier,
            size_mib = size / BYTES_PER_MIB,
            timeout_secs = timeout.as_secs(),
            "uploading to MediaCMS"
        );
        let request = self
            .http
            .post(self.url("/api/v1/media/"))
            .multipart(form)
            .timeout(timeout);
        let response = self.send(request).await?;
        // A 2xx means the file is stored; nothing past this point may be retried.
        let body: UploadResponse = response.json().await.map_err(|err| {
            SinkError::Rejected(format!("upload accepted but response unreadable: {err}"))
        })?;
        body.friendly_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| SinkError::Rejected("upload response carried no friendly_token".into()))
    }

    async fn poll_status(&self, handle: &str) -> Result<EncodingSnapshot, SinkError> {
        let request = self
            .http
            .get(self.url(&format!("/api/v1/media/{handle}")))
            .timeout(REQUEST_TIMEOUT);
        let response = self.send(request).await?;
        let detail: MediaDetail = Self::json(response).await?;
        Ok(detail.snapshot())
    }
}

#[async_trait]
impl DestinationAccount for MediaCmsClient {
    async fn username(&self) -> Result<String, SinkError> {
        self.username
            .get_or_try_init(|| async {
                let request = self
                    .http
                    .get(self.url("/api/v1/whoami"))
                    .timeout(REQUEST_TIMEOUT);
                let response = self.send(request).await?;
                let whoami: WhoAmI = Self::json(response).await?;
                whoami
                    .username
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| SinkError::Auth("whoami returned no username".into()))
            })
            .await
            .cloned()
    }

    async fn latest_upload_date(&self) -> Result<Option<DateTime<Utc>>, SinkError> {
        let username = self.username().await?;
        let request = self
            .http
            .get(self.url("/api/v1/media/"))
            .query(&[("author", username.as_str()), ("show", "latest")])
            .timeout(REQUEST_TIMEOUT);
        let response = self.send(request).await?;
        let listing: MediaListing = Self::json(response).await?;
        Ok(listing
            .results
            .into_iter()
            .next()
            .and_then(|item| item.add_date)
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|date| date.with_timezone(&Utc)))
    }

    async fn update_profile(&self, profile: &ChannelProfile) -> Result<(), SinkError> {
        let username = self.username().await?;
        let mut form = Form::new()
            .text("name", profile.name.clone())
            .text("description", profile.description.clone());
        if let Some(logo_url) = &profile.logo_url
            && let Some(logo) = self.fetch_logo(logo_url).await
        {
            form = form.part("logo", logo);
        }
        let request = self
            .http
            .post(self.url(&format!("/api/v1/users/{username}")))
            .multipart(form)
            .timeout(REQUEST_TIMEOUT);
        self.send(request).await?;
        debug!(%username, "profile updated");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    friendly_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhoAmI {
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaListing {
    #[serde(default)]
    results: Vec<MediaSummary>,
}

#[derive(Debug, Deserialize)]
struct MediaSummary {
    #[serde(default)]
    add_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaDetail {
    #[serde(default)]
    encoding_status: Option<String>,
    #[serde(default)]
    encodings_info: Option<Value>,
}

impl MediaDetail {
    fn snapshot(&self) -> EncodingSnapshot {
        let overall = self
            .encoding_status
            .as_deref()
            .and_then(ResolutionState::from_server);
        let mut ladder = EncodingLadder::new();
        if let Some(Value::Object(heights)) = &self.encodings_info {
            for (height, codecs) in heights {
                let Some(codecs) = codecs.as_object() else {
                    continue;
                };
                // Heights the server will not produce come back as `{}`.
                let entry = codecs
                    .get("h264")
                    .or_else(|| codecs.values().next())
                    .and_then(Value::as_object);
                let Some(status) = entry
                    .and_then(|entry| entry.get("status"))
                    .and_then(Value::as_str)
                    .and_then(ResolutionState::from_server)
                else {
                    continue;
                };
                ladder.observe(format!("{height}p"), status);
            }
        }
        EncodingSnapshot { overall, ladder }
    }
}

/// 30 s plus one second per MiB, capped at one hour.
pub fn upload_timeout(size_bytes: u64) -> Duration {
    (REQUEST_TIMEOUT + Duration::from_secs(size_bytes / BYTES_PER_MIB)).min(UPLOAD_TIMEOUT_CAP)
}

fn status_error(status: StatusCode, body: &str) -> SinkError {
    let snippet: String = body.trim().chars().take(BODY_SNIPPET_CHARS).collect();
    let detail = format!("HTTP {}: {snippet}", status.as_u16());
    let mentions_quota = body.to_ascii_lowercase().contains("quota");
    match status.as_u16() {
        401 | 403 if mentions_quota => SinkError::QuotaExceeded(detail),
        401 | 403 => SinkError::Auth(detail),
        429 => SinkError::QuotaExceeded(detail),
        _ if status.is_client_error() && mentions_quota => SinkError::QuotaExceeded(detail),
        _ if status.is_client_error() => SinkError::Rejected(detail),
        _ => SinkError::Transient(detail),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("upload.bin")
        .to_string()
}

fn mime_for(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
