#![forbid(unsafe_code)]

//! Channel listing and profile lookup through the YouTube Data API v3.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::{error::DiscoveryError, model::ChannelProfile};

pub const YOUTUBE_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const PAGE_SIZE: &str = "50";
const MAX_PAGES: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedVideo {
    pub identifier: String,
    pub published_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Videos published after `since`, oldest first.
    async fn list_videos(
        &self,
        channel_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ListedVideo>, DiscoveryError>;

    async fn channel_profile(&self, channel_id: &str) -> Result<ChannelProfile, DiscoveryError>;
}

/// Pulls the channel id out of `/channel/<ID>` URLs, falling back to the last
/// path segment. Handles (`@name`) are passed through untouched.
pub fn extract_channel_id(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let without_query = trimmed
        .split(['?', '#'])
        .next()
        .unwrap_or(trimmed);
    let segments: Vec<&str> = without_query
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    if let Some(pos) = segments.iter().position(|segment| *segment == "channel")
        && let Some(id) = segments.get(pos + 1)
    {
        return (*id).to_string();
    }
    segments
        .iter()
        .rev()
        .find(|segment| !matches!(**segment, "videos" | "streams" | "shorts" | "featured"))
        .map(|segment| (*segment).to_string())
        .unwrap_or_else(|| without_query.to_string())
}

/// Keeps entries strictly newer than `since` and orders them oldest first.
/// Entries without a timestamp sort first.
pub fn order_oldest_first(
    mut videos: Vec<ListedVideo>,
    since: Option<DateTime<Utc>>,
) -> Vec<ListedVideo> {
    if let Some(cutoff) = since {
        videos.retain(|video| video.published_at.is_none_or(|published| published > cutoff));
    }
    videos.sort_by_key(|video| video.published_at);
    videos
}

#[derive(Debug, Clone)]
pub struct YouTubeApi {
    http: Client,
    base_url: String,
    api_key: String,
}

impl YouTubeApi {
    pub fn new(api_key: &str) -> Result<Self> {
        Self::with_base_url(YOUTUBE_API_BASE, api_key)
    }

    pub fn with_base_url(base_url: &str, api_key: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building YouTube HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<T, DiscoveryError> {
        let response = self
            .http
            .get(format!("{}/{endpoint}", self.base_url))
            .query(query)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|err| DiscoveryError::Transient(format!("{endpoint}: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        response
            .json::<T>()
            .await
            .map_err(|err| DiscoveryError::Malformed(format!("{endpoint}: {err}")))
    }
}

#[async_trait]
impl Discovery for YouTubeApi {
    async fn list_videos(
        &self,
        channel_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ListedVideo>, DiscoveryError> {
        let published_after = since.map(|cutoff| cutoff.to_rfc3339_opts(SecondsFormat::Secs, true));
        let mut videos = Vec::new();
        let mut page_token: Option<String> = None;
        for page in 0..MAX_PAGES {
            let mut query = vec![
                ("part", "snippet"),
                ("channelId", channel_id),
                ("order", "date"),
                ("type", "video"),
                ("maxResults", PAGE_SIZE),
            ];
            if let Some(after) = published_after.as_deref() {
                query.push(("publishedAfter", after));
            }
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }
            let response: SearchResponse = self.get("search", &query).await?;
            debug!(channel = channel_id, page, items = response.items.len(), "listed search page");
            videos.extend(response.items.into_iter().filter_map(SearchItem::into_listed));
            match response.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }
        Ok(order_oldest_first(videos, since))
    }

    async fn channel_profile(&self, channel_id: &str) -> Result<ChannelProfile, DiscoveryError> {
        let response: ChannelsResponse = self
            .get("channels", &[("part", "snippet"), ("id", channel_id)])
            .await?;
        let item = response
            .items
            .into_iter()
            .next()
            .ok_or_else(|| DiscoveryError::NotFound(channel_id.to_string()))?;
        let thumbnails = item.snippet.thumbnails.unwrap_or_default();
        let logo_url = thumbnails
            .high
            .or(thumbnails.medium)
            .or(thumbnails.default)
            .map(|thumb| thumb.url);
        Ok(ChannelProfile {
            id: item.id,
            name: item.snippet.title,
            description: item.snippet.description,
            logo_url,
        })
    }
}

fn status_error(status: StatusCode, body: &str) -> DiscoveryError {
    let snippet: String = body.trim().chars().take(300).collect();
    let detail = format!("HTTP {}: {snippet}", status.as_u16());
    match status.as_u16() {
        403 if body.contains("quotaExceeded") || body.contains("dailyLimitExceeded") => {
            DiscoveryError::QuotaExceeded(detail)
        }
        400 | 401 | 403 => DiscoveryError::Auth(detail),
        404 => DiscoveryError::NotFound(detail),
        429 => DiscoveryError::Transient(detail),
        _ if status.is_server_error() => DiscoveryError::Transient(detail),
        _ => DiscoveryError::Malformed(detail),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchId,
    #[serde(default)]
    snippet: Option<SearchSnippet>,
}

impl SearchItem {
    fn into_listed(self) -> Option<ListedVideo> {
        let identifier = self.id.video_id?;
        let published_at = self
            .snippet
            .and_then(|snippet| snippet.published_at)
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|date| date.with_timezone(&Utc));
        Some(ListedVideo {
            identifier,
            published_at,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchId {
    #[serde(default)]
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchSnippet {
    #[serde(default)]
    published_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelsResponse {
    #[serde(default)]
    items: Vec<ChannelItem>,
}

#[derive(Debug, Deserialize)]
struct ChannelItem {
    id: String,
    snippet: ChannelSnippet,
}

#[derive(Debug, Deserialize)]
struct ChannelSnippet {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    thumbnails: Option<Thumbnails>,
}

#[derive(Debug, Default, Deserialize)]
struct Thumbnails {
    #[serde(default)]
    default: Option<Thumbnail>,
    #[serde(default)]
    medium: Option<Thumbnail>,
    #[serde(default)]
    high: Option<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path, query_param, query_param_is_missing},
    };

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn channel_id_extraction() {
        assert_eq!(
            extract_channel_id("https://www.youtube.com/channel/UCabc123/videos"),
            "UCabc123"
        );
        assert_eq!(
            extract_channel_id("https://www.youtube.com/channel/UCabc123?view=0"),
            "UCabc123"
        );
        assert_eq!(extract_channel_id("https://www.youtube.com/@handle/"), "@handle");
        assert_eq!(extract_channel_id("UCbare"), "UCbare");
    }

    #[test]
    fn listing_is_filtered_and_sorted() {
        let videos = vec![
            ListedVideo { identifier: "c".into(), published_at: Some(at(3)) },
            ListedVideo { identifier: "a".into(), published_at: Some(at(1)) },
            ListedVideo { identifier: "b".into(), published_at: Some(at(2)) },
        ];
        let ids: Vec<_> = order_oldest_first(videos, Some(at(1)))
            .into_iter()
            .map(|video| video.identifier)
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn list_videos_follows_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("channelId", "UCchan"))
            .and(query_param("key", "k"))
            .and(query_param_is_missing("pageToken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "nextPageToken": "p2",
                "items": [
                    {"id": {"videoId": "newest"}, "snippet": {"publishedAt": "2024-01-03T12:00:00Z"}},
                    {"id": {"kind": "youtube#playlist"}}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"id": {"videoId": "oldest"}, "snippet": {"publishedAt": "2024-01-01T12:00:00Z"}}
                ]
            })))
            .mount(&server)
            .await;
        let api = YouTubeApi::with_base_url(&server.uri(), "k").unwrap();
        let videos = api.list_videos("UCchan", None).await.unwrap();
        let ids: Vec<_> = videos.iter().map(|video| video.identifier.as_str()).collect();
        assert_eq!(ids, vec!["oldest", "newest"]);
        assert_eq!(videos[0].published_at, Some(at(1)));
    }

    #[tokio::test]
    async fn list_videos_passes_cutoff() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("publishedAfter", "2024-01-02T12:00:00Z"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"id": {"videoId": "edge"}, "snippet": {"publishedAt": "2024-01-02T12:00:00Z"}},
                    {"id": {"videoId": "fresh"}, "snippet": {"publishedAt": "2024-01-03T12:00:00Z"}}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        let api = YouTubeApi::with_base_url(&server.uri(), "k").unwrap();
        let videos = api.list_videos("UCchan", Some(at(2))).await.unwrap();
        assert_eq!(videos.len(), 1);
        assert_eq!(videos[0].identifier, "fresh");
    }

    #[tokio::test]
    async fn quota_errors_are_systemic() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": {"errors": [{"reason": "quotaExceeded"}], "code": 403}
            })))
            .mount(&server)
            .await;
        let api = YouTubeApi::with_base_url(&server.uri(), "k").unwrap();
        assert!(matches!(
            api.list_videos("UCchan", None).await,
            Err(DiscoveryError::QuotaExceeded(_))
        ));
    }

    #[tokio::test]
    async fn channel_profile_prefers_high_thumbnail() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channels"))
            .and(query_param("id", "UCchan"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{
                    "id": "UCchan",
                    "snippet": {
                        "title": "Channel",
                        "description": "About",
                        "thumbnails": {
                            "default": {"url": "https://img/default.jpg"},
                            "high": {"url": "https://img/high.jpg"}
                        }
                    }
                }]
            })))
            .mount(&server)
            .await;
        let api = YouTubeApi::with_base_url(&server.uri(), "k").unwrap();
        let profile = api.channel_profile("UCchan").await.unwrap();
        assert_eq!(profile.name, "Channel");
        assert_eq!(profile.logo_url.as_deref(), Some("https://img/high.jpg"));

        assert!(matches!(
            api.channel_profile("UCother").await,
            Err(DiscoveryError::NotFound(_))
        ));
    }
}
