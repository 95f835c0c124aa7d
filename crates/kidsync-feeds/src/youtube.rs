//! YouTube Data API client: channel resolution, video search and comment threads.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kidsync_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::google::apply_credential;
use crate::{
    classify_fetch_error, json_at, json_i64, json_str, CommentThread, GoogleAuth, RawComment,
    SearchError, VideoHit, VideoPlatform,
};

pub const YOUTUBE_API_BASE: &str = "https://www.googleapis.com/youtube/v3";

const SERVICE: &str = "youtube";

pub fn embed_url(video_id: &str) -> String {
    format!("https://www.youtube.com/embed/{video_id}")
}

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

#[derive(Debug, Clone)]
pub struct YouTubeClient {
    http: HttpFetcher,
    auth: Arc<GoogleAuth>,
    base_url: String,
}

impl YouTubeClient {
    pub fn new(auth: Arc<GoogleAuth>, timeout: Duration) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: None,
            backoff: BackoffPolicy::none(),
        })?;
        Ok(Self {
            http,
            auth,
            base_url: YOUTUBE_API_BASE.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn call(
        &self,
        resource: &str,
        mut params: Vec<(&'static str, String)>,
    ) -> Result<JsonValue, SearchError> {
        let credential = self.auth.credential().await?;
        let bearer = apply_credential(&credential, &mut params);
        let url = format!("{}/{resource}", self.base_url);
        self.http
            .get_json(&url, &params, bearer.as_deref())
            .await
            .map_err(|e| classify_fetch_error(SERVICE, e))
    }
}

fn items(body: &JsonValue) -> &[JsonValue] {
    body.get("items")
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

pub fn parse_channel_id(body: &JsonValue) -> Option<String> {
    items(body)
        .iter()
        .find_map(|item| json_str(item, &["id"]))
        .map(str::to_string)
}

pub fn parse_video_hits(body: &JsonValue) -> Vec<VideoHit> {
    items(body)
        .iter()
        .map(|item| VideoHit {
            video_id: json_str(item, &["id", "videoId"]).unwrap_or_default().to_string(),
            title: json_str(item, &["snippet", "title"]).unwrap_or_default().to_string(),
            thumbnail_url: json_str(item, &["snippet", "thumbnails", "medium", "url"])
                .unwrap_or_default()
                .to_string(),
            channel_title: json_str(item, &["snippet", "channelTitle"])
                .unwrap_or_default()
                .to_string(),
        })
        .filter(|v| !v.video_id.is_empty())
        .collect()
}

fn parse_comment(value: &JsonValue) -> Option<RawComment> {
    let comment_id = json_str(value, &["id"])?.to_string();
    let snippet = value.get("snippet")?;
    let published_at = json_str(snippet, &["publishedAt"])
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))?;
    Some(RawComment {
        comment_id,
        author_name: json_str(snippet, &["authorDisplayName"])
            .unwrap_or_default()
            .to_string(),
        author_channel_id: json_str(snippet, &["authorChannelId", "value"]).map(str::to_string),
        author_profile_url: json_str(snippet, &["authorProfileImageUrl"]).map(str::to_string),
        text_display: json_str(snippet, &["textDisplay"])
            .unwrap_or_default()
            .to_string(),
        like_count: json_i64(snippet, &["likeCount"]).unwrap_or(0),
        published_at,
    })
}

/// Threads whose top-level comment cannot be read are dropped with their replies.
pub fn parse_comment_threads(body: &JsonValue) -> Vec<CommentThread> {
    items(body)
        .iter()
        .filter_map(|item| {
            let top = parse_comment(json_at(item, &["snippet", "topLevelComment"])?)?;
            let replies = json_at(item, &["replies", "comments"])
                .and_then(JsonValue::as_array)
                .map(|list| list.iter().filter_map(parse_comment).collect())
                .unwrap_or_default();
            Some(CommentThread { top, replies })
        })
        .collect()
}

#[async_trait]
impl VideoPlatform for YouTubeClient {
    async fn resolve_channel(&self, handle: &str) -> Result<Option<String>, SearchError> {
        let body = self
            .call(
                "channels",
                vec![("part", "id".to_string()), ("forHandle", handle.to_string())],
            )
            .await?;
        let channel_id = parse_channel_id(&body);
        debug!(handle, ?channel_id, "resolved channel handle");
        Ok(channel_id)
    }

    async fn search_videos(
        &self,
        query: &str,
        channel_id: Option<&str>,
        max_results: u32,
    ) -> Result<Vec<VideoHit>, SearchError> {
        let mut params = vec![
            ("part", "snippet".to_string()),
            ("q", query.to_string()),
            ("type", "video".to_string()),
            ("maxResults", max_results.to_string()),
            ("videoEmbeddable", "true".to_string()),
            ("videoDuration", "medium".to_string()),
            ("relevanceLanguage", "he".to_string()),
            ("safeSearch", "strict".to_string()),
        ];
        if let Some(channel_id) = channel_id {
            params.push(("channelId", channel_id.to_string()));
        }
        let body = self.call("search", params).await?;
        Ok(parse_video_hits(&body))
    }

    async fn comment_threads(
        &self,
        video_id: &str,
        max_results: u32,
    ) -> Result<Vec<CommentThread>, SearchError> {
        let body = self
            .call(
                "commentThreads",
                vec![
                    ("part", "snippet,replies".to_string()),
                    ("videoId", video_id.to_string()),
                    ("maxResults", max_results.to_string()),
                    ("order", "relevance".to_string()),
                    ("textFormat", "plainText".to_string()),
                ],
            )
            .await?;
        Ok(parse_comment_threads(&body))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn video_hits_need_a_video_id() {
        let body = json!({"items": [
            {"id": {"kind": "youtube#video", "videoId": "abc123"},
             "snippet": {"title": "שלגיה - טריילר", "channelTitle": "כרטיסים עכשיו",
                         "thumbnails": {"medium": {"url": "https://i.ytimg.com/vi/abc123/mqdefault.jpg"}}}},
            {"id": {"kind": "youtube#channel", "channelId": "UC1"}, "snippet": {"title": "x"}}
        ]});
        let hits = parse_video_hits(&body);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].video_id, "abc123");
        assert_eq!(hits[0].channel_title, "כרטיסים עכשיו");
    }

    #[test]
    fn channel_lookup_reads_first_item() {
        assert_eq!(
            parse_channel_id(&json!({"items": [{"id": "UCxyz"}]})).as_deref(),
            Some("UCxyz")
        );
        assert_eq!(parse_channel_id(&json!({"pageInfo": {}})), None);
    }

    #[test]
    fn urls_are_built_from_video_id() {
        assert_eq!(embed_url("abc"), "https://www.youtube.com/embed/abc");
        assert_eq!(watch_url("abc"), "https://www.youtube.com/watch?v=abc");
    }
}
