//! Remote collaborators: the ticketing feed, site-restricted search and the
//! video platform. Each sits behind an async trait so the sync core can be
//! driven by test doubles.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kidsync_storage::FetchError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod bravo;
pub mod google;
pub mod youtube;

pub use bravo::{parse_feed_str, parse_feed_value, BravoFeed, JsonFileFeed, RawFeedEvent};
pub use google::{Credential, CustomSearchClient, GoogleAuth, ServiceAccountKey};
pub use youtube::YouTubeClient;

pub const CRATE_NAME: &str = "kidsync-feeds";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed request failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("unrecognized feed shape (top-level keys: {keys})")]
    UnrecognizedShape { keys: String },
    #[error("feed body is not valid json: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("{service} daily quota exceeded")]
    QuotaExceeded { service: &'static str },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("google auth failed: {0}")]
    Auth(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

impl SearchError {
    pub fn is_quota(&self) -> bool {
        matches!(self, SearchError::QuotaExceeded { .. })
    }
}

/// 429, or 403 naming a daily quota reason, means the upstream budget is spent.
pub fn classify_fetch_error(service: &'static str, err: FetchError) -> SearchError {
    match err.status() {
        Some(429) => SearchError::QuotaExceeded { service },
        Some(403)
            if err.body().contains("quotaExceeded") || err.body().contains("dailyLimitExceeded") =>
        {
            SearchError::QuotaExceeded { service }
        }
        _ => SearchError::Fetch(err),
    }
}

/// One organic result from a site-restricted search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub snippet: String,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoHit {
    pub video_id: String,
    pub title: String,
    pub thumbnail_url: String,
    pub channel_title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawComment {
    pub comment_id: String,
    pub author_name: String,
    pub author_channel_id: Option<String>,
    pub author_profile_url: Option<String>,
    pub text_display: String,
    pub like_count: i64,
    pub published_at: DateTime<Utc>,
}

/// A top-level comment with the replies the platform returned inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentThread {
    pub top: RawComment,
    pub replies: Vec<RawComment>,
}

#[async_trait]
pub trait EventFeed: Send + Sync {
    async fn fetch_events(&self) -> Result<Vec<RawFeedEvent>, FeedError>;
}

#[async_trait]
pub trait SiteSearch: Send + Sync {
    /// Search `query` restricted to `site_domain`, returning at most `num` results.
    async fn search(
        &self,
        query: &str,
        site_domain: &str,
        num: u32,
    ) -> Result<Vec<SearchResult>, SearchError>;
}

#[async_trait]
pub trait VideoPlatform: Send + Sync {
    /// Resolve a channel handle such as `@name` to its channel id.
    async fn resolve_channel(&self, handle: &str) -> Result<Option<String>, SearchError>;

    async fn search_videos(
        &self,
        query: &str,
        channel_id: Option<&str>,
        max_results: u32,
    ) -> Result<Vec<VideoHit>, SearchError>;

    async fn comment_threads(
        &self,
        video_id: &str,
        max_results: u32,
    ) -> Result<Vec<CommentThread>, SearchError>;
}

/// Stands in for a search or video client whose credentials are missing.
/// Every call fails with `NotConfigured` naming the missing setting.
#[derive(Debug, Clone, Copy)]
pub struct Unconfigured(pub &'static str);

#[async_trait]
impl SiteSearch for Unconfigured {
    async fn search(&self, _query: &str, _site: &str, _num: u32) -> Result<Vec<SearchResult>, SearchError> {
        Err(SearchError::NotConfigured(self.0))
    }
}

#[async_trait]
impl VideoPlatform for Unconfigured {
    async fn resolve_channel(&self, _handle: &str) -> Result<Option<String>, SearchError> {
        Err(SearchError::NotConfigured(self.0))
    }

    async fn search_videos(
        &self,
        _query: &str,
        _channel_id: Option<&str>,
        _max_results: u32,
    ) -> Result<Vec<VideoHit>, SearchError> {
        Err(SearchError::NotConfigured(self.0))
    }

    async fn comment_threads(
        &self,
        _video_id: &str,
        _max_results: u32,
    ) -> Result<Vec<CommentThread>, SearchError> {
        Err(SearchError::NotConfigured(self.0))
    }
}

pub(crate) fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

pub(crate) fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    let v = json_at(value, path)?;
    v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_error(status: u16, body: &str) -> FetchError {
        FetchError::HttpStatus {
            status,
            url: "https://www.googleapis.com/customsearch/v1".into(),
            body: body.into(),
        }
    }

    #[test]
    fn quota_statuses_are_classified() {
        assert!(classify_fetch_error("cse", status_error(429, "")).is_quota());
        assert!(classify_fetch_error(
            "youtube",
            status_error(403, r#"{"error":{"errors":[{"reason":"quotaExceeded"}]}}"#)
        )
        .is_quota());
        assert!(!classify_fetch_error("youtube", status_error(403, "commentsDisabled")).is_quota());
        assert!(!classify_fetch_error("cse", status_error(500, "")).is_quota());
    }

    #[test]
    fn json_helpers_walk_paths() {
        let v = serde_json::json!({"a": {"b": "x", "n": "12"}});
        assert_eq!(json_str(&v, &["a", "b"]), Some("x"));
        assert_eq!(json_i64(&v, &["a", "n"]), Some(12));
        assert!(json_at(&v, &["a", "missing"]).is_none());
    }
}
