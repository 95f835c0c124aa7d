//! Shared doubles for unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kidsync_core::{Event, FixedClock};
use kidsync_feeds::{
    CommentThread, EventFeed, FeedError, RawComment, RawFeedEvent, SearchError, SearchResult,
    SiteSearch, VideoHit, VideoPlatform,
};
use kidsync_storage::FetchError;
use uuid::Uuid;

pub fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

pub fn fixed_clock(now: &str) -> Arc<FixedClock> {
    Arc::new(FixedClock::utc(ts(now)))
}

pub fn event(external_id: &str, name: &str, date: DateTime<Utc>) -> Event {
    Event {
        id: Uuid::new_v4(),
        external_id: external_id.to_string(),
        slug: format!("slug-{external_id}"),
        name: name.to_string(),
        description: None,
        category: "הצגות ילדים".to_string(),
        date,
        time: None,
        venue: "היכל התרבות".to_string(),
        city: "תל אביב".to_string(),
        min_price: None,
        max_price: None,
        image_url: None,
        ticket_url: format!("https://bravo.ticketsnow.co.il/announce/{external_id}"),
        performer_name: None,
        is_kids_event: true,
        last_synced: date,
        created_at: ts("2026-01-01T00:00:00Z"),
        updated_at: ts("2026-01-01T00:00:00Z"),
    }
}

fn status_error(status: u16) -> SearchError {
    let err = FetchError::HttpStatus {
        status,
        url: "https://example.test".into(),
        body: String::new(),
    };
    kidsync_feeds::classify_fetch_error("stub", err)
}

#[derive(Default)]
pub struct StubFeed {
    pub events: Mutex<Vec<RawFeedEvent>>,
    pub fail: Mutex<bool>,
}

impl StubFeed {
    pub fn set(&self, events: Vec<RawFeedEvent>) {
        *self.events.lock().unwrap() = events;
    }
}

#[async_trait]
impl EventFeed for StubFeed {
    async fn fetch_events(&self) -> Result<Vec<RawFeedEvent>, FeedError> {
        if *self.fail.lock().unwrap() {
            return Err(FeedError::UnrecognizedShape {
                keys: "error".into(),
            });
        }
        Ok(self.events.lock().unwrap().clone())
    }
}

#[derive(Debug, Clone)]
pub enum Reply {
    Results(Vec<SearchResult>),
    Status(u16),
}

/// Site search scripted per domain; unscripted domains return nothing.
#[derive(Default)]
pub struct StubSearch {
    pub replies: Mutex<HashMap<String, Reply>>,
    pub calls: Mutex<Vec<(String, String)>>,
}

impl StubSearch {
    pub fn reply(&self, domain: &str, reply: Reply) {
        self.replies.lock().unwrap().insert(domain.to_string(), reply);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl SiteSearch for StubSearch {
    async fn search(
        &self,
        query: &str,
        site_domain: &str,
        _num: u32,
    ) -> Result<Vec<SearchResult>, SearchError> {
        self.calls
            .lock()
            .unwrap()
            .push((query.to_string(), site_domain.to_string()));
        match self.replies.lock().unwrap().get(site_domain).cloned() {
            Some(Reply::Results(results)) => Ok(results),
            Some(Reply::Status(status)) => Err(status_error(status)),
            None => Ok(Vec::new()),
        }
    }
}

pub fn result(title: &str, snippet: &str, link: &str) -> SearchResult {
    SearchResult {
        title: title.to_string(),
        snippet: snippet.to_string(),
        link: link.to_string(),
    }
}

pub fn hit(video_id: &str, title: &str, channel: &str) -> VideoHit {
    VideoHit {
        video_id: video_id.to_string(),
        title: title.to_string(),
        thumbnail_url: format!("https://i.ytimg.com/vi/{video_id}/mqdefault.jpg"),
        channel_title: channel.to_string(),
    }
}

pub fn comment(id: &str, likes: i64, published: &str) -> RawComment {
    RawComment {
        comment_id: id.to_string(),
        author_name: format!("author {id}"),
        author_channel_id: None,
        author_profile_url: None,
        text_display: format!("text {id}"),
        like_count: likes,
        published_at: ts(published),
    }
}

#[derive(Default)]
pub struct StubPlatform {
    pub channel_id: Mutex<Option<String>>,
    pub channel_hits: Mutex<Vec<VideoHit>>,
    pub open_hits: Mutex<Vec<VideoHit>>,
    pub threads: Mutex<HashMap<String, Vec<CommentThread>>>,
    pub failing_videos: Mutex<Vec<String>>,
    pub quota_exhausted: Mutex<bool>,
    pub calls: Mutex<Vec<String>>,
}

impl StubPlatform {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<(), SearchError> {
        self.calls.lock().unwrap().push(call);
        if *self.quota_exhausted.lock().unwrap() {
            return Err(status_error(429));
        }
        Ok(())
    }
}

#[async_trait]
impl VideoPlatform for StubPlatform {
    async fn resolve_channel(&self, handle: &str) -> Result<Option<String>, SearchError> {
        self.record(format!("resolve:{handle}"))?;
        Ok(self.channel_id.lock().unwrap().clone())
    }

    async fn search_videos(
        &self,
        query: &str,
        channel_id: Option<&str>,
        _max_results: u32,
    ) -> Result<Vec<VideoHit>, SearchError> {
        match channel_id {
            Some(id) => {
                self.record(format!("search:{id}:{query}"))?;
                Ok(self.channel_hits.lock().unwrap().clone())
            }
            None => {
                self.record(format!("search:*:{query}"))?;
                Ok(self.open_hits.lock().unwrap().clone())
            }
        }
    }

    async fn comment_threads(
        &self,
        video_id: &str,
        _max_results: u32,
    ) -> Result<Vec<CommentThread>, SearchError> {
        self.record(format!("comments:{video_id}"))?;
        if self.failing_videos.lock().unwrap().iter().any(|v| v == video_id) {
            return Err(status_error(500));
        }
        Ok(self
            .threads
            .lock()
            .unwrap()
            .get(video_id)
            .cloned()
            .unwrap_or_default())
    }
}
