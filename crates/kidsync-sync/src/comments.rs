//! Comment threads for cached videos, pulled only around the event date.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use kidsync_core::{days_until, CacheState, Clock, Event, QueryType, VideoComment, YouTubeVideo};
use kidsync_feeds::{CommentThread, RawComment, SearchError, VideoPlatform};
use kidsync_storage::{Filter, Patch, Query, RecordStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::RefreshPolicy;
use crate::quota::QuotaLedger;
use crate::schedule::{comment_decision, RefreshDecision, COMMENT_WINDOW_DAYS};
use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentLookup {
    pub comments: Vec<VideoComment>,
    pub from_cache: bool,
    pub queries_used: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentQueueStats {
    pub videos_processed: u64,
    pub comments_fetched: u64,
    pub cache_hits: u64,
    pub queries_used: u64,
}

/// A top-level comment with its replies, as the comments page renders them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentThreadView {
    #[serde(flatten)]
    pub comment: VideoComment,
    pub replies: Vec<VideoComment>,
}

/// Regroup flattened rows into threads, keeping the input order of top-level
/// comments. Replies whose parent is not in `comments` are dropped.
pub fn group_threads(comments: Vec<VideoComment>) -> Vec<CommentThreadView> {
    let (top, replies): (Vec<_>, Vec<_>) = comments.into_iter().partition(|c| !c.is_reply);
    let mut threads: Vec<CommentThreadView> = top
        .into_iter()
        .map(|comment| CommentThreadView {
            comment,
            replies: Vec::new(),
        })
        .collect();
    for reply in replies {
        let parent = reply.parent_comment_id.as_deref();
        if let Some(thread) = threads
            .iter_mut()
            .find(|t| Some(t.comment.comment_id.as_str()) == parent)
        {
            thread.replies.push(reply);
        }
    }
    for thread in &mut threads {
        thread.replies.sort_by_key(|r| r.published_at);
    }
    threads
}

fn to_record(
    raw: RawComment,
    video_id: &str,
    parent: Option<&str>,
    checked_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> VideoComment {
    VideoComment {
        comment_id: raw.comment_id,
        video_id: video_id.to_string(),
        author_name: raw.author_name,
        author_channel_id: raw.author_channel_id,
        author_profile_url: raw.author_profile_url,
        text_display: raw.text_display,
        like_count: raw.like_count,
        published_at: raw.published_at,
        is_reply: parent.is_some(),
        parent_comment_id: parent.map(str::to_string),
        checked_at,
        expires_at,
    }
}

fn flatten(
    threads: Vec<CommentThread>,
    video_id: &str,
    checked_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Vec<VideoComment> {
    let mut rows = Vec::new();
    for thread in threads {
        let parent_id = thread.top.comment_id.clone();
        rows.push(to_record(thread.top, video_id, None, checked_at, expires_at));
        rows.extend(
            thread
                .replies
                .into_iter()
                .map(|reply| to_record(reply, video_id, Some(&parent_id), checked_at, expires_at)),
        );
    }
    rows
}

pub struct CommentRefresher<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    ledger: QuotaLedger<S>,
    platform: Arc<dyn VideoPlatform>,
    ttl: Duration,
    threads_per_video: u32,
    call_delay: StdDuration,
}

impl<S: RecordStore> CommentRefresher<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        ledger: QuotaLedger<S>,
        platform: Arc<dyn VideoPlatform>,
        policy: &RefreshPolicy,
        call_delay: StdDuration,
    ) -> Self {
        Self {
            store,
            clock,
            ledger,
            platform,
            ttl: policy.comment_ttl(),
            threads_per_video: policy.comment_threads_per_video,
            call_delay,
        }
    }

    pub async fn cache_state(&self, video_id: &str) -> Result<CacheState, StoreError> {
        let newest = self
            .store
            .find_first::<VideoComment>(
                Query::new(Filter::eq("video_id", video_id)).desc("expires_at"),
            )
            .await?;
        Ok(CacheState::derive(self.clock.now(), newest.map(|c| c.expires_at)))
    }

    pub async fn should_pull_comments(
        &self,
        video_id: &str,
        event_date: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let state = self.cache_state(video_id).await?;
        let decision: RefreshDecision = comment_decision(state, days_until(event_date, self.clock.now()));
        Ok(decision.should_refresh())
    }

    /// Top-level first, then most liked, then newest.
    pub async fn cached_comments(&self, video_id: &str) -> Result<Vec<VideoComment>, StoreError> {
        let filter = Filter::eq("video_id", video_id).and(Filter::gt("expires_at", self.clock.now()));
        self.store
            .find_many::<VideoComment>(
                Query::new(filter)
                    .asc("is_reply")
                    .desc("like_count")
                    .desc("published_at"),
            )
            .await
    }

    pub async fn get_video_comments(&self, video_id: &str) -> Result<CommentLookup, SyncError> {
        let cached = self.cached_comments(video_id).await?;
        if !cached.is_empty() {
            debug!(video_id, "comment cache hit");
            return Ok(CommentLookup {
                comments: cached,
                from_cache: true,
                queries_used: 0,
            });
        }

        let reservation = self.ledger.reserve(QueryType::VideoComments, 1).await?;
        let outcome = self
            .platform
            .comment_threads(video_id, self.threads_per_video)
            .await;
        if let Err(SearchError::NotConfigured(what)) = outcome {
            return Err(SyncError::Config(what.to_string()));
        }
        reservation.commit(1).await?;
        let threads = outcome?;

        let now = self.clock.now();
        let mut comments = flatten(threads, video_id, now, now + self.ttl);
        for comment in &comments {
            let patch = Patch::from_record(comment, &["comment_id"]);
            if let Err(err) = self.store.upsert(comment, patch).await {
                warn!(comment_id = %comment.comment_id, error = %err, "caching comment failed");
            }
        }
        comments.sort_by(|a, b| {
            a.is_reply
                .cmp(&b.is_reply)
                .then(b.like_count.cmp(&a.like_count))
                .then(b.published_at.cmp(&a.published_at))
        });
        info!(video_id, fetched = comments.len(), "comments pulled");
        Ok(CommentLookup {
            comments,
            from_cache: false,
            queries_used: 1,
        })
    }

    /// Pull comments for videos of events in the comment window, at most `max_videos`.
    pub async fn process_queue(&self, max_videos: usize) -> Result<CommentQueueStats, SyncError> {
        self.run_queue(max_videos)
            .instrument(info_span!("comment_queue", max_videos))
            .await
    }

    async fn run_queue(&self, max_videos: usize) -> Result<CommentQueueStats, SyncError> {
        let now = self.clock.now();
        let (from, to) = COMMENT_WINDOW_DAYS;
        // days_until rounds up, so anything under two days past is still day -1
        let window = Filter::eq("is_kids_event", true)
            .and(Filter::gt("date", now + Duration::days(from - 1)))
            .and(Filter::lte("date", now + Duration::days(to)));
        let events = self
            .store
            .find_many::<Event>(Query::new(window).asc("date"))
            .await?;

        let used_before = self.ledger.daily_query_count(QueryType::VideoComments).await?;
        let mut stats = CommentQueueStats::default();
        let mut seen = HashSet::new();
        'events: for event in &events {
            let videos = self
                .store
                .find_many::<YouTubeVideo>(
                    Query::new(Filter::eq("event_id", event.id)).desc("checked_at"),
                )
                .await?;
            for video in videos {
                if stats.videos_processed as usize >= max_videos {
                    break 'events;
                }
                if !seen.insert(video.video_id.clone()) {
                    continue;
                }
                match self.should_pull_comments(&video.video_id, event.date).await {
                    Ok(true) => {}
                    Ok(false) => {
                        stats.cache_hits += 1;
                        continue;
                    }
                    Err(err) => {
                        warn!(video_id = %video.video_id, error = %err, "comment cache check failed");
                        continue;
                    }
                }
                match self.get_video_comments(&video.video_id).await {
                    Ok(lookup) => {
                        stats.videos_processed += 1;
                        stats.comments_fetched += lookup.comments.len() as u64;
                    }
                    Err(err) if err.is_quota() => {
                        warn!(video_id = %video.video_id, error = %err, "stopping comment queue");
                        break 'events;
                    }
                    Err(err) => {
                        warn!(video_id = %video.video_id, error = %err, "comment pull failed, continuing");
                    }
                }
                if !self.call_delay.is_zero() {
                    tokio::time::sleep(self.call_delay).await;
                }
            }
        }
        let used_after = self.ledger.daily_query_count(QueryType::VideoComments).await?;
        stats.queries_used = used_after.saturating_sub(used_before);
        info!(
            processed = stats.videos_processed,
            comments = stats.comments_fetched,
            cache_hits = stats.cache_hits,
            "comment queue done"
        );
        Ok(stats)
    }
}
