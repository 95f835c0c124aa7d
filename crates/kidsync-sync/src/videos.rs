//! Preview videos per event: curated channel first, open search as fallback.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use kidsync_core::{days_until, CacheState, Clock, Event, QueryType, YouTubeVideo};
use kidsync_feeds::{SearchError, VideoHit, VideoPlatform};
use kidsync_storage::{Filter, Patch, Query, RecordStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::RefreshPolicy;
use crate::quota::QuotaLedger;
use crate::schedule::{video_decision, RefreshDecision, HORIZON_DAYS};
use crate::scoring::filter_relevant_videos;
use crate::SyncError;

/// Appended to every video search.
pub const SEARCH_QUALIFIER: &str = "הצגה ילדים";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoLookup {
    pub videos: Vec<YouTubeVideo>,
    pub from_cache: bool,
    pub queries_used: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoQueueStats {
    pub events_processed: u64,
    pub videos_found: u64,
    pub cache_hits: u64,
    pub queries_used: u64,
}

pub fn search_terms(event: &Event) -> String {
    [
        Some(event.name.as_str()),
        event.performer_name.as_deref(),
        Some(SEARCH_QUALIFIER),
    ]
    .into_iter()
    .flatten()
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .collect::<Vec<_>>()
    .join(" ")
}

pub struct VideoRefresher<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    ledger: QuotaLedger<S>,
    platform: Arc<dyn VideoPlatform>,
    channel_handle: Option<String>,
    /// `Some(None)` once the handle is known not to resolve.
    resolved_channel: Mutex<Option<Option<String>>>,
    ttl: Duration,
    max_results: u32,
    call_delay: StdDuration,
}

impl<S: RecordStore> VideoRefresher<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        ledger: QuotaLedger<S>,
        platform: Arc<dyn VideoPlatform>,
        channel_handle: Option<String>,
        policy: &RefreshPolicy,
        call_delay: StdDuration,
    ) -> Self {
        Self {
            store,
            clock,
            ledger,
            platform,
            channel_handle,
            resolved_channel: Mutex::new(None),
            ttl: policy.video_ttl(),
            max_results: policy.videos_per_search,
            call_delay,
        }
    }

    pub async fn cache_state(&self, event_id: Uuid) -> Result<CacheState, StoreError> {
        let newest = self
            .store
            .find_first::<YouTubeVideo>(Query::new(Filter::eq("event_id", event_id)).desc("expires_at"))
            .await?;
        Ok(CacheState::derive(self.clock.now(), newest.map(|v| v.expires_at)))
    }

    pub async fn refresh_decision(&self, event: &Event) -> Result<RefreshDecision, StoreError> {
        let now = self.clock.now();
        let state = self.cache_state(event.id).await?;
        let created_today = self.clock.same_local_day(event.created_at, now);
        Ok(video_decision(state, days_until(event.date, now), created_today))
    }

    pub async fn should_search_videos(&self, event: &Event) -> Result<bool, StoreError> {
        Ok(self.refresh_decision(event).await?.should_refresh())
    }

    pub async fn cached_videos(&self, event_id: Uuid) -> Result<Vec<YouTubeVideo>, StoreError> {
        let filter = Filter::eq("event_id", event_id).and(Filter::gt("expires_at", self.clock.now()));
        self.store
            .find_many::<YouTubeVideo>(Query::new(filter).desc("checked_at"))
            .await
    }

    /// Worst-case calls for one lookup, given what is already memoized.
    async fn queries_needed(&self) -> u64 {
        if self.channel_handle.is_none() {
            return 1;
        }
        match &*self.resolved_channel.lock().await {
            None => 3,
            Some(Some(_)) => 2,
            Some(None) => 1,
        }
    }

    async fn channel_id(&self, issued: &mut u64) -> Result<Option<String>, SearchError> {
        let Some(handle) = self.channel_handle.as_deref() else {
            return Ok(None);
        };
        let mut memo = self.resolved_channel.lock().await;
        if let Some(known) = memo.as_ref() {
            return Ok(known.clone());
        }
        *issued += 1;
        let resolved = self.platform.resolve_channel(handle).await?;
        if resolved.is_none() {
            warn!(handle, "channel handle did not resolve, using open search only");
        }
        *memo = Some(resolved.clone());
        Ok(resolved)
    }

    async fn search(&self, event: &Event, issued: &mut u64) -> Result<Vec<VideoHit>, SearchError> {
        let query = search_terms(event);
        if let Some(channel_id) = self.channel_id(issued).await? {
            *issued += 1;
            let hits = self
                .platform
                .search_videos(&query, Some(&channel_id), self.max_results)
                .await?;
            if !hits.is_empty() {
                return Ok(hits);
            }
            debug!(event_id = %event.id, "curated channel had nothing, searching openly");
            if !self.call_delay.is_zero() {
                tokio::time::sleep(self.call_delay).await;
            }
        }
        *issued += 1;
        self.platform
            .search_videos(&query, None, self.max_results)
            .await
    }

    /// Cached videos when valid; otherwise search, filter for relevance and cache.
    pub async fn find_event_videos(&self, event: &Event) -> Result<VideoLookup, SyncError> {
        let cached = self.cached_videos(event.id).await?;
        if !cached.is_empty() {
            debug!(event_id = %event.id, "video cache hit");
            return Ok(VideoLookup {
                videos: cached,
                from_cache: true,
                queries_used: 0,
            });
        }

        let needed = self.queries_needed().await;
        let reservation = self.ledger.reserve(QueryType::VideoSearch, needed).await?;

        let mut issued = 0u64;
        let outcome = self.search(event, &mut issued).await;
        if let Err(SearchError::NotConfigured(what)) = outcome {
            return Err(SyncError::Config(what.to_string()));
        }
        reservation.commit(issued).await?;
        let hits = outcome?;

        let total = hits.len();
        let now = self.clock.now();
        let expires_at = now + self.ttl;
        let videos: Vec<YouTubeVideo> = filter_relevant_videos(hits, event)
            .into_iter()
            .map(|hit| YouTubeVideo {
                id: Uuid::new_v4(),
                event_id: event.id,
                video_id: hit.video_id,
                title: hit.title,
                thumbnail_url: hit.thumbnail_url,
                channel_title: hit.channel_title,
                checked_at: now,
                expires_at,
            })
            .collect();

        for video in &videos {
            let patch = Patch::new()
                .set("title", video.title.as_str())
                .set("thumbnail_url", video.thumbnail_url.as_str())
                .set("channel_title", video.channel_title.as_str())
                .set("checked_at", video.checked_at)
                .set("expires_at", video.expires_at);
            if let Err(err) = self.store.upsert(video, patch).await {
                warn!(video_id = %video.video_id, error = %err, "caching video failed");
            }
        }
        info!(event = %event.name, relevant = videos.len(), total, issued, "video search done");
        Ok(VideoLookup {
            videos,
            from_cache: false,
            queries_used: issued,
        })
    }

    /// Search videos for upcoming events, soonest first, at most `max_searches`.
    pub async fn process_queue(&self, max_searches: usize) -> Result<VideoQueueStats, SyncError> {
        self.run_queue(max_searches)
            .instrument(info_span!("video_queue", max_searches))
            .await
    }

    async fn run_queue(&self, max_searches: usize) -> Result<VideoQueueStats, SyncError> {
        let now = self.clock.now();
        let window = Filter::eq("is_kids_event", true)
            .and(Filter::gte("date", now))
            .and(Filter::lte("date", now + Duration::days(HORIZON_DAYS)));
        let events = self
            .store
            .find_many::<Event>(Query::new(window).asc("date"))
            .await?;

        let used_before = self.ledger.daily_query_count(QueryType::VideoSearch).await?;
        let mut stats = VideoQueueStats::default();
        for event in &events {
            if stats.events_processed as usize >= max_searches {
                break;
            }
            match self.should_search_videos(event).await {
                Ok(false) => {
                    stats.cache_hits += 1;
                    continue;
                }
                Ok(true) => {}
                Err(err) => {
                    warn!(event_id = %event.id, error = %err, "video cache check failed");
                    continue;
                }
            }
            match self.find_event_videos(event).await {
                Ok(lookup) => {
                    stats.events_processed += 1;
                    stats.videos_found += lookup.videos.len() as u64;
                }
                Err(err) if err.is_quota() => {
                    warn!(event_id = %event.id, error = %err, "stopping video queue");
                    break;
                }
                Err(err) => {
                    warn!(event_id = %event.id, error = %err, "video search failed, continuing");
                }
            }
            if !self.call_delay.is_zero() {
                tokio::time::sleep(self.call_delay).await;
            }
        }
        let used_after = self.ledger.daily_query_count(QueryType::VideoSearch).await?;
        stats.queries_used = used_after.saturating_sub(used_before);
        info!(
            processed = stats.events_processed,
            videos = stats.videos_found,
            cache_hits = stats.cache_hits,
            "video queue done"
        );
        Ok(stats)
    }
}
