use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use kidsync_core::{CompetitorMatch, Event, FixedClock, QueryType, VideoComment, YouTubeVideo};
use kidsync_feeds::{
    CommentThread, EventFeed, FeedError, RawComment, RawFeedEvent, SearchError, SearchResult,
    SiteSearch, VideoHit, VideoPlatform,
};
use kidsync_storage::{Filter, MemoryStore, Query, RecordStore};
use kidsync_sync::{
    Collaborators, EventReconciler, MarkdownReportSink, QuotaLedger, SyncConfig, SyncOrchestrator,
};
use serde_json::json;
use tokio::sync::Mutex;

const NOW: &str = "2026-03-01T02:00:00Z";

const KIDS_SHOWS: [&str; 7] = [
    "שלגיה והגמדים",
    "פינוקיו הקטן",
    "בילבי הגיבורה",
    "מואנה במסע",
    "היפה והחיה",
    "עליסה בארץ הפלאות",
    "פיטר פן",
];

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn raw_event(id: u32, name: &str, section: &str, date: DateTime<Utc>) -> RawFeedEvent {
    RawFeedEvent::new(json!({
        "id": id,
        "name": name,
        "section": section,
        "dateFrom": date.to_rfc3339(),
        "Seances": [{ "Hall": "היכל התרבות", "City": "תל אביב" }],
        "priceMin": 59
    }))
}

/// Kids shows `0..kids` on consecutive days from tomorrow, plus `adults` stand-up nights.
fn feed_entries(kids: &[usize], adults: usize) -> Vec<RawFeedEvent> {
    let first_day = ts("2026-03-02T00:00:00Z");
    let mut out: Vec<RawFeedEvent> = kids
        .iter()
        .map(|&i| {
            raw_event(
                100 + i as u32,
                KIDS_SHOWS[i],
                "הצגות ילדים",
                first_day + Duration::days(i as i64),
            )
        })
        .collect();
    out.extend((0..adults).map(|i| {
        raw_event(900 + i as u32, &format!("ערב סטנדאפ {i}"), "סטנדאפ", first_day)
    }));
    out
}

#[derive(Default)]
struct ScriptedFeed {
    entries: Mutex<Vec<RawFeedEvent>>,
}

impl ScriptedFeed {
    async fn set(&self, entries: Vec<RawFeedEvent>) {
        *self.entries.lock().await = entries;
    }
}

#[async_trait]
impl EventFeed for ScriptedFeed {
    async fn fetch_events(&self) -> Result<Vec<RawFeedEvent>, FeedError> {
        Ok(self.entries.lock().await.clone())
    }
}

/// Only Eventer has pages for our shows.
#[derive(Default)]
struct EventerOnly {
    calls: AtomicUsize,
}

#[async_trait]
impl SiteSearch for EventerOnly {
    async fn search(
        &self,
        query: &str,
        site_domain: &str,
        _num: u32,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if site_domain != "eventer.co.il" {
            return Ok(Vec::new());
        }
        Ok(vec![
            SearchResult {
                title: "כל ההצגות לילדים".into(),
                snippet: query.into(),
                link: "https://www.eventer.co.il/".into(),
            },
            SearchResult {
                title: format!("{query} | כרטיסים"),
                snippet: "בהיכל התרבות".into(),
                link: format!("https://www.eventer.co.il/event/{}", 40000 + n),
            },
        ])
    }
}

#[derive(Default)]
struct TrailerChannel {
    searches: AtomicUsize,
    comment_pulls: AtomicUsize,
}

fn raw_comment(id: String, likes: i64) -> RawComment {
    RawComment {
        comment_id: id.clone(),
        author_name: "הורה".into(),
        author_channel_id: None,
        author_profile_url: None,
        text_display: format!("היה מעולה {id}"),
        like_count: likes,
        published_at: ts("2026-02-27T12:00:00Z"),
    }
}

#[async_trait]
impl VideoPlatform for TrailerChannel {
    async fn resolve_channel(&self, _handle: &str) -> Result<Option<String>, SearchError> {
        Ok(None)
    }

    async fn search_videos(
        &self,
        query: &str,
        _channel_id: Option<&str>,
        _max_results: u32,
    ) -> Result<Vec<VideoHit>, SearchError> {
        let n = self.searches.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            VideoHit {
                video_id: format!("trailer-{n}"),
                title: format!("{query} - טריילר"),
                thumbnail_url: String::new(),
                channel_title: "ערוץ ההצגות".into(),
            },
            VideoHit {
                video_id: format!("reaction-{n}"),
                title: format!("{query} reaction"),
                thumbnail_url: String::new(),
                channel_title: "מישהו".into(),
            },
        ])
    }

    async fn comment_threads(
        &self,
        video_id: &str,
        _max_results: u32,
    ) -> Result<Vec<CommentThread>, SearchError> {
        self.comment_pulls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![CommentThread {
            top: raw_comment(format!("{video_id}-top"), 5),
            replies: vec![raw_comment(format!("{video_id}-reply"), 1)],
        }])
    }
}

struct World {
    store: Arc<MemoryStore>,
    clock: Arc<FixedClock>,
    feed: Arc<ScriptedFeed>,
    search: Arc<EventerOnly>,
    platform: Arc<TrailerChannel>,
    config: SyncConfig,
}

fn world() -> World {
    let mut config = SyncConfig::from_env();
    config.call_delay_ms = 0;
    config.youtube_channel_handle = None;
    World {
        store: Arc::new(MemoryStore::new()),
        clock: Arc::new(FixedClock::utc(ts(NOW))),
        feed: Arc::new(ScriptedFeed::default()),
        search: Arc::new(EventerOnly::default()),
        platform: Arc::new(TrailerChannel::default()),
        config,
    }
}

impl World {
    fn orchestrator(&self) -> SyncOrchestrator<MemoryStore> {
        SyncOrchestrator::new(
            Arc::clone(&self.store),
            self.clock.clone(),
            Collaborators {
                feed: self.feed.clone(),
                search: self.search.clone(),
                platform: self.platform.clone(),
            },
            &self.config,
        )
    }

    fn reconciler(&self) -> EventReconciler<MemoryStore> {
        EventReconciler::new(
            Arc::clone(&self.store),
            self.clock.clone(),
            self.feed.clone(),
            self.config.ticket_base_url.clone(),
        )
    }
}

#[tokio::test]
async fn feed_reconciliation_tracks_new_updated_and_removed() {
    let w = world();
    let reconciler = w.reconciler();

    w.feed.set(feed_entries(&[0, 1, 2, 3, 4, 5], 4)).await;
    let first = reconciler.sync_events().await.unwrap();
    assert_eq!(first.total, 6);
    assert_eq!(first.new, 6);
    assert_eq!(w.store.row_count("events").await, 6);

    w.feed.set(feed_entries(&[0, 1, 2, 3, 4, 5, 6], 4)).await;
    let second = reconciler.sync_events().await.unwrap();
    assert_eq!((second.new, second.updated, second.removed), (1, 6, 0));

    w.feed.set(feed_entries(&[0, 1, 2, 5, 6], 4)).await;
    let third = reconciler.sync_events().await.unwrap();
    assert_eq!(third.removed, 2);
    assert_eq!(w.store.row_count("events").await, 5);
    assert_eq!(w.store.row_count("sync_logs").await, 3);

    let stored = w
        .store
        .find_unique::<Event>(Filter::eq("external_id", "100"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.venue, "היכל התרבות");
    assert_eq!(stored.min_price, Some(59.0));
    assert!(stored.ticket_url.ends_with("/announce/100"));
}

#[tokio::test]
async fn daily_run_fills_every_cache_then_serves_from_them() {
    let w = world();
    w.feed.set(feed_entries(&[0, 1, 2, 3, 4, 5], 4)).await;
    let reports = tempfile::tempdir().unwrap();
    let orchestrator = w
        .orchestrator()
        .with_sink(Arc::new(MarkdownReportSink::new(reports.path())));

    let first = orchestrator.run_daily_sync().await.unwrap();
    let stats = &first.stats;
    assert_eq!(stats.event_sync.new, 6);
    assert_eq!(stats.competitor_search.processed, 6);
    assert_eq!(stats.competitor_search.queries_used, 24);
    assert_eq!(stats.competitor_search.matches_found, 6);
    assert_eq!(stats.youtube_videos.events_processed, 6);
    assert_eq!(stats.youtube_videos.videos_found, 6);
    assert_eq!(stats.youtube_comments.videos_processed, 6);
    assert_eq!(stats.youtube_comments.comments_fetched, 12);

    let matches = w
        .store
        .find_many::<CompetitorMatch>(Query::all())
        .await
        .unwrap();
    assert!(matches.iter().all(|m| m.competitor_name == "Eventer"));
    assert!(matches.iter().all(|m| m.match_score >= 0.35));
    assert!(matches
        .iter()
        .all(|m| m.expires_at - m.checked_at == Duration::days(7)));
    let videos = w.store.find_many::<YouTubeVideo>(Query::all()).await.unwrap();
    assert!(videos.iter().all(|v| v.video_id.starts_with("trailer-")));
    let replies = w
        .store
        .count::<VideoComment>(Filter::eq("is_reply", true))
        .await
        .unwrap();
    assert_eq!(replies, 6);

    let ledger = QuotaLedger::new(
        Arc::clone(&w.store),
        w.clock.clone(),
        w.config.refresh.daily_caps,
    );
    assert_eq!(ledger.daily_query_count(QueryType::Competitor).await.unwrap(), 24);
    assert_eq!(ledger.daily_query_count(QueryType::VideoSearch).await.unwrap(), 6);
    assert_eq!(ledger.daily_query_count(QueryType::VideoComments).await.unwrap(), 6);

    let brief = std::fs::read_to_string(
        reports
            .path()
            .join(first.run_id.to_string())
            .join("daily_brief.md"),
    )
    .unwrap();
    assert!(brief.contains("## Competitor Matches"));
    assert!(brief.contains("שלגיה והגמדים"));

    w.clock.advance(Duration::hours(3));
    let second = orchestrator.run_daily_sync().await.unwrap();
    let stats = &second.stats;
    assert_eq!((stats.event_sync.new, stats.event_sync.updated), (0, 6));
    assert_eq!(stats.competitor_search.processed, 0);
    assert_eq!(stats.competitor_search.queries_used, 0);
    assert_eq!(stats.youtube_videos.cache_hits, 6);
    assert_eq!(stats.youtube_comments.cache_hits, 6);
    assert_eq!(w.search.calls.load(Ordering::SeqCst), 24);
    assert_eq!(w.platform.comment_pulls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn competitor_budget_is_shared_across_runs_in_a_day() {
    let mut w = world();
    w.config.refresh.daily_caps.competitor = 10;
    w.feed.set(feed_entries(&[0, 1, 2, 3, 4, 5], 0)).await;
    let orchestrator = w.orchestrator();

    let first = orchestrator.run_daily_sync().await.unwrap();
    assert_eq!(first.stats.competitor_search.processed, 2);
    assert_eq!(first.stats.competitor_search.remaining, 2);

    let second = orchestrator.run_daily_sync().await.unwrap();
    assert_eq!(second.stats.competitor_search.processed, 0);
    assert_eq!(second.stats.competitor_search.queries_used, 0);

    // a new local day brings a fresh budget
    w.clock.advance(Duration::days(1));
    let third = orchestrator.run_daily_sync().await.unwrap();
    assert_eq!(third.stats.competitor_search.processed, 2);
}
