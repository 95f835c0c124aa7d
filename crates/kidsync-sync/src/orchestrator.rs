//! The daily run: event sync, then the competitor, video and comment queues,
//! strictly in that order, under a run lease.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use kidsync_core::{Clock, QueryType, RunLease, SystemClock};
use kidsync_feeds::google::{CSE_SCOPE, YOUTUBE_SCOPE};
use kidsync_feeds::{
    BravoFeed, CustomSearchClient, EventFeed, GoogleAuth, ServiceAccountKey, SiteSearch,
    Unconfigured, VideoPlatform, YouTubeClient,
};
use kidsync_storage::{PgStore, RecordStore};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::comments::{CommentQueueStats, CommentRefresher};
use crate::competitors::{CompetitorQueueStats, CompetitorRefresher};
use crate::config::SyncConfig;
use crate::lease::{RunLeases, DAILY_SYNC_LEASE};
use crate::quota::QuotaLedger;
use crate::reconciler::{EventReconciler, EventSyncStats};
use crate::report::{MarkdownReportSink, NoopReportSink, ReportDetail, ReportSink, SyncReport};
use crate::videos::{VideoQueueStats, VideoRefresher};
use crate::SyncError;

const MISSING_GOOGLE_CREDENTIALS: &str = "GOOGLE_SERVICE_ACCOUNT_PATH or GOOGLE_API_KEY";
/// Lease name for a standalone event-feed sync.
pub const EVENT_SYNC_LEASE: &str = "event-sync";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub event_sync: EventSyncStats,
    pub competitor_search: CompetitorQueueStats,
    pub youtube_videos: VideoQueueStats,
    pub youtube_comments: CommentQueueStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub stats: SyncStats,
}

/// The remote side of a run.
#[derive(Clone)]
pub struct Collaborators {
    pub feed: Arc<dyn EventFeed>,
    pub search: Arc<dyn SiteSearch>,
    pub platform: Arc<dyn VideoPlatform>,
}

impl Collaborators {
    /// Real clients. Missing Google credentials leave search and video lookups
    /// failing with a not-configured error rather than refusing to start.
    pub fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let timeout = config.http_timeout();
        let feed = Arc::new(BravoFeed::new(&config.feed_url, timeout)?);

        let auth = if let Some(path) = &config.google_service_account_path {
            let key = ServiceAccountKey::from_file(path)?;
            Some((
                Arc::new(GoogleAuth::service_account(key.clone(), CSE_SCOPE, timeout)?),
                Arc::new(GoogleAuth::service_account(key, YOUTUBE_SCOPE, timeout)?),
            ))
        } else {
            config.google_api_key.as_ref().map(|key| {
                let auth = Arc::new(GoogleAuth::api_key(key.clone()));
                (Arc::clone(&auth), auth)
            })
        };

        let (search, platform) = match auth {
            Some((search_auth, video_auth)) => {
                let search: Arc<dyn SiteSearch> = Arc::new(CustomSearchClient::new(
                    search_auth,
                    config.google_search_engine_id.clone(),
                    timeout,
                )?);
                let platform: Arc<dyn VideoPlatform> =
                    Arc::new(YouTubeClient::new(video_auth, timeout)?);
                (search, platform)
            }
            None => {
                warn!("no google credentials configured; competitor and video lookups are disabled");
                let missing = Unconfigured(MISSING_GOOGLE_CREDENTIALS);
                (
                    Arc::new(missing) as Arc<dyn SiteSearch>,
                    Arc::new(missing) as Arc<dyn VideoPlatform>,
                )
            }
        };
        Ok(Self {
            feed,
            search,
            platform,
        })
    }
}

pub struct SyncOrchestrator<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    ledger: QuotaLedger<S>,
    leases: RunLeases<S>,
    reconciler: EventReconciler<S>,
    competitors: CompetitorRefresher<S>,
    videos: VideoRefresher<S>,
    comments: CommentRefresher<S>,
    sink: Arc<dyn ReportSink>,
    site_base_url: String,
    max_videos: usize,
    max_comments: usize,
}

impl<S: RecordStore> SyncOrchestrator<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        collaborators: Collaborators,
        config: &SyncConfig,
    ) -> Self {
        let policy = &config.refresh;
        let delay = config.call_delay();
        let ledger = QuotaLedger::new(Arc::clone(&store), Arc::clone(&clock), policy.daily_caps);
        Self {
            leases: RunLeases::new(Arc::clone(&store), Arc::clone(&clock), policy.lease_ttl()),
            reconciler: EventReconciler::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                collaborators.feed,
                config.ticket_base_url.clone(),
            ),
            competitors: CompetitorRefresher::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                ledger.clone(),
                collaborators.search,
                policy,
                delay,
            ),
            videos: VideoRefresher::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                ledger.clone(),
                Arc::clone(&collaborators.platform),
                config.youtube_channel_handle.clone(),
                policy,
                delay,
            ),
            comments: CommentRefresher::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                ledger.clone(),
                collaborators.platform,
                policy,
                delay,
            ),
            ledger,
            store,
            clock,
            sink: Arc::new(NoopReportSink),
            site_base_url: config.site_base_url.clone(),
            max_videos: policy.max_videos_per_run,
            max_comments: policy.max_comments_per_run,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn ledger(&self) -> &QuotaLedger<S> {
        &self.ledger
    }

    pub fn competitors(&self) -> &CompetitorRefresher<S> {
        &self.competitors
    }

    pub fn videos(&self) -> &VideoRefresher<S> {
        &self.videos
    }

    pub fn comments(&self) -> &CommentRefresher<S> {
        &self.comments
    }

    /// Only the feed reconciliation, under its own lease.
    pub async fn sync_events_only(&self) -> Result<EventSyncStats, SyncError> {
        let lease = self.leases.acquire(EVENT_SYNC_LEASE).await?;
        let outcome = self.reconciler.sync_events().await;
        self.release(&lease).await;
        outcome
    }

    pub async fn run_daily_sync(&self) -> Result<SyncRunSummary, SyncError> {
        let lease = self.leases.acquire(DAILY_SYNC_LEASE).await?;
        let run_id = Uuid::new_v4();
        let started_at = self.clock.now();
        info!(%run_id, "daily sync started");

        let mut stats = SyncStats::default();
        let outcome = self
            .run_passes(&mut stats)
            .instrument(info_span!("daily_sync", %run_id))
            .await;
        self.release(&lease).await;

        let finished_at = self.clock.now();
        let duration_secs = (finished_at - started_at).num_milliseconds() as f64 / 1000.0;
        let detail = match ReportDetail::gather(
            self.store.as_ref(),
            self.clock.as_ref(),
            &self.site_base_url,
        )
        .await
        {
            Ok(detail) => detail,
            Err(err) => {
                warn!(error = %err, "gathering report detail failed");
                ReportDetail::default()
            }
        };
        let report = SyncReport {
            run_id,
            success: outcome.is_ok(),
            started_at,
            finished_at,
            duration_secs,
            stats: stats.clone(),
            error: outcome.as_ref().err().map(ToString::to_string),
            detail,
        };
        if let Err(err) = self.sink.publish(&report).await {
            warn!(error = %err, "publishing sync report failed");
        }

        if let Err(err) = outcome {
            error!(%run_id, error = %err, "daily sync failed");
            return Err(err);
        }
        info!(
            %run_id,
            duration_secs,
            events = stats.event_sync.total,
            competitor_queries = stats.competitor_search.queries_used,
            videos = stats.youtube_videos.videos_found,
            comments = stats.youtube_comments.comments_fetched,
            "daily sync finished"
        );
        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            duration_secs,
            stats,
        })
    }

    async fn run_passes(&self, stats: &mut SyncStats) -> Result<(), SyncError> {
        stats.event_sync = self.reconciler.sync_events().await?;
        stats.competitor_search = self
            .competitors
            .process_queue(self.ledger.cap(QueryType::Competitor))
            .await?;
        stats.youtube_videos = self.videos.process_queue(self.max_videos).await?;
        stats.youtube_comments = self.comments.process_queue(self.max_comments).await?;
        Ok(())
    }

    async fn release(&self, lease: &RunLease) {
        match self.leases.release(lease).await {
            Ok(true) => {}
            Ok(false) => warn!(name = %lease.name, "run lease was taken over before release"),
            Err(err) => warn!(name = %lease.name, error = %err, "releasing run lease failed"),
        }
    }
}

/// Production wiring: Postgres store, system clock, real clients, markdown reports.
pub async fn orchestrator_from_config(config: &SyncConfig) -> anyhow::Result<SyncOrchestrator<PgStore>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    let collaborators = Collaborators::from_config(config)?;
    Ok(SyncOrchestrator::new(Arc::new(store), Arc::new(SystemClock), collaborators, config)
        .with_sink(Arc::new(MarkdownReportSink::new(&config.reports_dir))))
}

pub async fn run_sync_once_from_env() -> anyhow::Result<SyncRunSummary> {
    let config = SyncConfig::load()?;
    let orchestrator = orchestrator_from_config(&config).await?;
    Ok(orchestrator.run_daily_sync().await?)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use kidsync_feeds::RawFeedEvent;
    use kidsync_storage::MemoryStore;
    use serde_json::json;

    use super::*;
    use crate::testing::{fixed_clock, StubFeed, StubPlatform, StubSearch};

    #[derive(Default)]
    struct RecordingSink {
        reports: Mutex<Vec<SyncReport>>,
        fail: bool,
    }

    #[async_trait]
    impl ReportSink for RecordingSink {
        async fn publish(&self, report: &SyncReport) -> anyhow::Result<()> {
            self.reports.lock().unwrap().push(report.clone());
            if self.fail {
                anyhow::bail!("mail server down");
            }
            Ok(())
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        feed: Arc<StubFeed>,
        sink: Arc<RecordingSink>,
        orchestrator: SyncOrchestrator<MemoryStore>,
    }

    fn harness(sink: RecordingSink) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let feed = Arc::new(StubFeed::default());
        feed.set(vec![RawFeedEvent::new(json!({
            "id": 1,
            "name": "שלגיה והגמדים",
            "section": "הצגות ילדים",
            "dateFrom": "2026-03-05T10:00:00Z"
        }))]);
        let sink = Arc::new(sink);
        let mut config = SyncConfig::from_env();
        config.call_delay_ms = 0;
        let orchestrator = SyncOrchestrator::new(
            Arc::clone(&store),
            fixed_clock("2026-03-01T02:00:00Z"),
            Collaborators {
                feed: feed.clone(),
                search: Arc::new(StubSearch::default()),
                platform: Arc::new(StubPlatform::default()),
            },
            &config,
        )
        .with_sink(sink.clone());
        Harness {
            store,
            feed,
            sink,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn run_reports_every_pass_and_releases_the_lease() {
        let h = harness(RecordingSink::default());
        let summary = h.orchestrator.run_daily_sync().await.unwrap();
        assert_eq!(summary.stats.event_sync.total, 1);
        assert_eq!(summary.stats.competitor_search.processed, 1);
        assert_eq!(summary.stats.competitor_search.queries_used, 4);
        assert_eq!(summary.stats.youtube_videos.events_processed, 1);

        let reports = h.sink.reports.lock().unwrap().clone();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].success);
        assert_eq!(reports[0].detail.new_events.len(), 1);
        assert_eq!(reports[0].stats, summary.stats);
        assert_eq!(h.store.row_count("run_leases").await, 0);
    }

    #[tokio::test]
    async fn feed_failure_still_publishes_a_failed_report() {
        let h = harness(RecordingSink::default());
        *h.feed.fail.lock().unwrap() = true;
        let err = h.orchestrator.run_daily_sync().await.unwrap_err();
        assert!(matches!(err, SyncError::Feed(_)));

        let reports = h.sink.reports.lock().unwrap().clone();
        assert!(!reports[0].success);
        assert!(reports[0].error.as_deref().unwrap_or_default().contains("unrecognized"));
        assert_eq!(h.store.row_count("run_leases").await, 0);
    }

    #[tokio::test]
    async fn sink_failure_does_not_fail_the_run() {
        let h = harness(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        assert!(h.orchestrator.run_daily_sync().await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_run_is_refused() {
        let h = harness(RecordingSink::default());
        h.store
            .create(&RunLease {
                name: DAILY_SYNC_LEASE.to_string(),
                owner: Uuid::new_v4(),
                acquired_at: h.orchestrator.clock().now(),
                expires_at: h.orchestrator.clock().now() + chrono::Duration::hours(1),
            })
            .await
            .unwrap();
        let err = h.orchestrator.run_daily_sync().await.unwrap_err();
        assert!(matches!(err, SyncError::RunInProgress { .. }));
        assert!(h.sink.reports.lock().unwrap().is_empty());
        assert_eq!(h.store.row_count("events").await, 0);

        let stats = h.orchestrator.sync_events_only().await.unwrap();
        assert_eq!(stats.new, 1);
    }
}
