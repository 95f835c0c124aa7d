//! Scheduled refresh of events, competitor links, videos and comments under a
//! daily external-query budget.

use chrono::{DateTime, Utc};
use kidsync_core::QueryType;
use kidsync_feeds::{FeedError, SearchError};
use kidsync_storage::StoreError;
use thiserror::Error;

pub mod comments;
pub mod competitors;
pub mod config;
pub mod events;
pub mod lease;
pub mod orchestrator;
pub mod quota;
pub mod reconciler;
pub mod report;
pub mod schedule;
pub mod scheduler;
pub mod scoring;
pub mod status;
pub mod videos;

pub use comments::{
    group_threads, CommentLookup, CommentQueueStats, CommentRefresher, CommentThreadView,
};
pub use competitors::{CompetitorLookup, CompetitorQueueStats, CompetitorRefresher};
pub use config::{Competitor, DailyCaps, RefreshPolicy, SyncConfig};
pub use events::{DateWindow, EventQueries, EventSearch, EventSort};
pub use lease::{RunLeases, DAILY_SYNC_LEASE};
pub use orchestrator::{
    orchestrator_from_config, run_sync_once_from_env, Collaborators, SyncOrchestrator,
    SyncRunSummary, SyncStats, EVENT_SYNC_LEASE,
};
pub use quota::{QuotaLedger, QuotaUsage};
pub use reconciler::{generate_slug, is_kids_event, EventReconciler, EventSyncStats};
pub use report::{
    recent_reports_markdown, MarkdownReportSink, NoopReportSink, ReportDetail, ReportSink,
    SyncReport,
};
pub use schedule::{Priority, RefreshDecision, SkipReason};
pub use scheduler::maybe_build_scheduler;
pub use scoring::{calculate_match_score, filter_relevant_videos};
pub use status::{sync_status, StatusReport};
pub use videos::{VideoLookup, VideoQueueStats, VideoRefresher};

pub const CRATE_NAME: &str = "kidsync-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("event feed failed: {0}")]
    Feed(#[from] FeedError),
    #[error("daily {query_type} quota exceeded: {used} used + {needed} needed > {cap}")]
    QuotaExceeded {
        query_type: QueryType,
        used: u64,
        needed: u64,
        cap: u64,
    },
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("sync run `{name}` is already in progress (lease expires {expires_at})")]
    RunInProgress {
        name: String,
        expires_at: DateTime<Utc>,
    },
    #[error("not configured: {0}")]
    Config(String),
}

impl SyncError {
    /// Either our own ledger said no, or the upstream API did.
    pub fn is_quota(&self) -> bool {
        match self {
            SyncError::QuotaExceeded { .. } => true,
            SyncError::Search(err) => err.is_quota(),
            _ => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing;
