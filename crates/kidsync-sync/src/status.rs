//! Monitoring snapshot for the status endpoint and `kidsync-cli status`.

use chrono::{DateTime, Utc};
use kidsync_core::{Clock, CompetitorMatch, Event, SearchLog, SyncLog, SyncStatus};
use kidsync_storage::{Filter, Query, RecordStore, StoreError};
use serde::Serialize;

use crate::quota::{QuotaLedger, QuotaUsage};

const RECENT_RUNS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub last_sync: Option<SyncLog>,
    pub recent_syncs: Vec<SyncLog>,
    pub todays_search_logs: Vec<SearchLog>,
    pub quota: Vec<QuotaUsage>,
    pub total_events: u64,
    pub upcoming_events: u64,
    pub cached_competitor_matches: u64,
    /// Percent of the recent runs that succeeded; `None` before the first run.
    pub success_rate: Option<f64>,
}

impl StatusReport {
    pub fn to_text(&self) -> String {
        let mut lines = Vec::new();
        match &self.last_sync {
            Some(log) => lines.push(format!(
                "last sync: {} at {} ({} events, {} new, {} removed)",
                log.status.as_str(),
                log.synced_at.format("%Y-%m-%d %H:%M"),
                log.events_total,
                log.events_new,
                log.events_removed
            )),
            None => lines.push("last sync: never".to_string()),
        }
        if let Some(rate) = self.success_rate {
            lines.push(format!("success rate (last {}): {rate:.0}%", self.recent_syncs.len()));
        }
        lines.push(format!(
            "events: {} total, {} upcoming; {} live competitor matches",
            self.total_events, self.upcoming_events, self.cached_competitor_matches
        ));
        for usage in &self.quota {
            lines.push(format!(
                "quota {}: {}/{} used ({}%)",
                usage.query_type, usage.used, usage.cap, usage.percent_used
            ));
        }
        lines.join("\n")
    }
}

pub async fn sync_status<S: RecordStore>(
    store: &S,
    clock: &dyn Clock,
    ledger: &QuotaLedger<S>,
) -> Result<StatusReport, StoreError> {
    let now = clock.now();
    let recent_syncs = store
        .find_many::<SyncLog>(Query::all().desc("synced_at").limit(RECENT_RUNS))
        .await?;
    let success_rate = (!recent_syncs.is_empty()).then(|| {
        let ok = recent_syncs
            .iter()
            .filter(|log| log.status == SyncStatus::Success)
            .count();
        (ok as f64 / recent_syncs.len() as f64 * 1000.0).round() / 10.0
    });

    Ok(StatusReport {
        generated_at: now,
        last_sync: recent_syncs.first().cloned(),
        todays_search_logs: ledger.todays_logs().await?,
        quota: ledger.usage().await?,
        total_events: store.count::<Event>(Filter::All).await?,
        upcoming_events: store.count::<Event>(Filter::gte("date", now)).await?,
        cached_competitor_matches: store
            .count::<CompetitorMatch>(Filter::gt("expires_at", now))
            .await?,
        success_rate,
        recent_syncs,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kidsync_core::QueryType;
    use kidsync_storage::MemoryStore;
    use uuid::Uuid;

    use super::*;
    use crate::config::DailyCaps;
    use crate::testing::{event, fixed_clock, ts};

    fn sync_log(status: SyncStatus, at: &str) -> SyncLog {
        SyncLog {
            id: Uuid::new_v4(),
            status,
            events_total: 12,
            events_new: 2,
            events_updated: 10,
            events_removed: 0,
            error_message: None,
            synced_at: ts(at),
        }
    }

    #[tokio::test]
    async fn snapshot_counts_runs_events_and_quota() {
        let store = Arc::new(MemoryStore::new());
        let clock = fixed_clock("2026-03-01T08:00:00Z");
        let ledger = QuotaLedger::new(Arc::clone(&store), clock.clone(), DailyCaps::default());

        store.create(&sync_log(SyncStatus::Success, "2026-02-28T02:00:00Z")).await.unwrap();
        store.create(&sync_log(SyncStatus::Error, "2026-03-01T02:00:00Z")).await.unwrap();
        store.create(&event("1", "עבר", ts("2026-02-20T10:00:00Z"))).await.unwrap();
        store.create(&event("2", "עתיד", ts("2026-03-09T10:00:00Z"))).await.unwrap();
        ledger.log_query_usage(QueryType::Competitor, 8).await.unwrap();

        let status = sync_status(store.as_ref(), clock.as_ref(), &ledger).await.unwrap();
        assert_eq!(status.last_sync.as_ref().map(|l| l.status), Some(SyncStatus::Error));
        assert_eq!(status.recent_syncs.len(), 2);
        assert_eq!(status.success_rate, Some(50.0));
        assert_eq!(status.total_events, 2);
        assert_eq!(status.upcoming_events, 1);
        assert_eq!(status.todays_search_logs.len(), 1);
        let competitor = &status.quota[0];
        assert_eq!((competitor.used, competitor.remaining), (8, 92));
        assert!(status.to_text().contains("last sync: error"));
    }

    #[tokio::test]
    async fn empty_store_has_no_success_rate() {
        let store = Arc::new(MemoryStore::new());
        let clock = fixed_clock("2026-03-01T08:00:00Z");
        let ledger = QuotaLedger::new(Arc::clone(&store), clock.clone(), DailyCaps::default());
        let status = sync_status(store.as_ref(), clock.as_ref(), &ledger).await.unwrap();
        assert!(status.success_rate.is_none());
        assert!(status.to_text().starts_with("last sync: never"));
    }
}
