//! Daily external-query ledger backed by append-only `SearchLog` rows.

use std::sync::Arc;

use kidsync_core::{Clock, QueryType, SearchLog};
use kidsync_storage::{Filter, Query, RecordStore, StoreError};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DailyCaps;
use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub query_type: QueryType,
    pub used: u64,
    pub cap: u64,
    pub remaining: u64,
    pub percent_used: f64,
}

/// One gate per query type. Every clone of a ledger shares them, so a check
/// and the matching spend never interleave with another caller's.
type Gates = Arc<[Arc<Mutex<()>>; 3]>;

pub struct QuotaLedger<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    caps: DailyCaps,
    gates: Gates,
}

impl<S> Clone for QuotaLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            caps: self.caps,
            gates: Arc::clone(&self.gates),
        }
    }
}

impl<S: RecordStore> QuotaLedger<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, caps: DailyCaps) -> Self {
        Self {
            store,
            clock,
            caps,
            gates: Arc::new(std::array::from_fn(|_| Arc::new(Mutex::new(())))),
        }
    }

    fn gate(&self, query_type: QueryType) -> Arc<Mutex<()>> {
        let slot = match query_type {
            QueryType::Competitor => 0,
            QueryType::VideoSearch => 1,
            QueryType::VideoComments => 2,
        };
        Arc::clone(&self.gates[slot])
    }

    pub fn cap(&self, query_type: QueryType) -> u64 {
        self.caps.cap(query_type)
    }

    fn today_filter(&self) -> Filter {
        let start = self.clock.today_start();
        Filter::gte("date", start).and(Filter::lt("date", self.clock.next_day_start(start)))
    }

    /// Sum of `queries_used` logged today for `query_type`.
    pub async fn daily_query_count(&self, query_type: QueryType) -> Result<u64, StoreError> {
        let filter = self
            .today_filter()
            .and(Filter::eq("query_type", query_type.as_str()));
        let logs = self.store.find_many::<SearchLog>(Query::new(filter)).await?;
        Ok(logs.iter().map(|l| l.queries_used.max(0) as u64).sum())
    }

    /// Append one usage row. Rows are never updated.
    pub async fn log_query_usage(&self, query_type: QueryType, count: u64) -> Result<(), StoreError> {
        let row = SearchLog {
            id: Uuid::new_v4(),
            date: self.clock.now(),
            query_type,
            queries_used: count as i64,
        };
        self.store.create(&row).await?;
        debug!(%query_type, count, "logged query usage");
        Ok(())
    }

    pub async fn remaining(&self, query_type: QueryType) -> Result<u64, StoreError> {
        let used = self.daily_query_count(query_type).await?;
        Ok(self.cap(query_type).saturating_sub(used))
    }

    /// Fail with `QuotaExceeded` unless `needed` more queries fit under today's cap.
    /// Returns today's usage so far.
    pub async fn ensure_available(&self, query_type: QueryType, needed: u64) -> Result<u64, SyncError> {
        let used = self.daily_query_count(query_type).await?;
        let cap = self.cap(query_type);
        if used + needed > cap {
            warn!(%query_type, used, needed, cap, "daily quota would be exceeded");
            return Err(SyncError::QuotaExceeded {
                query_type,
                used,
                needed,
                cap,
            });
        }
        Ok(used)
    }

    /// Wait for the query type's gate, then check that `needed` queries fit.
    /// The gate stays closed until the returned reservation is committed or
    /// dropped, so concurrent lookups cannot spend the same headroom twice.
    pub async fn reserve(
        &self,
        query_type: QueryType,
        needed: u64,
    ) -> Result<QuotaReservation<S>, SyncError> {
        let guard = self.gate(query_type).lock_owned().await;
        let used = self.ensure_available(query_type, needed).await?;
        Ok(QuotaReservation {
            ledger: self.clone(),
            query_type,
            used_before: used,
            needed,
            _gate: guard,
        })
    }

    pub async fn usage(&self) -> Result<Vec<QuotaUsage>, StoreError> {
        let mut out = Vec::with_capacity(QueryType::ALL.len());
        for query_type in QueryType::ALL {
            let used = self.daily_query_count(query_type).await?;
            let cap = self.cap(query_type);
            let percent_used = if cap == 0 {
                100.0
            } else {
                (used as f64 / cap as f64 * 1000.0).round() / 10.0
            };
            out.push(QuotaUsage {
                query_type,
                used,
                cap,
                remaining: cap.saturating_sub(used),
                percent_used,
            });
        }
        Ok(out)
    }

    /// Today's raw usage rows, newest first.
    pub async fn todays_logs(&self) -> Result<Vec<SearchLog>, StoreError> {
        self.store
            .find_many::<SearchLog>(Query::new(self.today_filter()).desc("date"))
            .await
    }
}

/// Headroom held under a query type's gate. Dropping it without
/// `commit` logs nothing.
pub struct QuotaReservation<S> {
    ledger: QuotaLedger<S>,
    query_type: QueryType,
    used_before: u64,
    needed: u64,
    _gate: OwnedMutexGuard<()>,
}

impl<S: RecordStore> QuotaReservation<S> {
    /// Today's usage when the reservation was granted.
    pub fn used_before(&self) -> u64 {
        self.used_before
    }

    /// Log the queries actually issued and reopen the gate.
    pub async fn commit(self, issued: u64) -> Result<(), StoreError> {
        if issued > self.needed {
            warn!(query_type = %self.query_type, issued, reserved = self.needed, "issued more queries than reserved");
        }
        if issued > 0 {
            self.ledger.log_query_usage(self.query_type, issued).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use kidsync_storage::MemoryStore;

    use super::*;
    use crate::testing::{fixed_clock, ts};

    fn ledger(store: &Arc<MemoryStore>, clock: Arc<dyn Clock>) -> QuotaLedger<MemoryStore> {
        QuotaLedger::new(Arc::clone(store), clock, DailyCaps::default())
    }

    async fn insert_log(store: &MemoryStore, date: &str, qt: QueryType, used: i64) {
        store
            .create(&SearchLog {
                id: Uuid::new_v4(),
                date: ts(date),
                query_type: qt,
                queries_used: used,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn count_only_sums_todays_rows_of_the_type() {
        let store = Arc::new(MemoryStore::new());
        let clock = fixed_clock("2026-03-10T09:00:00Z");
        insert_log(&store, "2026-03-10T01:00:00Z", QueryType::Competitor, 4).await;
        insert_log(&store, "2026-03-09T20:00:00Z", QueryType::Competitor, 50).await;
        insert_log(&store, "2026-03-10T02:00:00Z", QueryType::VideoSearch, 7).await;

        let ledger = ledger(&store, clock);
        assert_eq!(ledger.daily_query_count(QueryType::Competitor).await.unwrap(), 4);
        assert_eq!(ledger.daily_query_count(QueryType::VideoSearch).await.unwrap(), 7);
        assert_eq!(ledger.remaining(QueryType::Competitor).await.unwrap(), 96);
    }

    #[tokio::test]
    async fn logging_appends_and_resets_at_midnight() {
        let store = Arc::new(MemoryStore::new());
        let clock = fixed_clock("2026-03-10T22:00:00Z");
        let ledger = QuotaLedger::new(Arc::clone(&store), clock.clone(), DailyCaps::default());

        ledger.log_query_usage(QueryType::Competitor, 4).await.unwrap();
        ledger.log_query_usage(QueryType::Competitor, 3).await.unwrap();
        assert_eq!(store.row_count("search_logs").await, 2);
        assert_eq!(ledger.daily_query_count(QueryType::Competitor).await.unwrap(), 7);

        clock.advance(Duration::hours(3));
        assert_eq!(ledger.daily_query_count(QueryType::Competitor).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ensure_available_rejects_overspend() {
        let store = Arc::new(MemoryStore::new());
        let clock = fixed_clock("2026-03-10T09:00:00Z");
        insert_log(&store, "2026-03-10T08:00:00Z", QueryType::Competitor, 97).await;
        let ledger = ledger(&store, clock);

        assert_eq!(ledger.ensure_available(QueryType::Competitor, 3).await.unwrap(), 97);
        let err = ledger
            .ensure_available(QueryType::Competitor, 4)
            .await
            .unwrap_err();
        assert!(err.is_quota());
        match err {
            SyncError::QuotaExceeded { used, needed, cap, .. } => {
                assert_eq!((used, needed, cap), (97, 4, 100));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn reservations_log_what_was_issued() {
        let store = Arc::new(MemoryStore::new());
        let clock = fixed_clock("2026-03-10T09:00:00Z");
        let ledger = ledger(&store, clock);

        let held = ledger.reserve(QueryType::Competitor, 4).await.unwrap();
        assert_eq!(held.used_before(), 0);
        // other query types are gated separately
        let videos = ledger.reserve(QueryType::VideoSearch, 2).await.unwrap();
        videos.commit(1).await.unwrap();
        held.commit(3).await.unwrap();

        let abandoned = ledger.reserve(QueryType::Competitor, 4).await.unwrap();
        assert_eq!(abandoned.used_before(), 3);
        drop(abandoned);

        assert_eq!(ledger.daily_query_count(QueryType::Competitor).await.unwrap(), 3);
        assert_eq!(ledger.daily_query_count(QueryType::VideoSearch).await.unwrap(), 1);
        assert_eq!(store.row_count("search_logs").await, 2);
    }

    #[tokio::test]
    async fn waiting_reservation_sees_the_committed_spend() {
        let store = Arc::new(MemoryStore::new());
        let clock = fixed_clock("2026-03-10T09:00:00Z");
        insert_log(&store, "2026-03-10T08:00:00Z", QueryType::Competitor, 96).await;
        let ledger = ledger(&store, clock);

        let held = ledger.reserve(QueryType::Competitor, 4).await.unwrap();
        let contender = ledger.clone();
        let waiting =
            tokio::spawn(async move { contender.reserve(QueryType::Competitor, 4).await.map(|_| ()) });
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        held.commit(4).await.unwrap();
        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, SyncError::QuotaExceeded { used: 100, .. }));
    }

    #[tokio::test]
    async fn usage_reports_every_query_type() {
        let store = Arc::new(MemoryStore::new());
        let clock = fixed_clock("2026-03-10T09:00:00Z");
        insert_log(&store, "2026-03-10T08:00:00Z", QueryType::VideoComments, 25).await;
        let usage = ledger(&store, clock).usage().await.unwrap();
        assert_eq!(usage.len(), 3);
        let comments = usage
            .iter()
            .find(|u| u.query_type == QueryType::VideoComments)
            .unwrap();
        assert_eq!(comments.remaining, 75);
        assert_eq!(comments.percent_used, 25.0);
    }
}
