//! Competitor price-comparison links: cache check, quota-guarded lookup and
//! the daily queue.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use kidsync_core::{days_until, CacheState, Clock, CompetitorMatch, Event, QueryType};
use kidsync_feeds::{SearchError, SiteSearch};
use kidsync_storage::{Filter, Patch, Query, RecordStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{Competitor, RefreshPolicy};
use crate::quota::QuotaLedger;
use crate::schedule::{competitor_decision, RefreshDecision, HORIZON_DAYS};
use crate::scoring::calculate_match_score;
use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetitorLookup {
    pub matches: Vec<CompetitorMatch>,
    pub from_cache: bool,
    pub queries_used: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetitorQueueStats {
    pub processed: u64,
    pub queries_used: u64,
    pub remaining: u64,
    pub matches_found: u64,
}

pub struct CompetitorRefresher<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    ledger: QuotaLedger<S>,
    search: Arc<dyn SiteSearch>,
    competitors: Vec<Competitor>,
    threshold: f64,
    ttl: Duration,
    results_per_site: u32,
    call_delay: StdDuration,
}

impl<S: RecordStore> CompetitorRefresher<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        ledger: QuotaLedger<S>,
        search: Arc<dyn SiteSearch>,
        policy: &RefreshPolicy,
        call_delay: StdDuration,
    ) -> Self {
        Self {
            store,
            clock,
            ledger,
            search,
            competitors: policy.competitors.clone(),
            threshold: policy.match_threshold,
            ttl: policy.competitor_ttl(),
            results_per_site: policy.results_per_site,
            call_delay,
        }
    }

    /// Queries one lookup costs: one per competitor site.
    pub fn queries_per_event(&self) -> u64 {
        self.competitors.len() as u64
    }

    pub async fn cache_state(&self, event_id: Uuid) -> Result<CacheState, StoreError> {
        let newest = self
            .store
            .find_first::<CompetitorMatch>(
                Query::new(Filter::eq("event_id", event_id)).desc("expires_at"),
            )
            .await?;
        Ok(CacheState::derive(self.clock.now(), newest.map(|m| m.expires_at)))
    }

    pub async fn refresh_decision(&self, event: &Event) -> Result<RefreshDecision, StoreError> {
        let state = self.cache_state(event.id).await?;
        Ok(competitor_decision(state, days_until(event.date, self.clock.now())))
    }

    pub async fn should_search_today(&self, event: &Event) -> Result<bool, StoreError> {
        Ok(self.refresh_decision(event).await?.should_refresh())
    }

    /// Valid cached matches, best first.
    pub async fn cached_matches(&self, event_id: Uuid) -> Result<Vec<CompetitorMatch>, StoreError> {
        let filter = Filter::eq("event_id", event_id).and(Filter::gt("expires_at", self.clock.now()));
        self.store
            .find_many::<CompetitorMatch>(Query::new(filter).desc("match_score"))
            .await
    }

    /// Cached matches when valid; otherwise search every competitor site and
    /// cache the best passing result per competitor.
    pub async fn find_competitor_matches(&self, event: &Event) -> Result<CompetitorLookup, SyncError> {
        let cached = self.cached_matches(event.id).await?;
        if !cached.is_empty() {
            debug!(event_id = %event.id, "competitor cache hit");
            return Ok(CompetitorLookup {
                matches: cached,
                from_cache: true,
                queries_used: 0,
            });
        }

        let reservation = self
            .ledger
            .reserve(QueryType::Competitor, self.queries_per_event())
            .await?;

        let now = self.clock.now();
        let expires_at = now + self.ttl;
        let mut best: Vec<CompetitorMatch> = Vec::new();
        let mut queries_used = 0u64;
        let mut upstream_quota: Option<SearchError> = None;

        for (i, competitor) in self.competitors.iter().enumerate() {
            if i > 0 && !self.call_delay.is_zero() {
                tokio::time::sleep(self.call_delay).await;
            }
            let outcome = self
                .search
                .search(&event.name, &competitor.domain, self.results_per_site)
                .await;
            match outcome {
                Err(SearchError::NotConfigured(what)) => {
                    return Err(SyncError::Config(what.to_string()));
                }
                Err(err) if err.is_quota() => {
                    queries_used += 1;
                    upstream_quota = Some(err);
                    break;
                }
                Err(err) => {
                    queries_used += 1;
                    warn!(competitor = %competitor.name, error = %err, "competitor search failed");
                }
                Ok(results) => {
                    queries_used += 1;
                    let top = results
                        .iter()
                        .map(|r| (calculate_match_score(r, event), r))
                        .filter(|(score, _)| *score >= self.threshold)
                        .fold(None, |acc: Option<(f64, _)>, (score, r)| match acc {
                            Some((kept, _)) if kept >= score => acc,
                            _ => Some((score, r)),
                        });
                    if let Some((score, r)) = top {
                        info!(competitor = %competitor.name, score, url = %r.link, "competitor match");
                        best.push(CompetitorMatch {
                            id: Uuid::new_v4(),
                            event_id: event.id,
                            competitor_name: competitor.name.clone(),
                            competitor_url: r.link.clone(),
                            match_score: score,
                            checked_at: now,
                            expires_at,
                        });
                    }
                }
            }
        }

        reservation.commit(queries_used).await?;
        if let Some(err) = upstream_quota {
            warn!(event_id = %event.id, queries_used, "upstream search quota exhausted");
            return Err(err.into());
        }

        for m in &best {
            let patch = Patch::new()
                .set("competitor_url", m.competitor_url.as_str())
                .set("match_score", m.match_score)
                .set("checked_at", m.checked_at)
                .set("expires_at", m.expires_at);
            if let Err(err) = self.store.upsert(m, patch).await {
                warn!(competitor = %m.competitor_name, error = %err, "caching competitor match failed");
            }
        }
        best.sort_by(|a, b| b.match_score.total_cmp(&a.match_score));
        info!(event = %event.name, matches = best.len(), queries_used, "competitor search done");
        Ok(CompetitorLookup {
            matches: best,
            from_cache: false,
            queries_used,
        })
    }

    /// Search upcoming events, soonest first, until `max_queries` for today
    /// would be exceeded or a lookup fails.
    pub async fn process_queue(&self, max_queries: u64) -> Result<CompetitorQueueStats, SyncError> {
        self.run_queue(max_queries)
            .instrument(info_span!("competitor_queue", max_queries))
            .await
    }

    async fn run_queue(&self, max_queries: u64) -> Result<CompetitorQueueStats, SyncError> {
        let used_before = self.ledger.daily_query_count(QueryType::Competitor).await?;
        let budget = max_queries.min(self.ledger.cap(QueryType::Competitor));
        let available = budget.saturating_sub(used_before);
        if available == 0 {
            info!("competitor quota exhausted for today");
            return Ok(CompetitorQueueStats::default());
        }

        let now = self.clock.now();
        let window = Filter::eq("is_kids_event", true)
            .and(Filter::gte("date", now))
            .and(Filter::lte("date", now + Duration::days(HORIZON_DAYS)));
        let events = self
            .store
            .find_many::<Event>(Query::new(window).asc("date"))
            .await?;

        let per_event = self.queries_per_event();
        let mut stats = CompetitorQueueStats::default();
        let mut spent = 0u64;
        for event in &events {
            if spent + per_event > available {
                break;
            }
            match self.should_search_today(event).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!(event_id = %event.id, error = %err, "competitor cache check failed, stopping queue");
                    break;
                }
            }
            match self.find_competitor_matches(event).await {
                Ok(lookup) => {
                    stats.processed += 1;
                    stats.matches_found += lookup.matches.len() as u64;
                    spent += lookup.queries_used;
                }
                Err(err) => {
                    warn!(event_id = %event.id, error = %err, "stopping competitor queue");
                    break;
                }
            }
        }

        let used_after = self.ledger.daily_query_count(QueryType::Competitor).await?;
        stats.queries_used = used_after.saturating_sub(used_before);
        stats.remaining = available.saturating_sub(stats.queries_used);
        info!(
            processed = stats.processed,
            queries_used = stats.queries_used,
            remaining = stats.remaining,
            "competitor queue done"
        );
        Ok(stats)
    }
}
