//! Mirror the ticketing feed into the `events` table, keyed by external id.

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use kidsync_core::{Clock, Event, SyncLog, SyncStatus, NOT_SPECIFIED};
use kidsync_feeds::{EventFeed, RawFeedEvent};
use kidsync_storage::{Filter, Patch, Query, RecordStore, StoreError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::SyncError;

const KIDS_KEYWORDS: [&str; 4] = ["ילדים", "ילד", "נוער", "משפחה"];
const DEFAULT_CATEGORY: &str = "אחר";
const MIN_SLUG_CHARS: usize = 3;

/// Anything but Hebrew, a-z, digits, whitespace and hyphens.
static SLUG_STRIP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\x{0590}-\x{05FF}a-z0-9\s-]").expect("static pattern"));
static SLUG_SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static pattern"));
static SLUG_HYPHENS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-+").expect("static pattern"));

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSyncStats {
    pub total: u64,
    pub new: u64,
    pub updated: u64,
    pub removed: u64,
    pub skipped: u64,
    pub status: Option<SyncStatus>,
    pub error_message: Option<String>,
}

pub fn is_kids_event(raw: &RawFeedEvent) -> bool {
    let section = raw.section().unwrap_or_default().to_lowercase();
    KIDS_KEYWORDS.iter().any(|k| section.contains(k))
}

/// URL-safe, Hebrew-preserving slug. Names that strip down to almost nothing
/// get a time-based fallback.
pub fn generate_slug(name: &str, now: DateTime<Utc>) -> String {
    let lowered = name.to_lowercase();
    let stripped = SLUG_STRIP.replace_all(&lowered, "");
    let spaced = SLUG_SPACES.replace_all(&stripped, "-");
    let collapsed = SLUG_HYPHENS.replace_all(&spaced, "-");
    let slug = collapsed.trim_matches('-');
    if slug.chars().count() < MIN_SLUG_CHARS {
        format!("event-{}", now.timestamp_millis())
    } else {
        slug.to_string()
    }
}

const NAIVE_FORMATS: [&str; 5] = [
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%d/%m/%Y %H:%M",
];

/// Feed dates are RFC 3339 or local wall times.
pub fn parse_feed_date(text: &str, clock: &dyn Clock) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Some(naive) = NAIVE_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
    {
        return Some(clock.localize(naive));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .map(|d| clock.localize(d.and_time(chrono::NaiveTime::MIN)))
}

/// Map one feed entry onto the local event shape. `None` when it lacks an id
/// or a name.
pub fn normalize_event(
    raw: &RawFeedEvent,
    clock: &dyn Clock,
    ticket_base_url: &str,
) -> Option<Event> {
    let external_id = raw.external_id()?;
    let name = raw.name()?.trim().to_string();
    let now = clock.now();
    let date = match raw.date_text() {
        Some(text) => parse_feed_date(text, clock).unwrap_or_else(|| {
            warn!(%external_id, date = text, "unparsable feed date, using now");
            now
        }),
        None => now,
    };
    Some(Event {
        id: Uuid::new_v4(),
        slug: generate_slug(&name, now),
        ticket_url: format!("{}/announce/{external_id}", ticket_base_url.trim_end_matches('/')),
        external_id,
        name,
        description: raw.description().map(str::to_string),
        category: raw.section().unwrap_or(DEFAULT_CATEGORY).to_string(),
        date,
        time: raw.time().map(str::to_string),
        venue: raw.venue().unwrap_or(NOT_SPECIFIED).to_string(),
        city: raw.city().unwrap_or(NOT_SPECIFIED).to_string(),
        min_price: raw.price_min(),
        max_price: raw.price_max(),
        image_url: raw.image().map(str::to_string),
        performer_name: raw.performer_name().map(str::to_string),
        is_kids_event: true,
        last_synced: now,
        created_at: now,
        updated_at: now,
    })
}

pub struct EventReconciler<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    feed: Arc<dyn EventFeed>,
    ticket_base_url: String,
}

impl<S: RecordStore> EventReconciler<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        feed: Arc<dyn EventFeed>,
        ticket_base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            feed,
            ticket_base_url: ticket_base_url.into(),
        }
    }

    /// Fetch, filter, upsert and prune. Always writes one `SyncLog` row; on
    /// failure the row carries the error and the error is returned.
    pub async fn sync_events(&self) -> Result<EventSyncStats, SyncError> {
        let mut stats = EventSyncStats::default();
        let outcome = self
            .reconcile(&mut stats)
            .instrument(info_span!("sync_events"))
            .await;

        match outcome {
            Ok(()) => {
                stats.status = Some(SyncStatus::Success);
                self.write_log(&stats).await?;
                info!(
                    total = stats.total,
                    new = stats.new,
                    updated = stats.updated,
                    removed = stats.removed,
                    "event sync completed"
                );
                Ok(stats)
            }
            Err(err) => {
                stats.status = Some(SyncStatus::Error);
                stats.error_message = Some(err.to_string());
                if let Err(log_err) = self.write_log(&stats).await {
                    warn!(error = %log_err, "could not record failed sync");
                }
                warn!(error = %err, "event sync failed");
                Err(err)
            }
        }
    }

    async fn reconcile(&self, stats: &mut EventSyncStats) -> Result<(), SyncError> {
        let raw = self.feed.fetch_events().await?;
        let kids: Vec<_> = raw.iter().filter(|r| is_kids_event(r)).collect();
        info!(fetched = raw.len(), kids = kids.len(), "filtered feed");
        stats.total = kids.len() as u64;

        let existing: BTreeSet<String> = self
            .store
            .find_many::<Event>(Query::all())
            .await?
            .into_iter()
            .map(|e| e.external_id)
            .collect();
        let fresh: BTreeSet<String> = kids.iter().filter_map(|r| r.external_id()).collect();

        for entry in kids {
            let Some(event) = normalize_event(entry, self.clock.as_ref(), &self.ticket_base_url)
            else {
                warn!("feed entry without id or name skipped");
                stats.skipped += 1;
                continue;
            };
            match self.persist(event).await {
                Ok(true) => stats.new += 1,
                Ok(false) => stats.updated += 1,
                Err(err) => {
                    warn!(error = %err, "event upsert failed, continuing");
                    stats.skipped += 1;
                }
            }
        }

        let removed: Vec<&String> = existing.difference(&fresh).collect();
        if !removed.is_empty() {
            stats.removed = self
                .store
                .delete_many::<Event>(Filter::is_in("external_id", removed))
                .await?;
        }
        Ok(())
    }

    /// Insert or update one event. Returns whether it was new.
    async fn persist(&self, mut event: Event) -> Result<bool, StoreError> {
        if let Some(holder) = self
            .store
            .find_unique::<Event>(Filter::eq("slug", event.slug.as_str()))
            .await?
        {
            if holder.external_id != event.external_id {
                event.slug = format!("{}-{}", event.slug, event.external_id);
            }
        }

        let identity = Filter::eq("external_id", event.external_id.as_str());
        if self.store.count::<Event>(identity.clone()).await? > 0 {
            let patch = Patch::from_record(&event, &["id", "external_id", "created_at"]);
            self.store.update::<Event>(identity, patch).await?;
            Ok(false)
        } else {
            self.store.create(&event).await?;
            Ok(true)
        }
    }

    async fn write_log(&self, stats: &EventSyncStats) -> Result<(), StoreError> {
        let row = SyncLog {
            id: Uuid::new_v4(),
            status: stats.status.unwrap_or(SyncStatus::Error),
            events_total: stats.total as i64,
            events_new: stats.new as i64,
            events_updated: stats.updated as i64,
            events_removed: stats.removed as i64,
            error_message: stats.error_message.clone(),
            synced_at: self.clock.now(),
        };
        self.store.create(&row).await
    }
}
