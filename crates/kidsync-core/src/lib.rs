//! Core domain records, clocks and cache-state rules for kidsync.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, FixedOffset, Local, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kidsync-core";

/// Placeholder the feed normalizer writes when a venue or city is missing.
pub const NOT_SPECIFIED: &str = "לא צוין";

/// Kind of external query tracked by the daily quota ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Competitor,
    VideoSearch,
    VideoComments,
}

impl QueryType {
    pub const ALL: [QueryType; 3] = [
        QueryType::Competitor,
        QueryType::VideoSearch,
        QueryType::VideoComments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Competitor => "competitor",
            QueryType::VideoSearch => "video_search",
            QueryType::VideoComments => "video_comments",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "competitor" => Ok(QueryType::Competitor),
            "video_search" => Ok(QueryType::VideoSearch),
            "video_comments" => Ok(QueryType::VideoComments),
            other => Err(format!("unknown query type {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(SyncStatus::Success),
            "error" => Ok(SyncStatus::Error),
            other => Err(format!("unknown sync status {other}")),
        }
    }
}

/// A kids' event mirrored from the ticketing feed. `external_id` is the join key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub external_id: String,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub category: String,
    pub date: DateTime<Utc>,
    pub time: Option<String>,
    pub venue: String,
    pub city: String,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub image_url: Option<String>,
    pub ticket_url: String,
    pub performer_name: Option<String>,
    pub is_kids_event: bool,
    pub last_synced: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Cached link to the same event on a competitor ticketing site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitorMatch {
    pub id: Uuid,
    pub event_id: Uuid,
    pub competitor_name: String,
    pub competitor_url: String,
    pub match_score: f64,
    pub checked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YouTubeVideo {
    pub id: Uuid,
    pub event_id: Uuid,
    pub video_id: String,
    pub title: String,
    pub thumbnail_url: String,
    pub channel_title: String,
    pub checked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A comment or reply on a video. `parent_comment_id` is a weak link by
/// platform-assigned id, never a foreign key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoComment {
    pub comment_id: String,
    pub video_id: String,
    pub author_name: String,
    pub author_channel_id: Option<String>,
    pub author_profile_url: Option<String>,
    pub text_display: String,
    pub like_count: i64,
    pub published_at: DateTime<Utc>,
    pub is_reply: bool,
    pub parent_comment_id: Option<String>,
    pub checked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Append-only usage row; the ledger only ever sums these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchLog {
    pub id: Uuid,
    pub date: DateTime<Utc>,
    pub query_type: QueryType,
    pub queries_used: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLog {
    pub id: Uuid,
    pub status: SyncStatus,
    pub events_total: i64,
    pub events_new: i64,
    pub events_updated: i64,
    pub events_removed: i64,
    pub error_message: Option<String>,
    pub synced_at: DateTime<Utc>,
}

/// Mutual-exclusion record for a named run. At most one row per `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLease {
    pub name: String,
    pub owner: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A cached row is valid iff its absolute expiry is strictly in the future.
pub fn is_valid(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expires_at > now
}

/// Whole days until `date`, rounded up (an event later today is 1 day away).
pub fn days_until(date: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    const DAY_MS: i64 = 24 * 60 * 60 * 1000;
    let diff = (date - now).num_milliseconds();
    -(-diff).div_euclid(DAY_MS)
}

/// Cache state of one entity for one data kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Never fetched.
    Unchecked,
    /// At least one row is still valid.
    Cached { expires_at: DateTime<Utc> },
    /// Fetched before, every row has expired.
    Stale { last_expired_at: DateTime<Utc> },
}

impl CacheState {
    /// Derive the state from the newest `expires_at` among the entity's rows.
    pub fn derive(now: DateTime<Utc>, newest_expiry: Option<DateTime<Utc>>) -> Self {
        match newest_expiry {
            None => CacheState::Unchecked,
            Some(expires_at) if is_valid(expires_at, now) => CacheState::Cached { expires_at },
            Some(last_expired_at) => CacheState::Stale { last_expired_at },
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, CacheState::Cached { .. })
    }

    pub fn ever_checked(&self) -> bool {
        !matches!(self, CacheState::Unchecked)
    }
}

/// Time source. Every "today" in the system is the local calendar day.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Local midnight at or before `at`.
    fn start_of_day(&self, at: DateTime<Utc>) -> DateTime<Utc>;

    /// Interpret a feed-local wall time.
    fn localize(&self, naive: NaiveDateTime) -> DateTime<Utc>;

    fn today_start(&self) -> DateTime<Utc> {
        self.start_of_day(self.now())
    }

    /// The local midnight that ends the day containing `at`.
    fn next_day_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        self.start_of_day(self.start_of_day(at) + Duration::hours(36))
    }

    fn same_local_day(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        self.start_of_day(a) == self.start_of_day(b)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn start_of_day(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = at.with_timezone(&Local).date_naive().and_time(NaiveTime::MIN);
        Local
            .from_local_datetime(&midnight)
            .earliest()
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|| midnight.and_utc())
    }

    fn localize(&self, naive: NaiveDateTime) -> DateTime<Utc> {
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|| naive.and_utc())
    }
}

/// Settable clock with a fixed UTC offset, for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
    offset: FixedOffset,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self {
            now: Mutex::new(now),
            offset,
        }
    }

    pub fn utc(now: DateTime<Utc>) -> Self {
        Self::new(now, Utc.fix())
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_of_day(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = at
            .with_timezone(&self.offset)
            .date_naive()
            .and_time(NaiveTime::MIN);
        self.localize(midnight)
    }

    fn localize(&self, naive: NaiveDateTime) -> DateTime<Utc> {
        (naive - self.offset).and_utc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn days_until_rounds_up_partial_days() {
        let now = ts("2026-03-01T10:00:00Z");
        assert_eq!(days_until(ts("2026-03-01T10:00:00Z"), now), 0);
        assert_eq!(days_until(ts("2026-03-01T11:00:00Z"), now), 1);
        assert_eq!(days_until(ts("2026-03-15T10:00:00Z"), now), 14);
        assert_eq!(days_until(ts("2026-03-15T10:00:01Z"), now), 15);
        assert_eq!(days_until(ts("2026-02-28T11:00:00Z"), now), 0);
        assert_eq!(days_until(ts("2026-02-28T09:00:00Z"), now), -1);
    }

    #[test]
    fn cache_state_follows_newest_expiry() {
        let now = ts("2026-03-01T10:00:00Z");
        assert_eq!(CacheState::derive(now, None), CacheState::Unchecked);
        assert!(CacheState::derive(now, Some(ts("2026-03-02T00:00:00Z"))).is_hit());
        let stale = CacheState::derive(now, Some(now));
        assert!(!stale.is_hit());
        assert!(stale.ever_checked());
    }

    #[test]
    fn fixed_clock_midnight_uses_local_offset() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let clock = FixedClock::new(ts("2026-03-01T23:30:00Z"), offset);
        // 01:30 local on March 2nd
        assert_eq!(clock.today_start(), ts("2026-03-01T22:00:00Z"));
        assert!(!clock.same_local_day(ts("2026-03-01T21:59:00Z"), clock.now()));
        assert!(clock.same_local_day(ts("2026-03-01T22:00:00Z"), clock.now()));
        assert_eq!(clock.next_day_start(clock.now()), ts("2026-03-02T22:00:00Z"));
    }

    #[test]
    fn query_type_round_trips_through_text() {
        for qt in QueryType::ALL {
            assert_eq!(qt.as_str().parse::<QueryType>().unwrap(), qt);
        }
        assert!("youtube".parse::<QueryType>().is_err());
    }
}
