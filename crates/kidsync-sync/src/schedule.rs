//! Refresh policy per data kind, as pure functions of cache state and event
//! proximity. The async `should_*` helpers load state and call into these.

use kidsync_core::CacheState;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    CacheValid,
    TooFar,
    AlreadySearched,
    OutsideWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Event is close; refresh whenever the cache misses.
    High,
    /// Event appeared in the feed today.
    NewEvent,
    /// Further out, and never fetched before.
    Backfill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "decision", content = "why")]
pub enum RefreshDecision {
    Skip(SkipReason),
    Refresh(Priority),
}

impl RefreshDecision {
    pub fn should_refresh(&self) -> bool {
        matches!(self, RefreshDecision::Refresh(_))
    }
}

pub const HIGH_PRIORITY_DAYS: i64 = 14;
pub const HORIZON_DAYS: i64 = 30;
pub const COMMENT_WINDOW_DAYS: (i64, i64) = (-1, 7);

pub fn competitor_decision(state: CacheState, days_until: i64) -> RefreshDecision {
    use RefreshDecision::*;
    match state {
        CacheState::Cached { .. } => Skip(SkipReason::CacheValid),
        _ if days_until > HORIZON_DAYS => Skip(SkipReason::TooFar),
        _ if days_until <= HIGH_PRIORITY_DAYS => Refresh(Priority::High),
        CacheState::Unchecked => Refresh(Priority::Backfill),
        CacheState::Stale { .. } => Skip(SkipReason::AlreadySearched),
    }
}

pub fn video_decision(state: CacheState, days_until: i64, created_today: bool) -> RefreshDecision {
    use RefreshDecision::*;
    match state {
        CacheState::Cached { .. } => Skip(SkipReason::CacheValid),
        _ if (0..=HIGH_PRIORITY_DAYS).contains(&days_until) => Refresh(Priority::High),
        _ if created_today => Refresh(Priority::NewEvent),
        CacheState::Unchecked if days_until <= HORIZON_DAYS => Refresh(Priority::Backfill),
        CacheState::Unchecked => Skip(SkipReason::TooFar),
        CacheState::Stale { .. } => Skip(SkipReason::AlreadySearched),
    }
}

pub fn comment_decision(state: CacheState, days_until: i64) -> RefreshDecision {
    let (from, to) = COMMENT_WINDOW_DAYS;
    match state {
        CacheState::Cached { .. } => RefreshDecision::Skip(SkipReason::CacheValid),
        _ if (from..=to).contains(&days_until) => RefreshDecision::Refresh(Priority::High),
        _ => RefreshDecision::Skip(SkipReason::OutsideWindow),
    }
}
