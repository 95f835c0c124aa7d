//! Read-side event queries used by the site: listings, search and cities.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Months, Utc};
use kidsync_core::{Clock, Event, NOT_SPECIFIED};
use kidsync_storage::{Filter, Query, RecordStore, StoreError};
use serde::Deserialize;

/// Text fields matched by a free-text query.
const SEARCH_FIELDS: [&str; 5] = ["name", "venue", "city", "performer_name", "category"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DateWindow {
    #[serde(rename = "today")]
    Today,
    #[serde(rename = "week")]
    Week,
    #[serde(rename = "month")]
    Month,
    #[serde(rename = "3months")]
    ThreeMonths,
}

impl FromStr for DateWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "today" => Ok(DateWindow::Today),
            "week" => Ok(DateWindow::Week),
            "month" => Ok(DateWindow::Month),
            "3months" => Ok(DateWindow::ThreeMonths),
            other => Err(format!("unknown date window `{other}`")),
        }
    }
}

impl DateWindow {
    /// `[now, end]` for this window.
    pub fn end(&self, clock: &dyn Clock) -> DateTime<Utc> {
        let now = clock.now();
        match self {
            DateWindow::Today => clock.next_day_start(now),
            DateWindow::Week => now + Duration::days(7),
            DateWindow::Month => now.checked_add_months(Months::new(1)).unwrap_or(now + Duration::days(31)),
            DateWindow::ThreeMonths => now
                .checked_add_months(Months::new(3))
                .unwrap_or(now + Duration::days(92)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSort {
    #[default]
    Date,
    DateDesc,
    Created,
    Updated,
    Name,
}

impl FromStr for EventSort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "date" => Ok(EventSort::Date),
            "date_desc" => Ok(EventSort::DateDesc),
            "created" => Ok(EventSort::Created),
            "updated" => Ok(EventSort::Updated),
            "name" => Ok(EventSort::Name),
            other => Err(format!("unknown sort `{other}`")),
        }
    }
}

impl EventSort {
    fn apply(&self, query: Query) -> Query {
        match self {
            EventSort::Date => query.asc("date"),
            EventSort::DateDesc => query.desc("date"),
            EventSort::Created => query.desc("created_at"),
            EventSort::Updated => query.desc("updated_at"),
            EventSort::Name => query.asc("name"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventSearch {
    pub query: Option<String>,
    pub city: Option<String>,
    pub window: Option<DateWindow>,
    pub sort: EventSort,
    pub limit: usize,
    pub offset: usize,
}

pub struct EventQueries<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: RecordStore> EventQueries<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn upcoming_filter(&self) -> Filter {
        Filter::gte("date", self.clock.now())
    }

    pub async fn upcoming_events(&self, limit: usize, offset: usize) -> Result<Vec<Event>, StoreError> {
        self.store
            .find_many::<Event>(
                Query::new(self.upcoming_filter())
                    .asc("date")
                    .limit(limit)
                    .offset(offset),
            )
            .await
    }

    pub async fn upcoming_events_count(&self) -> Result<u64, StoreError> {
        self.store.count::<Event>(self.upcoming_filter()).await
    }

    pub async fn event_by_slug(&self, slug: &str) -> Result<Option<Event>, StoreError> {
        self.store.find_unique::<Event>(Filter::eq("slug", slug)).await
    }

    fn search_filter(&self, search: &EventSearch) -> Filter {
        let mut filter = self.upcoming_filter();
        if let Some(text) = search.query.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            filter = filter.and(Filter::Or(
                SEARCH_FIELDS
                    .iter()
                    .map(|&field| Filter::contains(field, text))
                    .collect(),
            ));
        }
        if let Some(city) = search.city.as_deref().filter(|c| !c.is_empty()) {
            filter = filter.and(Filter::eq("city", city));
        }
        if let Some(window) = search.window {
            filter = filter.and(Filter::lte("date", window.end(self.clock.as_ref())));
        }
        filter
    }

    pub async fn search_events(&self, search: &EventSearch) -> Result<Vec<Event>, StoreError> {
        let query = search
            .sort
            .apply(Query::new(self.search_filter(search)))
            .limit(search.limit)
            .offset(search.offset);
        self.store.find_many::<Event>(query).await
    }

    pub async fn search_events_count(&self, search: &EventSearch) -> Result<u64, StoreError> {
        self.store.count::<Event>(self.search_filter(search)).await
    }

    /// Distinct known cities, sorted.
    pub async fn unique_cities(&self) -> Result<Vec<String>, StoreError> {
        let events = self.store.find_many::<Event>(Query::all()).await?;
        let cities: BTreeSet<String> = events
            .into_iter()
            .map(|e| e.city)
            .filter(|c| !c.is_empty() && c != NOT_SPECIFIED)
            .collect();
        Ok(cities.into_iter().collect())
    }
}
