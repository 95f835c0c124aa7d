//! Ticketing partner feed.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use kidsync_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::{json_at, json_str, EventFeed, FeedError};

pub const DEFAULT_FEED_URL: &str = "https://bravo.ticketsnow.co.il/xml/partner/shows.json";
pub const FEED_USER_AGENT: &str = "kids.ticketsnow.co.il";

/// Wrapper keys the feed has been seen to nest its list under.
const WRAPPER_KEYS: [&str; 3] = ["Shows", "shows", "events"];

/// One raw feed entry. Field names vary between feed revisions, so accessors
/// apply the known fallbacks and treat empty strings as missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawFeedEvent(JsonValue);

impl RawFeedEvent {
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    pub fn raw(&self) -> &JsonValue {
        &self.0
    }

    fn first_text(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|k| json_str(&self.0, &[*k]))
            .find(|s| !s.trim().is_empty())
    }

    /// Feed ids arrive as numbers or strings.
    pub fn external_id(&self) -> Option<String> {
        match self.0.get("id")? {
            JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.first_text(&["name"])
    }

    /// `section`, falling back to `category`.
    pub fn section(&self) -> Option<&str> {
        self.first_text(&["section", "category"])
    }

    pub fn date_text(&self) -> Option<&str> {
        self.first_text(&["dateFrom", "date"])
    }

    pub fn time(&self) -> Option<&str> {
        self.first_text(&["time"])
    }

    pub fn description(&self) -> Option<&str> {
        self.first_text(&["description", "announce"])
    }

    pub fn image(&self) -> Option<&str> {
        self.first_text(&["image", "imageUrl"])
    }

    pub fn performer_name(&self) -> Option<&str> {
        self.first_text(&["performerName"])
    }

    fn first_seance(&self) -> Option<&JsonValue> {
        ["Seances", "seances"]
            .iter()
            .filter_map(|k| json_at(&self.0, &[*k]).and_then(JsonValue::as_array))
            .find_map(|list| list.first())
    }

    fn seance_text(&self, keys: &[&str]) -> Option<&str> {
        let seance = self.first_seance()?;
        keys.iter()
            .filter_map(|k| json_str(seance, &[*k]))
            .find(|s| !s.trim().is_empty())
    }

    pub fn venue(&self) -> Option<&str> {
        self.seance_text(&["Hall", "hall"])
    }

    pub fn city(&self) -> Option<&str> {
        self.seance_text(&["City", "city"])
    }

    fn price(&self, key: &str) -> Option<f64> {
        let price = match self.0.get(key)? {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        price.filter(|p| p.is_finite())
    }

    pub fn price_min(&self) -> Option<f64> {
        self.price("priceMin")
    }

    pub fn price_max(&self) -> Option<f64> {
        self.price("priceMax")
    }
}

/// Accept a bare array or a list wrapped under one of the known keys.
pub fn parse_feed_value(value: JsonValue) -> Result<Vec<RawFeedEvent>, FeedError> {
    let list = match value {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut map) => {
            let key = WRAPPER_KEYS
                .iter()
                .find(|k| map.get(**k).is_some_and(JsonValue::is_array));
            match key.and_then(|k| map.remove(*k)) {
                Some(JsonValue::Array(items)) => items,
                _ => {
                    let keys = map.keys().cloned().collect::<Vec<_>>().join(", ");
                    return Err(FeedError::UnrecognizedShape { keys });
                }
            }
        }
        other => {
            return Err(FeedError::UnrecognizedShape {
                keys: format!("<{}>", json_kind(&other)),
            })
        }
    };
    Ok(list.into_iter().map(RawFeedEvent::new).collect())
}

pub fn parse_feed_str(text: &str) -> Result<Vec<RawFeedEvent>, FeedError> {
    let value: JsonValue =
        serde_json::from_str(text).map_err(|e| FeedError::Decode(e.to_string()))?;
    parse_feed_value(value)
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Live partner feed over HTTP. Transient failures retry with backoff.
#[derive(Debug, Clone)]
pub struct BravoFeed {
    http: HttpFetcher,
    url: String,
}

impl BravoFeed {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: Some(FEED_USER_AGENT.to_string()),
            backoff: BackoffPolicy::default(),
        })?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EventFeed for BravoFeed {
    async fn fetch_events(&self) -> Result<Vec<RawFeedEvent>, FeedError> {
        let body = self.http.get_json(&self.url, &[], None).await?;
        let events = parse_feed_value(body)?;
        info!(count = events.len(), url = %self.url, "fetched feed");
        Ok(events)
    }
}

/// Feed snapshot read from disk, for dry runs and replays.
#[derive(Debug, Clone)]
pub struct JsonFileFeed {
    path: PathBuf,
}

impl JsonFileFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl EventFeed for JsonFileFeed {
    async fn fetch_events(&self) -> Result<Vec<RawFeedEvent>, FeedError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| FeedError::Decode(format!("reading {}: {e}", self.path.display())))?;
        debug!(path = %self.path.display(), "read feed snapshot");
        parse_feed_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn accepts_bare_and_wrapped_lists() {
        let bare = parse_feed_value(json!([{"id": 1}])).unwrap();
        assert_eq!(bare.len(), 1);
        for key in WRAPPER_KEYS {
            let mut body = serde_json::Map::new();
            body.insert(key.to_string(), json!([{"id": 1}, {"id": 2}]));
            let wrapped = parse_feed_value(JsonValue::Object(body)).unwrap();
            assert_eq!(wrapped.len(), 2);
        }
    }

    #[test]
    fn rejects_unknown_shapes() {
        let err = parse_feed_value(json!({"data": [], "meta": {}})).unwrap_err();
        match err {
            FeedError::UnrecognizedShape { keys } => assert_eq!(keys, "data, meta"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse_feed_value(json!("oops")).is_err());
        assert!(matches!(parse_feed_str("{not json"), Err(FeedError::Decode(_))));
    }

    #[test]
    fn accessors_apply_fallbacks() {
        let ev = RawFeedEvent::new(json!({
            "id": 4521,
            "name": "שלגיה",
            "section": "",
            "category": "הצגות ילדים",
            "date": "2026-03-10T17:00:00",
            "announce": "הצגה מרגשת",
            "imageUrl": "https://img/1.jpg",
            "seances": [{"hall": "היכל התרבות", "City": "חיפה"}, {"hall": "x"}],
            "priceMin": "59.9",
            "priceMax": 120
        }));
        assert_eq!(ev.external_id().as_deref(), Some("4521"));
        assert_eq!(ev.section(), Some("הצגות ילדים"));
        assert_eq!(ev.date_text(), Some("2026-03-10T17:00:00"));
        assert_eq!(ev.description(), Some("הצגה מרגשת"));
        assert_eq!(ev.image(), Some("https://img/1.jpg"));
        assert_eq!(ev.venue(), Some("היכל התרבות"));
        assert_eq!(ev.city(), Some("חיפה"));
        assert_eq!(ev.price_min(), Some(59.9));
        assert_eq!(ev.price_max(), Some(120.0));
        assert_eq!(ev.performer_name(), None);
    }

    #[test]
    fn missing_or_blank_ids_are_none() {
        assert!(RawFeedEvent::new(json!({"name": "x"})).external_id().is_none());
        assert!(RawFeedEvent::new(json!({"id": "  "})).external_id().is_none());
        assert_eq!(
            RawFeedEvent::new(json!({"id": "A-7"})).external_id().as_deref(),
            Some("A-7")
        );
    }
}
