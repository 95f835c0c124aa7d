//! `Record` bindings for the core domain types.

use kidsync_core::{
    CompetitorMatch, Event, QueryType, RunLease, SearchLog, SyncLog, SyncStatus, VideoComment,
    YouTubeVideo,
};

use crate::store::{Cascade, Column, ColumnKind, Fields, Record, StoreError};

use ColumnKind::{Bool, Float, Int, Text, Timestamp, Uuid as UuidKind};

impl Record for Event {
    const TABLE: &'static str = "events";
    const COLUMNS: &'static [Column] = &[
        Column::required("id", UuidKind),
        Column::required("external_id", Text),
        Column::required("slug", Text),
        Column::required("name", Text),
        Column::optional("description", Text),
        Column::required("category", Text),
        Column::required("date", Timestamp),
        Column::optional("time", Text),
        Column::required("venue", Text),
        Column::required("city", Text),
        Column::optional("min_price", Float),
        Column::optional("max_price", Float),
        Column::optional("image_url", Text),
        Column::required("ticket_url", Text),
        Column::optional("performer_name", Text),
        Column::required("is_kids_event", Bool),
        Column::required("last_synced", Timestamp),
        Column::required("created_at", Timestamp),
        Column::required("updated_at", Timestamp),
    ];
    const UNIQUE_KEYS: &'static [&'static [&'static str]] =
        &[&["external_id"], &["slug"], &["id"]];
    const CASCADE: &'static [Cascade] = &[
        Cascade {
            table: "competitor_matches",
            foreign_key: "event_id",
            local_key: "id",
        },
        Cascade {
            table: "youtube_videos",
            foreign_key: "event_id",
            local_key: "id",
        },
    ];

    fn to_fields(&self) -> Fields {
        Fields::new()
            .with("id", self.id)
            .with("external_id", &self.external_id)
            .with("slug", &self.slug)
            .with("name", &self.name)
            .with("description", self.description.clone())
            .with("category", &self.category)
            .with("date", self.date)
            .with("time", self.time.clone())
            .with("venue", &self.venue)
            .with("city", &self.city)
            .with("min_price", self.min_price)
            .with("max_price", self.max_price)
            .with("image_url", self.image_url.clone())
            .with("ticket_url", &self.ticket_url)
            .with("performer_name", self.performer_name.clone())
            .with("is_kids_event", self.is_kids_event)
            .with("last_synced", self.last_synced)
            .with("created_at", self.created_at)
            .with("updated_at", self.updated_at)
    }

    fn from_fields(f: &Fields) -> Result<Self, StoreError> {
        Ok(Event {
            id: f.uuid("id")?,
            external_id: f.text("external_id")?,
            slug: f.text("slug")?,
            name: f.text("name")?,
            description: f.opt_text("description")?,
            category: f.text("category")?,
            date: f.timestamp("date")?,
            time: f.opt_text("time")?,
            venue: f.text("venue")?,
            city: f.text("city")?,
            min_price: f.opt_float("min_price")?,
            max_price: f.opt_float("max_price")?,
            image_url: f.opt_text("image_url")?,
            ticket_url: f.text("ticket_url")?,
            performer_name: f.opt_text("performer_name")?,
            is_kids_event: f.boolean("is_kids_event")?,
            last_synced: f.timestamp("last_synced")?,
            created_at: f.timestamp("created_at")?,
            updated_at: f.timestamp("updated_at")?,
        })
    }
}

impl Record for CompetitorMatch {
    const TABLE: &'static str = "competitor_matches";
    const COLUMNS: &'static [Column] = &[
        Column::required("id", UuidKind),
        Column::required("event_id", UuidKind),
        Column::required("competitor_name", Text),
        Column::required("competitor_url", Text),
        Column::required("match_score", Float),
        Column::required("checked_at", Timestamp),
        Column::required("expires_at", Timestamp),
    ];
    const UNIQUE_KEYS: &'static [&'static [&'static str]] =
        &[&["event_id", "competitor_name"], &["id"]];

    fn to_fields(&self) -> Fields {
        Fields::new()
            .with("id", self.id)
            .with("event_id", self.event_id)
            .with("competitor_name", &self.competitor_name)
            .with("competitor_url", &self.competitor_url)
            .with("match_score", self.match_score)
            .with("checked_at", self.checked_at)
            .with("expires_at", self.expires_at)
    }

    fn from_fields(f: &Fields) -> Result<Self, StoreError> {
        Ok(CompetitorMatch {
            id: f.uuid("id")?,
            event_id: f.uuid("event_id")?,
            competitor_name: f.text("competitor_name")?,
            competitor_url: f.text("competitor_url")?,
            match_score: f.float("match_score")?,
            checked_at: f.timestamp("checked_at")?,
            expires_at: f.timestamp("expires_at")?,
        })
    }
}

impl Record for YouTubeVideo {
    const TABLE: &'static str = "youtube_videos";
    const COLUMNS: &'static [Column] = &[
        Column::required("id", UuidKind),
        Column::required("event_id", UuidKind),
        Column::required("video_id", Text),
        Column::required("title", Text),
        Column::required("thumbnail_url", Text),
        Column::required("channel_title", Text),
        Column::required("checked_at", Timestamp),
        Column::required("expires_at", Timestamp),
    ];
    const UNIQUE_KEYS: &'static [&'static [&'static str]] =
        &[&["event_id", "video_id"], &["id"]];

    fn to_fields(&self) -> Fields {
        Fields::new()
            .with("id", self.id)
            .with("event_id", self.event_id)
            .with("video_id", &self.video_id)
            .with("title", &self.title)
            .with("thumbnail_url", &self.thumbnail_url)
            .with("channel_title", &self.channel_title)
            .with("checked_at", self.checked_at)
            .with("expires_at", self.expires_at)
    }

    fn from_fields(f: &Fields) -> Result<Self, StoreError> {
        Ok(YouTubeVideo {
            id: f.uuid("id")?,
            event_id: f.uuid("event_id")?,
            video_id: f.text("video_id")?,
            title: f.text("title")?,
            thumbnail_url: f.text("thumbnail_url")?,
            channel_title: f.text("channel_title")?,
            checked_at: f.timestamp("checked_at")?,
            expires_at: f.timestamp("expires_at")?,
        })
    }
}

impl Record for VideoComment {
    const TABLE: &'static str = "video_comments";
    const COLUMNS: &'static [Column] = &[
        Column::required("comment_id", Text),
        Column::required("video_id", Text),
        Column::required("author_name", Text),
        Column::optional("author_channel_id", Text),
        Column::optional("author_profile_url", Text),
        Column::required("text_display", Text),
        Column::required("like_count", Int),
        Column::required("published_at", Timestamp),
        Column::required("is_reply", Bool),
        Column::optional("parent_comment_id", Text),
        Column::required("checked_at", Timestamp),
        Column::required("expires_at", Timestamp),
    ];
    const UNIQUE_KEYS: &'static [&'static [&'static str]] = &[&["comment_id"]];

    fn to_fields(&self) -> Fields {
        Fields::new()
            .with("comment_id", &self.comment_id)
            .with("video_id", &self.video_id)
            .with("author_name", &self.author_name)
            .with("author_channel_id", self.author_channel_id.clone())
            .with("author_profile_url", self.author_profile_url.clone())
            .with("text_display", &self.text_display)
            .with("like_count", self.like_count)
            .with("published_at", self.published_at)
            .with("is_reply", self.is_reply)
            .with("parent_comment_id", self.parent_comment_id.clone())
            .with("checked_at", self.checked_at)
            .with("expires_at", self.expires_at)
    }

    fn from_fields(f: &Fields) -> Result<Self, StoreError> {
        Ok(VideoComment {
            comment_id: f.text("comment_id")?,
            video_id: f.text("video_id")?,
            author_name: f.text("author_name")?,
            author_channel_id: f.opt_text("author_channel_id")?,
            author_profile_url: f.opt_text("author_profile_url")?,
            text_display: f.text("text_display")?,
            like_count: f.int("like_count")?,
            published_at: f.timestamp("published_at")?,
            is_reply: f.boolean("is_reply")?,
            parent_comment_id: f.opt_text("parent_comment_id")?,
            checked_at: f.timestamp("checked_at")?,
            expires_at: f.timestamp("expires_at")?,
        })
    }
}

impl Record for SearchLog {
    const TABLE: &'static str = "search_logs";
    const COLUMNS: &'static [Column] = &[
        Column::required("id", UuidKind),
        Column::required("date", Timestamp),
        Column::required("query_type", Text),
        Column::required("queries_used", Int),
    ];
    const UNIQUE_KEYS: &'static [&'static [&'static str]] = &[&["id"]];

    fn to_fields(&self) -> Fields {
        Fields::new()
            .with("id", self.id)
            .with("date", self.date)
            .with("query_type", self.query_type.as_str())
            .with("queries_used", self.queries_used)
    }

    fn from_fields(f: &Fields) -> Result<Self, StoreError> {
        let query_type = f.text("query_type")?;
        Ok(SearchLog {
            id: f.uuid("id")?,
            date: f.timestamp("date")?,
            query_type: query_type
                .parse::<QueryType>()
                .map_err(|_| StoreError::Decode {
                    field: "query_type".to_string(),
                    expected: "query type",
                })?,
            queries_used: f.int("queries_used")?,
        })
    }
}

impl Record for SyncLog {
    const TABLE: &'static str = "sync_logs";
    const COLUMNS: &'static [Column] = &[
        Column::required("id", UuidKind),
        Column::required("status", Text),
        Column::required("events_total", Int),
        Column::required("events_new", Int),
        Column::required("events_updated", Int),
        Column::required("events_removed", Int),
        Column::optional("error_message", Text),
        Column::required("synced_at", Timestamp),
    ];
    const UNIQUE_KEYS: &'static [&'static [&'static str]] = &[&["id"]];

    fn to_fields(&self) -> Fields {
        Fields::new()
            .with("id", self.id)
            .with("status", self.status.as_str())
            .with("events_total", self.events_total)
            .with("events_new", self.events_new)
            .with("events_updated", self.events_updated)
            .with("events_removed", self.events_removed)
            .with("error_message", self.error_message.clone())
            .with("synced_at", self.synced_at)
    }

    fn from_fields(f: &Fields) -> Result<Self, StoreError> {
        let status = f.text("status")?;
        Ok(SyncLog {
            id: f.uuid("id")?,
            status: status.parse::<SyncStatus>().map_err(|_| StoreError::Decode {
                field: "status".to_string(),
                expected: "sync status",
            })?,
            events_total: f.int("events_total")?,
            events_new: f.int("events_new")?,
            events_updated: f.int("events_updated")?,
            events_removed: f.int("events_removed")?,
            error_message: f.opt_text("error_message")?,
            synced_at: f.timestamp("synced_at")?,
        })
    }
}

impl Record for RunLease {
    const TABLE: &'static str = "run_leases";
    const COLUMNS: &'static [Column] = &[
        Column::required("name", Text),
        Column::required("owner", UuidKind),
        Column::required("acquired_at", Timestamp),
        Column::required("expires_at", Timestamp),
    ];
    const UNIQUE_KEYS: &'static [&'static [&'static str]] = &[&["name"]];

    fn to_fields(&self) -> Fields {
        Fields::new()
            .with("name", &self.name)
            .with("owner", self.owner)
            .with("acquired_at", self.acquired_at)
            .with("expires_at", self.expires_at)
    }

    fn from_fields(f: &Fields) -> Result<Self, StoreError> {
        Ok(RunLease {
            name: f.text("name")?,
            owner: f.uuid("owner")?,
            acquired_at: f.timestamp("acquired_at")?,
            expires_at: f.timestamp("expires_at")?,
        })
    }
}
