//! Axum JSON API over the sync core: cron triggers, monitoring, on-demand
//! competitor/video/comment lookups and event listing.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use kidsync_core::Event;
use kidsync_feeds::youtube::{embed_url, watch_url};
use kidsync_storage::{Filter, RecordStore};
use kidsync_sync::{
    group_threads, maybe_build_scheduler, orchestrator_from_config, sync_status, CommentThreadView,
    DateWindow, EventQueries, EventSearch, EventSort, EventSyncStats, SyncConfig, SyncError,
    SyncOrchestrator, SyncStats,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kidsync-web";

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;
const QUOTA_MESSAGE: &str = "Daily search quota exceeded. Try again tomorrow.";

pub struct AppState<S> {
    pub orchestrator: Arc<SyncOrchestrator<S>>,
    pub events: EventQueries<S>,
    pub cron_secret: Option<String>,
}

impl<S: RecordStore> AppState<S> {
    pub fn new(orchestrator: Arc<SyncOrchestrator<S>>, cron_secret: Option<String>) -> Self {
        let events = EventQueries::new(
            Arc::clone(orchestrator.store()),
            Arc::clone(orchestrator.clock()),
        );
        Self {
            orchestrator,
            events,
            cron_secret,
        }
    }
}

pub fn app<S: RecordStore + 'static>(state: AppState<S>) -> Router {
    Router::new()
        .route(
            "/api/cron/daily-sync",
            get(daily_sync_handler::<S>).post(daily_sync_handler::<S>),
        )
        .route("/api/cron/status", get(status_handler::<S>))
        .route("/api/events", get(events_handler::<S>))
        .route("/api/events/sync", get(events_sync_handler::<S>))
        .route("/api/competitors/{event_id}", get(competitors_handler::<S>))
        .route("/api/youtube/{event_id}", get(videos_handler::<S>))
        .route("/api/comments/{video_id}", get(comments_handler::<S>))
        .with_state(Arc::new(state))
}

/// Serve the API on `KIDSYNC_WEB_PORT`, running the cron job alongside when
/// scheduling is enabled.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::load()?;
    let orchestrator = Arc::new(orchestrator_from_config(&config).await?);

    let scheduler = maybe_build_scheduler(&config, Arc::clone(&orchestrator)).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }

    let state = AppState::new(orchestrator, config.cron_secret.clone());
    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, "kidsync web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn error_json(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn sync_failure(err: &SyncError) -> Response {
    let status = match err {
        SyncError::RunInProgress { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "success": false, "error": err.to_string() }))).into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl header::AsHeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DailySyncBody<'a> {
    success: bool,
    run_id: Uuid,
    timestamp: DateTime<Utc>,
    duration: String,
    #[serde(flatten)]
    stats: &'a SyncStats,
}

async fn daily_sync_handler<S: RecordStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
) -> Response {
    let Some(secret) = state.cron_secret.as_deref() else {
        error!("CRON_SECRET not configured");
        return error_json(StatusCode::INTERNAL_SERVER_ERROR, "Cron secret not configured");
    };
    let expected = format!("Bearer {secret}");
    if header_str(&headers, header::AUTHORIZATION) != Some(expected.as_str()) {
        warn!("unauthorized cron trigger");
        return error_json(StatusCode::UNAUTHORIZED, "Unauthorized");
    }

    match state.orchestrator.run_daily_sync().await {
        Ok(summary) => Json(DailySyncBody {
            success: true,
            run_id: summary.run_id,
            timestamp: summary.finished_at,
            duration: format!("{:.2}s", summary.duration_secs),
            stats: &summary.stats,
        })
        .into_response(),
        Err(err) => sync_failure(&err),
    }
}

#[derive(Serialize)]
struct EventSyncBody {
    success: bool,
    #[serde(flatten)]
    stats: EventSyncStats,
}

async fn events_sync_handler<S: RecordStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
) -> Response {
    let authorized = match state.cron_secret.as_deref() {
        Some(secret) => header_str(&headers, "x-cron-secret") == Some(secret),
        None => false,
    };
    if !authorized {
        return error_json(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    match state.orchestrator.sync_events_only().await {
        Ok(stats) => Json(EventSyncBody {
            success: true,
            stats,
        })
        .into_response(),
        Err(err) => sync_failure(&err),
    }
}

async fn status_handler<S: RecordStore + 'static>(State(state): State<Arc<AppState<S>>>) -> Response {
    let orchestrator = &state.orchestrator;
    match sync_status(
        orchestrator.store().as_ref(),
        orchestrator.clock().as_ref(),
        orchestrator.ledger(),
    )
    .await
    {
        Ok(report) => Json(report).into_response(),
        Err(err) => {
            error!(error = %err, "status snapshot failed");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load sync status")
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventsParams {
    q: Option<String>,
    city: Option<String>,
    date: Option<String>,
    sort: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl EventsParams {
    fn to_search(&self) -> Result<EventSearch, String> {
        let window = match self.date.as_deref().filter(|d| !d.is_empty()) {
            Some(text) => Some(text.parse::<DateWindow>()?),
            None => None,
        };
        let sort = match self.sort.as_deref().filter(|s| !s.is_empty()) {
            Some(text) => text.parse::<EventSort>()?,
            None => EventSort::default(),
        };
        Ok(EventSearch {
            query: self.q.clone(),
            city: self.city.clone(),
            window,
            sort,
            limit: self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
            offset: self.offset.unwrap_or(0),
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventsBody {
    events: Vec<Event>,
    total: u64,
    has_more: bool,
}

async fn events_handler<S: RecordStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Query(params): Query<EventsParams>,
) -> Response {
    let search = match params.to_search() {
        Ok(search) => search,
        Err(msg) => return error_json(StatusCode::BAD_REQUEST, msg),
    };
    let listed = async {
        let events = state.events.search_events(&search).await?;
        let total = state.events.search_events_count(&search).await?;
        Ok::<_, kidsync_storage::StoreError>((events, total))
    }
    .await;
    match listed {
        Ok((events, total)) => {
            let has_more = ((search.offset + events.len()) as u64) < total;
            Json(EventsBody {
                events,
                total,
                has_more,
            })
            .into_response()
        }
        Err(err) => {
            error!(error = %err, "event listing failed");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch events")
        }
    }
}

async fn load_event<S: RecordStore>(state: &AppState<S>, raw_id: &str) -> Result<Event, Response> {
    let not_found = || error_json(StatusCode::NOT_FOUND, "Event not found");
    let id = Uuid::parse_str(raw_id).map_err(|_| not_found())?;
    match state
        .orchestrator
        .store()
        .find_unique::<Event>(Filter::eq("id", id))
        .await
    {
        Ok(Some(event)) => Ok(event),
        Ok(None) => Err(not_found()),
        Err(err) => {
            error!(error = %err, "event lookup failed");
            Err(error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load event"))
        }
    }
}

/// Quota exhaustion and missing credentials are answered with an empty list
/// and a message rather than an error status.
fn soft_failure(list_key: &str, service: &str, err: &SyncError) -> Option<Response> {
    let message = match err {
        e if e.is_quota() => QUOTA_MESSAGE.to_string(),
        SyncError::Config(what) => format!("{service} not configured ({what} missing)"),
        _ => return None,
    };
    info!(service, %message, "on-demand lookup unavailable");
    let mut body = serde_json::Map::new();
    body.insert(list_key.to_string(), json!([]));
    body.insert("fromCache".to_string(), json!(false));
    body.insert("message".to_string(), json!(message));
    Some(Json(body).into_response())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompetitorView {
    name: String,
    url: String,
    match_score: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompetitorsBody {
    competitors: Vec<CompetitorView>,
    from_cache: bool,
    checked_at: DateTime<Utc>,
}

async fn competitors_handler<S: RecordStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(event_id): Path<String>,
) -> Response {
    let event = match load_event(&state, &event_id).await {
        Ok(event) => event,
        Err(resp) => return resp,
    };
    match state.orchestrator.competitors().find_competitor_matches(&event).await {
        Ok(lookup) => {
            let checked_at = lookup
                .matches
                .first()
                .map(|m| m.checked_at)
                .unwrap_or_else(|| state.orchestrator.clock().now());
            Json(CompetitorsBody {
                competitors: lookup
                    .matches
                    .into_iter()
                    .map(|m| CompetitorView {
                        name: m.competitor_name,
                        url: m.competitor_url,
                        match_score: m.match_score,
                    })
                    .collect(),
                from_cache: lookup.from_cache,
                checked_at,
            })
            .into_response()
        }
        Err(err) => soft_failure("competitors", "Competitor search", &err).unwrap_or_else(|| {
            error!(event_id = %event.id, error = %err, "competitor lookup failed");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch competitors")
        }),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoView {
    video_id: String,
    title: String,
    thumbnail_url: String,
    channel_title: String,
    embed_url: String,
    watch_url: String,
}

async fn videos_handler<S: RecordStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(event_id): Path<String>,
) -> Response {
    let event = match load_event(&state, &event_id).await {
        Ok(event) => event,
        Err(resp) => return resp,
    };
    match state.orchestrator.videos().find_event_videos(&event).await {
        Ok(lookup) => {
            let videos: Vec<VideoView> = lookup
                .videos
                .into_iter()
                .map(|v| VideoView {
                    embed_url: embed_url(&v.video_id),
                    watch_url: watch_url(&v.video_id),
                    video_id: v.video_id,
                    title: v.title,
                    thumbnail_url: v.thumbnail_url,
                    channel_title: v.channel_title,
                })
                .collect();
            Json(json!({ "videos": videos, "fromCache": lookup.from_cache })).into_response()
        }
        Err(err) => soft_failure("videos", "YouTube search", &err).unwrap_or_else(|| {
            error!(event_id = %event.id, error = %err, "video lookup failed");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch YouTube videos")
        }),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommentsBody {
    video_id: String,
    total: usize,
    top_level_count: usize,
    reply_count: usize,
    comments: Vec<CommentThreadView>,
    from_cache: bool,
}

async fn comments_handler<S: RecordStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(video_id): Path<String>,
) -> Response {
    match state.orchestrator.comments().get_video_comments(&video_id).await {
        Ok(lookup) => {
            let total = lookup.comments.len();
            let reply_count = lookup.comments.iter().filter(|c| c.is_reply).count();
            Json(CommentsBody {
                total,
                top_level_count: total - reply_count,
                reply_count,
                comments: group_threads(lookup.comments),
                from_cache: lookup.from_cache,
                video_id,
            })
            .into_response()
        }
        Err(err) => soft_failure("comments", "YouTube comments", &err).unwrap_or_else(|| {
            error!(%video_id, error = %err, "comment lookup failed");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch comments")
        }),
    }
}
