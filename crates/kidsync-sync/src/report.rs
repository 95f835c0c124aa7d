//! Post-run report: what changed today, rendered for humans and machines.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kidsync_core::{Clock, CompetitorMatch, Event, VideoComment, YouTubeVideo};
use kidsync_feeds::youtube::watch_url;
use kidsync_storage::{Filter, Query, RecordStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use crate::orchestrator::SyncStats;

const NEW_EVENTS_LIMIT: usize = 20;
const TOP_MATCHES_LIMIT: usize = 10;
const NEW_VIDEOS_LIMIT: usize = 20;
const TOP_COMMENTS_LIMIT: usize = 10;

pub const BRIEF_FILE: &str = "daily_brief.md";
pub const STATS_FILE: &str = "sync_stats.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEventLine {
    pub name: String,
    pub date: DateTime<Utc>,
    pub venue: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchLine {
    pub event_name: String,
    pub competitor_name: String,
    pub competitor_url: String,
    pub match_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoLine {
    pub event_name: String,
    pub title: String,
    pub channel_title: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentLine {
    pub author_name: String,
    pub text: String,
    pub like_count: i64,
    pub video_title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDetail {
    pub new_events: Vec<NewEventLine>,
    pub top_matches: Vec<MatchLine>,
    pub new_videos: Vec<VideoLine>,
    pub top_comments: Vec<CommentLine>,
}

impl ReportDetail {
    /// Everything created or checked since local midnight.
    pub async fn gather<S: RecordStore>(
        store: &S,
        clock: &dyn Clock,
        site_base_url: &str,
    ) -> Result<Self, StoreError> {
        let today = clock.today_start();

        let new_events = store
            .find_many::<Event>(
                Query::new(Filter::gte("created_at", today))
                    .asc("date")
                    .limit(NEW_EVENTS_LIMIT),
            )
            .await?
            .into_iter()
            .map(|e| NewEventLine {
                url: format!("{}/events/{}", site_base_url.trim_end_matches('/'), e.slug),
                name: e.name,
                date: e.date,
                venue: e.venue,
            })
            .collect();

        let mut top_matches = Vec::new();
        for m in store
            .find_many::<CompetitorMatch>(
                Query::new(Filter::gte("checked_at", today))
                    .desc("match_score")
                    .limit(TOP_MATCHES_LIMIT),
            )
            .await?
        {
            top_matches.push(MatchLine {
                event_name: event_name(store, m.event_id).await?,
                competitor_name: m.competitor_name,
                competitor_url: m.competitor_url,
                match_score: m.match_score,
            });
        }

        let mut new_videos = Vec::new();
        for v in store
            .find_many::<YouTubeVideo>(
                Query::new(Filter::gte("checked_at", today))
                    .desc("checked_at")
                    .limit(NEW_VIDEOS_LIMIT),
            )
            .await?
        {
            new_videos.push(VideoLine {
                event_name: event_name(store, v.event_id).await?,
                url: watch_url(&v.video_id),
                title: v.title,
                channel_title: v.channel_title,
            });
        }

        let mut top_comments = Vec::new();
        for c in store
            .find_many::<VideoComment>(
                Query::new(Filter::gte("checked_at", today))
                    .desc("like_count")
                    .limit(TOP_COMMENTS_LIMIT),
            )
            .await?
        {
            let video_title = store
                .find_first::<YouTubeVideo>(Query::new(Filter::eq("video_id", c.video_id.as_str())))
                .await?
                .map(|v| v.title)
                .unwrap_or_default();
            top_comments.push(CommentLine {
                author_name: c.author_name,
                text: c.text_display,
                like_count: c.like_count,
                video_title,
            });
        }

        Ok(Self {
            new_events,
            top_matches,
            new_videos,
            top_comments,
        })
    }
}

async fn event_name<S: RecordStore>(store: &S, id: Uuid) -> Result<String, StoreError> {
    Ok(store
        .find_unique::<Event>(Filter::eq("id", id))
        .await?
        .map(|e| e.name)
        .unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub run_id: Uuid,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub stats: SyncStats,
    pub error: Option<String>,
    pub detail: ReportDetail,
}

impl SyncReport {
    pub fn to_markdown(&self) -> String {
        let mut out = vec![
            "# Kids Events Daily Brief".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Status: {}", if self.success { "success" } else { "failed" }),
            format!("- Started: {}", self.started_at),
            format!("- Duration: {:.1}s", self.duration_secs),
        ];
        if let Some(err) = &self.error {
            out.push(format!("- Error: {err}"));
        }

        let ev = &self.stats.event_sync;
        out.push(String::new());
        out.push("## Counts".to_string());
        out.push(format!(
            "- Events: {} total, {} new, {} updated, {} removed",
            ev.total, ev.new, ev.updated, ev.removed
        ));
        let cs = &self.stats.competitor_search;
        out.push(format!(
            "- Competitor search: {} events, {} queries, {} matches, {} queries left",
            cs.processed, cs.queries_used, cs.matches_found, cs.remaining
        ));
        let yv = &self.stats.youtube_videos;
        out.push(format!(
            "- Videos: {} events, {} videos, {} cache hits",
            yv.events_processed, yv.videos_found, yv.cache_hits
        ));
        let yc = &self.stats.youtube_comments;
        out.push(format!(
            "- Comments: {} videos, {} comments, {} cache hits",
            yc.videos_processed, yc.comments_fetched, yc.cache_hits
        ));

        section(&mut out, "New Events", &self.detail.new_events, |e| {
            format!("- [{}]({}) {} at {}", e.name, e.url, e.date.format("%Y-%m-%d"), e.venue)
        });
        section(&mut out, "Competitor Matches", &self.detail.top_matches, |m| {
            format!(
                "- {} on {} ({:.0}%): {}",
                m.event_name,
                m.competitor_name,
                m.match_score * 100.0,
                m.competitor_url
            )
        });
        section(&mut out, "New Videos", &self.detail.new_videos, |v| {
            format!("- [{}]({}) by {} for {}", v.title, v.url, v.channel_title, v.event_name)
        });
        section(&mut out, "Top Comments", &self.detail.top_comments, |c| {
            format!("- {} ({} likes) on {}: {}", c.author_name, c.like_count, c.video_title, c.text)
        });
        out.push(String::new());
        out.join("\n")
    }
}

fn section<T>(out: &mut Vec<String>, title: &str, items: &[T], line: impl Fn(&T) -> String) {
    if items.is_empty() {
        return;
    }
    out.push(String::new());
    out.push(format!("## {title}"));
    out.extend(items.iter().map(line));
}

/// Where finished runs are announced. Failures are logged by the caller and
/// never change the run outcome.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn publish(&self, report: &SyncReport) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopReportSink;

#[async_trait]
impl ReportSink for NoopReportSink {
    async fn publish(&self, _report: &SyncReport) -> Result<()> {
        Ok(())
    }
}

/// Writes `<dir>/<run_id>/daily_brief.md` and `sync_stats.json`.
#[derive(Debug, Clone)]
pub struct MarkdownReportSink {
    dir: PathBuf,
}

impl MarkdownReportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(run_id.to_string())
    }
}

#[async_trait]
impl ReportSink for MarkdownReportSink {
    async fn publish(&self, report: &SyncReport) -> Result<()> {
        let run_dir = self.run_dir(report.run_id);
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;
        fs::write(run_dir.join(BRIEF_FILE), report.to_markdown())
            .await
            .with_context(|| format!("writing {BRIEF_FILE}"))?;
        let json = serde_json::to_vec_pretty(report).context("serializing sync report")?;
        fs::write(run_dir.join(STATS_FILE), json)
            .await
            .with_context(|| format!("writing {STATS_FILE}"))?;
        info!(dir = %run_dir.display(), "sync report written");
        Ok(())
    }
}

/// Summarize the newest `runs` report directories under `reports_dir`.
pub fn recent_reports_markdown(reports_dir: &Path, runs: usize) -> Result<String> {
    let mut reports = Vec::new();
    for entry in std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
    {
        let path = entry.path().join(STATS_FILE);
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let report: SyncReport =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        reports.push(report);
    }
    reports.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# Recent Sync Runs".to_string(), String::new()];
    for report in reports.iter().take(runs.max(1)) {
        let ev = &report.stats.event_sync;
        lines.push(format!(
            "- {} `{}` {}: events {}/{} new, {} removed, {} competitor queries",
            report.started_at.format("%Y-%m-%d %H:%M"),
            report.run_id,
            if report.success { "ok" } else { "FAILED" },
            ev.new,
            ev.total,
            ev.removed,
            report.stats.competitor_search.queries_used,
        ));
    }
    Ok(lines.join("\n"))
}
