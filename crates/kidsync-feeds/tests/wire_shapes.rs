use std::fs;
use std::path::PathBuf;

use kidsync_feeds::google::parse_search_items;
use kidsync_feeds::youtube::{parse_comment_threads, parse_video_hits};
use kidsync_feeds::{parse_feed_str, EventFeed, JsonFileFeed};
use serde_json::Value as JsonValue;

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn fixture_json(name: &str) -> JsonValue {
    let text = fs::read_to_string(fixture_path(name)).expect("read fixture");
    serde_json::from_str(&text).expect("parse fixture")
}

#[test]
fn partner_feed_fixture_exposes_normalizer_fields() {
    let text = fs::read_to_string(fixture_path("bravo_shows.json")).expect("read fixture");
    let events = parse_feed_str(&text).expect("feed parses");
    assert_eq!(events.len(), 3);

    let first = &events[0];
    assert_eq!(first.external_id().as_deref(), Some("10231"));
    assert_eq!(first.section(), Some("הצגות ילדים"));
    assert_eq!(first.venue(), Some("היכל התרבות"));
    assert_eq!(first.city(), Some("ראשון לציון"));
    assert_eq!(first.price_min(), Some(69.0));
    assert_eq!(first.price_max(), Some(119.0));
    assert_eq!(first.performer_name(), Some("תיאטרון המדיטק"));

    let third = &events[2];
    assert_eq!(third.section(), Some("משפחה"));
    assert_eq!(third.venue(), None);
    assert_eq!(third.description(), Some("מופע קרקס לכל המשפחה"));
}

#[tokio::test]
async fn file_feed_reads_snapshot() {
    let feed = JsonFileFeed::new(fixture_path("bravo_shows.json"));
    let events = feed.fetch_events().await.expect("file feed");
    assert_eq!(events.len(), 3);

    let missing = JsonFileFeed::new(fixture_path("does_not_exist.json"));
    assert!(missing.fetch_events().await.is_err());
}

#[test]
fn custom_search_fixture_maps_to_results() {
    let results = parse_search_items(&fixture_json("cse_results.json"));
    assert_eq!(results.len(), 2);
    assert!(results[0].title.contains("שלגיה"));
    assert_eq!(results[1].link, "https://www.eventer.co.il/this-week");
}

#[test]
fn video_search_fixture_maps_to_hits() {
    let hits = parse_video_hits(&fixture_json("youtube_search.json"));
    let ids: Vec<_> = hits.iter().map(|h| h.video_id.as_str()).collect();
    assert_eq!(ids, vec!["sw7GmD01", "sw7React"]);
    assert!(hits[0].thumbnail_url.ends_with("mqdefault.jpg"));
}

#[test]
fn comment_thread_fixture_flattens_replies() {
    let threads = parse_comment_threads(&fixture_json("youtube_comment_threads.json"));
    assert_eq!(threads.len(), 2, "thread without a publish date is dropped");

    let first = &threads[0];
    assert_eq!(first.top.comment_id, "Ugx1");
    assert_eq!(first.top.author_channel_id.as_deref(), Some("UCdana"));
    assert_eq!(first.top.like_count, 12);
    assert_eq!(first.replies.len(), 1);
    assert_eq!(first.replies[0].comment_id, "Ugx1.r1");
    assert_eq!(first.replies[0].author_channel_id, None);

    assert_eq!(threads[1].top.like_count, 3);
    assert!(threads[1].replies.is_empty());
}
