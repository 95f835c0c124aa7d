//! Pure relevance scoring for competitor search results and video hits.

use std::sync::LazyLock;

use kidsync_core::{Event, NOT_SPECIFIED};
use kidsync_feeds::{SearchResult, VideoHit};
use regex::Regex;
use tracing::debug;

/// Browse, date-range and home pages. Never a specific event.
static GENERIC_URL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)/this-week",
        r"(?i)/this-weekend",
        r"(?i)/today",
        r"(?i)/tomorrow",
        r"(?i)/city/",
        r"(?i)/category/",
        r"(?i)/categories/",
        r"(?i)/all-events",
        r"(?i)/search\?",
        r"(?i)/search$",
        r"(?i)/browse",
        r"(?i)/listing",
        r"/$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

static EVENT_URL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)/event/",
        r"(?i)/show/",
        r"(?i)/ticket/",
        r"(?i)/tickets/",
        r"(?i)/production/",
        r"(?i)/artist/",
        r"(?i)/performance/",
        r"\d{4,}",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

/// Generic words stripped from names before competitor matching.
static MATCH_STOP_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("הצגה|הצגת|מופע|כרטיסים|לילדים|ילדים|קרקס|תיאטרון").expect("static pattern")
});

static VIDEO_STOP_WORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("הצגה|הצגת|מופע|כרטיסים|לילדים|ילדים").expect("static pattern"));

const VIDEO_EXCLUDE: [&str; 9] = [
    "reaction", "react", "review", "cover", "tutorial", "karaoke", "קריוקי", "מדריך", "איך ל",
];

pub const MATCH_THRESHOLD: f64 = 0.35;

pub fn is_generic_url(url: &str) -> bool {
    GENERIC_URL.iter().any(|re| re.is_match(url))
}

pub fn is_event_url(url: &str) -> bool {
    EVENT_URL.iter().any(|re| re.is_match(url))
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn keywords(name: &str, stop_words: &Regex) -> Vec<String> {
    stop_words
        .replace_all(&name.to_lowercase(), "")
        .split_whitespace()
        .filter(|w| char_len(w) > 2)
        .map(str::to_string)
        .collect()
}

/// Tokens of an event name used for competitor matching.
pub fn match_keywords(name: &str) -> Vec<String> {
    keywords(name, &MATCH_STOP_WORDS)
}

/// Confidence in `[0, 1]` that `result` is a page for `event`.
pub fn calculate_match_score(result: &SearchResult, event: &Event) -> f64 {
    let url = result.link.to_lowercase();
    if is_generic_url(&url) {
        debug!(%url, "generic listing url");
        return 0.0;
    }

    let title = result.title.to_lowercase();
    let snippet = result.snippet.to_lowercase();
    let mentions = |needle: &str| title.contains(needle) || snippet.contains(needle);

    let mut score = 0.0;
    let mut criteria = 0;

    let tokens = match_keywords(&event.name);
    let matched = tokens.iter().filter(|t| mentions(t)).count();
    if matched >= 2 {
        score += 0.4;
        criteria += 1;
    } else if matched == 1 && tokens.len() <= 2 {
        score += 0.3;
        criteria += 1;
    }

    let performer = event
        .performer_name
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    if char_len(&performer) > 2 && mentions(&performer) {
        score += 0.3;
        criteria += 1;
    }

    let venue = event.venue.to_lowercase();
    if venue != NOT_SPECIFIED && char_len(&venue) > 3 && mentions(&venue) {
        score += 0.2;
        criteria += 1;
    }

    let event_url = is_event_url(&url);
    if event_url {
        score += 0.1;
    }

    if criteria < 2 && score < MATCH_THRESHOLD {
        debug!(%url, criteria, score, "low confidence match");
        return 0.0;
    }
    if criteria == 1 && !event_url && score < 0.5 {
        debug!(%url, score, "single criterion on a non-event url");
        return 0.0;
    }
    score.min(1.0)
}

/// Drop reactions, covers and tutorials, then keep videos that mention the
/// event name or performer in their title or channel.
pub fn filter_relevant_videos(videos: Vec<VideoHit>, event: &Event) -> Vec<VideoHit> {
    let tokens = keywords(&event.name, &VIDEO_STOP_WORDS);
    let performer = event
        .performer_name
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();

    videos
        .into_iter()
        .filter(|video| {
            let title = video.title.to_lowercase();
            let channel = video.channel_title.to_lowercase();
            if VIDEO_EXCLUDE.iter().any(|k| title.contains(k)) {
                return false;
            }
            let named = tokens
                .iter()
                .any(|t| title.contains(t.as_str()) || channel.contains(t.as_str()));
            let by_performer =
                !performer.is_empty() && (title.contains(&performer) || channel.contains(&performer));
            named || by_performer
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{event, hit, result, ts};

    fn snow_white() -> Event {
        let mut ev = event("1", "שלגיה והגמדים", ts("2026-03-20T16:00:00Z"));
        ev.performer_name = Some("תיאטרון אורנה".into());
        ev.venue = "היכל התרבות".into();
        ev
    }

    #[test]
    fn generic_urls_score_zero() {
        let ev = snow_white();
        for link in [
            "https://www.eventer.co.il/",
            "https://www.eventer.co.il/search?q=שלגיה",
            "https://leaan.co.il/category/kids",
            "https://eventim.co.il/this-week",
        ] {
            let r = result("שלגיה והגמדים - תיאטרון אורנה", "היכל התרבות", link);
            assert_eq!(calculate_match_score(&r, &ev), 0.0, "{link}");
        }
    }

    #[test]
    fn strong_match_on_event_page() {
        let ev = snow_white();
        let r = result(
            "שלגיה והגמדים | תיאטרון אורנה",
            "במופע מרהיב בהיכל התרבות",
            "https://www.eventer.co.il/event/48213",
        );
        let score = calculate_match_score(&r, &ev);
        assert!((score - 1.0).abs() < 1e-9, "{score}");
    }

    #[test]
    fn single_criterion_needs_event_url() {
        let ev = snow_white();
        let on_listing = result("שלגיה והגמדים", "", "https://www.ticketsi.co.il/kids-shows");
        assert_eq!(calculate_match_score(&on_listing, &ev), 0.0);

        let on_event = result("שלגיה והגמדים", "", "https://www.ticketsi.co.il/show/snow");
        let score = calculate_match_score(&on_event, &ev);
        assert!((score - 0.5).abs() < 1e-9, "{score}");
    }

    #[test]
    fn short_names_match_on_one_token() {
        let mut ev = event("2", "הצגה פינוקיו", ts("2026-03-20T16:00:00Z"));
        ev.venue = NOT_SPECIFIED.into();
        assert_eq!(match_keywords(&ev.name), vec!["פינוקיו".to_string()]);
        let r = result("פינוקיו - כרטיסים", "", "https://leaan.co.il/event/9921");
        let score = calculate_match_score(&r, &ev);
        assert!((score - 0.4).abs() < 1e-9, "{score}");
    }

    #[test]
    fn scores_are_pure_and_bounded() {
        let ev = snow_white();
        let r = result(
            "שלגיה והגמדים תיאטרון אורנה היכל התרבות",
            "שלגיה",
            "https://eventim.co.il/tickets/123456",
        );
        let first = calculate_match_score(&r, &ev);
        assert_eq!(first, calculate_match_score(&r, &ev));
        assert!((0.0..=1.0).contains(&first));
    }

    #[test]
    fn placeholder_venue_never_counts() {
        let mut ev = snow_white();
        ev.venue = NOT_SPECIFIED.into();
        ev.performer_name = None;
        let r = result("לא צוין", "לא צוין", "https://eventer.co.il/event/1234");
        assert_eq!(calculate_match_score(&r, &ev), 0.0);
    }

    #[test]
    fn video_filter_drops_reactions_and_unrelated() {
        let ev = snow_white();
        let kept = filter_relevant_videos(
            vec![
                hit("a", "שלגיה והגמדים - טריילר", "כרטיסים עכשיו"),
                hit("b", "שלגיה reaction", "someone"),
                hit("c", "מופע אחר לגמרי", "תיאטרון אורנה"),
                hit("d", "בובות", "ערוץ אחר"),
            ],
            &ev,
        );
        let ids: Vec<_> = kept.iter().map(|v| v.video_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }
}
