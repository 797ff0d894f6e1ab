use async_trait::async_trait;
use log::{debug, info, warn};
use regex::Regex;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::providers::TextExtractor;
use crate::track_cleaning::{clean_track_name, remove_artist_from_track};
use crate::types::{ContentType, LyricLine, PlaybackSnapshot};

const LRCLIB_SEARCH_URL: &str = "https://lrclib.net/api/search";
const USER_AGENT: &str = "nowcast/0.1.0";

enum SearchStrategy {
    Exact(String, String), // track_name, artist_name
    Wildcard(String),      // q parameter
}

/// Lyrics lookup against LRCLib; tracks only
pub struct LrclibClient {
    client: Client,
}

impl LrclibClient {
    pub fn new() -> std::result::Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { client })
    }

    fn strategies(track_name: &str, artist_name: &str) -> Vec<SearchStrategy> {
        let cleaned_track = clean_track_name(track_name);
        let track_without_artist = remove_artist_from_track(track_name, artist_name);

        let mut strategies = vec![
            SearchStrategy::Exact(track_name.to_string(), artist_name.to_string()),
            SearchStrategy::Exact(cleaned_track.clone(), artist_name.to_string()),
            SearchStrategy::Wildcard(format!("{} {}", cleaned_track, artist_name)),
        ];
        if track_without_artist != track_name {
            strategies.push(SearchStrategy::Exact(
                clean_track_name(&track_without_artist),
                artist_name.to_string(),
            ));
        }
        strategies.push(SearchStrategy::Wildcard(cleaned_track));
        strategies
    }

    async fn search(&self, query: &[(&str, &str)]) -> Result<Vec<serde_json::Value>> {
        let response = self
            .client
            .get(LRCLIB_SEARCH_URL)
            .query(query)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SyncError::transient(format!(
                "LRCLib HTTP error: {}",
                response.status()
            )));
        }
        Ok(response.json::<Vec<serde_json::Value>>().await?)
    }

    async fn try_strategy(&self, strategy: &SearchStrategy) -> Result<Option<String>> {
        let results = match strategy {
            SearchStrategy::Exact(track, artist) => {
                if track.trim().is_empty() {
                    return Ok(None);
                }
                debug!("Trying exact strategy: '{}' by '{}'", track, artist);
                let mut query = vec![("track_name", track.as_str())];
                if !artist.trim().is_empty() {
                    query.push(("artist_name", artist.as_str()));
                }
                self.search(&query).await?
            }
            SearchStrategy::Wildcard(q) => {
                if q.trim().is_empty() {
                    return Ok(None);
                }
                debug!("Trying wildcard strategy: '{}'", q);
                self.search(&[("q", q.as_str())]).await?
            }
        };
        Ok(pick_lyrics(&results))
    }
}

#[async_trait]
impl TextExtractor for LrclibClient {
    async fn fetch_text(&self, item: &PlaybackSnapshot) -> Result<Option<String>> {
        if item.content_type != ContentType::Track || item.is_idle() {
            return Ok(None);
        }
        info!("Fetching lyrics for: {} by {}", item.title, item.creator);

        let mut last_error = None;
        for strategy in Self::strategies(&item.title, &item.creator) {
            match self.try_strategy(&strategy).await {
                Ok(Some(text)) => return Ok(Some(text)),
                Ok(None) => {}
                Err(e) => {
                    debug!("LRCLib strategy failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => {
                warn!("No lyrics found for '{}' by '{}'", item.title, item.creator);
                Ok(None)
            }
        }
    }
}

/// Picks synced lyrics first, plain lyrics otherwise, from LRCLib results
fn pick_lyrics(results: &[serde_json::Value]) -> Option<String> {
    let non_empty = |item: &serde_json::Value, field: &str| {
        item.get(field)
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
    };

    if let Some(synced) = results.iter().find_map(|item| non_empty(item, "syncedLyrics")) {
        let lines = parse_lrc_format(&synced);
        if !lines.is_empty() {
            return Some(lines_to_text(&lines));
        }
    }
    results
        .iter()
        .find_map(|item| non_empty(item, "plainLyrics"))
        .map(|plain| lines_to_text(&convert_plain_lyrics_to_lines(&plain)))
}

pub fn lines_to_text(lines: &[LyricLine]) -> String {
    lines
        .iter()
        .map(|line| line.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn parse_lrc_format(lrc_content: &str) -> Vec<LyricLine> {
    let Ok(line_re) = Regex::new(r"^\[(\d{2}):(\d{2})(?:\.(\d{2,3}))?\](.*)$") else {
        return Vec::new();
    };
    let mut lyrics = Vec::new();

    for line in lrc_content.lines() {
        if let Some(caps) = line_re.captures(line.trim()) {
            let minutes: f64 = caps[1].parse().unwrap_or(0.0);
            let seconds: f64 = caps[2].parse().unwrap_or(0.0);
            let fraction: f64 = caps
                .get(3)
                .map(|m| {
                    let digits = m.as_str();
                    let value: f64 = digits.parse().unwrap_or(0.0);
                    value / 10f64.powi(digits.len() as i32)
                })
                .unwrap_or(0.0);
            let text = caps[4].trim().to_string();

            if !text.is_empty() {
                lyrics.push(LyricLine {
                    time: minutes * 60.0 + seconds + fraction,
                    text,
                    duration: None,
                });
            }
        }
    }

    lyrics.sort_by(|a, b| a.time.total_cmp(&b.time));

    for i in 0..lyrics.len().saturating_sub(1) {
        lyrics[i].duration = Some(lyrics[i + 1].time - lyrics[i].time);
    }
    if let Some(last) = lyrics.last_mut() {
        last.duration = Some(3.0);
    }

    lyrics
}

pub fn convert_plain_lyrics_to_lines(plain_lyrics: &str) -> Vec<LyricLine> {
    plain_lyrics
        .lines()
        .enumerate()
        .filter_map(|(index, line)| {
            let text = line.trim();
            (!text.is_empty()).then(|| LyricLine {
                time: (index as f64) * 5.0,
                text: text.to_string(),
                duration: Some(5.0),
            })
        })
        .collect()
}

/// Tries each extractor in order and returns the first text found.
///
/// If nothing was found and at least one extractor failed, the failure is
/// returned so the caller can try again later.
pub struct LyricsChain {
    sources: Vec<Arc<dyn TextExtractor>>,
}

impl LyricsChain {
    pub fn new(sources: Vec<Arc<dyn TextExtractor>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl TextExtractor for LyricsChain {
    async fn fetch_text(&self, item: &PlaybackSnapshot) -> Result<Option<String>> {
        let mut first_error = None;
        for source in &self.sources {
            match source.fetch_text(item).await {
                Ok(Some(text)) => return Ok(Some(text)),
                Ok(None) => {}
                Err(e) => {
                    warn!("Text source failed for '{}': {}", item.identity, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}
