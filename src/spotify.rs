use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use reqwest::{header, Client, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::providers::{CredentialProvider, PlaybackSource, RemoteHistorySource};
use crate::types::{ContentType, HistoryEntry, HistoryOrigin, PlaybackSnapshot};

const API_BASE: &str = "https://api.spotify.com/v1";
/// The recently-played endpoint refuses larger pages
const MAX_RECENT_LIMIT: usize = 50;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Image {
    url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Named {
    name: String,
    publisher: String,
    images: Vec<Image>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExternalUrls {
    spotify: Option<String>,
}

/// Track or episode object; fields absent on one kind stay empty
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Item {
    id: Option<String>,
    name: String,
    duration_ms: u64,
    external_urls: ExternalUrls,
    // track
    artists: Vec<Named>,
    album: Option<Named>,
    // episode
    show: Option<Named>,
    description: Option<String>,
    images: Vec<Image>,
}

impl Item {
    fn creator(&self) -> String {
        if let Some(show) = &self.show {
            return show.publisher.clone();
        }
        self.artists
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn container(&self) -> Option<&Named> {
        self.album.as_ref().or(self.show.as_ref())
    }

    fn artwork(&self) -> Option<String> {
        self.container()
            .and_then(|c| c.images.first())
            .or_else(|| self.images.first())
            .map(|image| image.url.clone())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CurrentlyPlaying {
    is_playing: bool,
    progress_ms: Option<u64>,
    currently_playing_type: String,
    item: Option<Item>,
}

#[derive(Debug, Deserialize)]
struct PlayHistory {
    track: Item,
    played_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RecentlyPlayed {
    items: Vec<PlayHistory>,
}

fn to_snapshot(current: CurrentlyPlaying) -> Option<PlaybackSnapshot> {
    let item = current.item?;
    let identity = item.id.clone()?;
    let content_type = match current.currently_playing_type.as_str() {
        "episode" => ContentType::Episode,
        _ => ContentType::Track,
    };
    Some(PlaybackSnapshot {
        identity,
        content_type,
        title: item.name.clone(),
        creator: item.creator(),
        container_name: item.container().map(|c| c.name.clone()).unwrap_or_default(),
        artwork_url: item.artwork(),
        external_url: item.external_urls.spotify.clone(),
        description: item.description.clone().filter(|d| !d.is_empty()),
        position_ms: current.progress_ms.unwrap_or(0),
        duration_ms: item.duration_ms,
        is_playing: current.is_playing,
    })
}

fn to_history(played: PlayHistory) -> Option<HistoryEntry> {
    let item = played.track;
    Some(HistoryEntry {
        item_id: item.id.clone()?,
        title: item.name.clone(),
        creator: item.creator(),
        container_name: item.container().map(|c| c.name.clone()).unwrap_or_default(),
        artwork_url: item.artwork(),
        duration_ms: item.duration_ms,
        played_at: played.played_at,
        origin: HistoryOrigin::RemoteSource,
    })
}

pub struct SpotifyClient {
    http_client: Client,
    credentials: Arc<dyn CredentialProvider>,
}

impl SpotifyClient {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> std::result::Result<Self, reqwest::Error> {
        let http_client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            http_client,
            credentials,
        })
    }

    /// `Ok(None)` for 204 No Content
    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Option<Response>> {
        let token = self.credentials.access_token().await?;
        let response = self
            .http_client
            .get(format!("{}{}", API_BASE, path))
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .query(query)
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::UNAUTHORIZED => Err(SyncError::unauthorized(format!(
                "Spotify rejected the access token for {}",
                path
            ))),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("?")
                    .to_string();
                Err(SyncError::transient(format!(
                    "Spotify rate limit hit, retry after {}s",
                    retry_after
                )))
            }
            status if status.is_success() => Ok(Some(response)),
            status => Err(SyncError::transient(format!(
                "Spotify request {} failed with status: {}",
                path, status
            ))),
        }
    }
}

#[async_trait]
impl PlaybackSource for SpotifyClient {
    async fn fetch_current_playback(&self) -> Result<Option<PlaybackSnapshot>> {
        let query = [("additional_types", "track,episode".to_string())];
        let Some(response) = self.get("/me/player/currently-playing", &query).await? else {
            return Ok(None);
        };
        let current: CurrentlyPlaying = response.json().await?;
        if current.item.is_none() {
            debug!(
                "Playback of type '{}' carries no item",
                current.currently_playing_type
            );
        }
        Ok(to_snapshot(current))
    }
}

#[async_trait]
impl RemoteHistorySource for SpotifyClient {
    async fn fetch_recent_history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let limit = limit.clamp(1, MAX_RECENT_LIMIT);
        let query = [("limit", limit.to_string())];
        let Some(response) = self.get("/me/player/recently-played", &query).await? else {
            return Ok(Vec::new());
        };
        let recent: RecentlyPlayed = response.json().await?;
        let total = recent.items.len();
        let entries: Vec<HistoryEntry> = recent.items.into_iter().filter_map(to_history).collect();
        if entries.len() < total {
            warn!("Skipped {} recent plays without an item id", total - entries.len());
        }
        Ok(entries)
    }
}
