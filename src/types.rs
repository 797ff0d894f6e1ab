use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Track,
    Episode,
}

/// What the monitored account is playing.
///
/// An empty `identity` means nothing is playing. The same shape is used for
/// freshly polled candidates and for the record held by the cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSnapshot {
    pub identity: String,
    pub content_type: ContentType,
    pub title: String,
    pub creator: String,
    pub container_name: String,
    pub artwork_url: Option<String>,
    pub external_url: Option<String>,
    pub description: Option<String>,
    pub position_ms: u64,
    pub duration_ms: u64,
    pub is_playing: bool,
}

impl PlaybackSnapshot {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.identity.is_empty()
    }

    /// Checks a polled candidate before it reaches the cache.
    ///
    /// Positions past the end are clamped; a playing item without an id or a
    /// named-but-anonymous item cannot be applied.
    pub fn normalized(mut self) -> Result<Self> {
        self.identity = self.identity.trim().to_string();
        if self.identity.is_empty() {
            if self.is_playing || !self.title.is_empty() {
                return Err(SyncError::inconsistent(format!(
                    "playback '{}' reported without an item id",
                    self.title
                )));
            }
            return Ok(Self::idle());
        }
        if self.duration_ms > 0 && self.position_ms > self.duration_ms {
            self.position_ms = self.duration_ms;
        }
        Ok(self)
    }

    pub fn metadata(&self) -> ItemMetadata {
        ItemMetadata {
            item_id: self.identity.clone(),
            content_type: self.content_type,
            title: self.title.clone(),
            creator: self.creator.clone(),
            container_name: self.container_name.clone(),
            artwork_url: self.artwork_url.clone(),
            duration_ms: self.duration_ms,
        }
    }
}

/// Descriptive data about a playable item, independent of any one play
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMetadata {
    pub item_id: String,
    pub content_type: ContentType,
    pub title: String,
    pub creator: String,
    pub container_name: String,
    pub artwork_url: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HistoryOrigin {
    LocalStore,
    RemoteSource,
    Merged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub item_id: String,
    pub title: String,
    pub creator: String,
    pub container_name: String,
    pub artwork_url: Option<String>,
    pub duration_ms: u64,
    pub played_at: DateTime<Utc>,
    pub origin: HistoryOrigin,
}

impl HistoryEntry {
    pub fn from_metadata(meta: &ItemMetadata, played_at: DateTime<Utc>, origin: HistoryOrigin) -> Self {
        Self {
            item_id: meta.item_id.clone(),
            title: meta.title.clone(),
            creator: meta.creator.clone(),
            container_name: meta.container_name.clone(),
            artwork_url: meta.artwork_url.clone(),
            duration_ms: meta.duration_ms,
            played_at,
            origin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedHistoryEntry {
    #[serde(flatten)]
    pub entry: HistoryEntry,
    /// When the matching local play was recorded, for `merged` entries
    pub local_played_at: Option<DateTime<Utc>>,
    pub evaluation: Option<EvaluationSummary>,
    pub lyrics_excerpt: Option<String>,
}

/// A content-safety verdict as produced by the evaluator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub rating: String,
    pub level: u8,
    pub confidence: f64,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationSummary {
    pub rating: String,
    pub level: u8,
    pub confidence: f64,
}

impl From<&Evaluation> for EvaluationSummary {
    fn from(evaluation: &Evaluation) -> Self {
        Self {
            rating: evaluation.rating.clone(),
            level: evaluation.level,
            confidence: evaluation.confidence,
        }
    }
}

/// Sidecar evaluation state for the current item
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum EvaluationSlot {
    Pending,
    Ready(Evaluation),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotView {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub playback: PlaybackSnapshot,
    pub lyrics: Option<String>,
    pub evaluation: Option<EvaluationSlot>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LyricLine {
    pub time: f64, // seconds
    pub text: String,
    pub duration: Option<f64>,
}

pub fn truncate_text(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}
