use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{PoisonError, RwLock};

use crate::error::{Result, SyncError};
use crate::types::{ContentType, Evaluation, HistoryEntry, ItemMetadata, PlaybackSnapshot};

/// Source of "what is playing right now"
#[async_trait]
pub trait PlaybackSource: Send + Sync {
    /// `Ok(None)` when nothing is playing
    async fn fetch_current_playback(&self) -> Result<Option<PlaybackSnapshot>>;
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append_history_entry(&self, item_id: &str, played_at: DateTime<Utc>) -> Result<()>;

    async fn upsert_item_metadata(&self, metadata: &ItemMetadata) -> Result<()>;

    /// Most recent first
    async fn list_history_entries(&self, limit: usize) -> Result<Vec<HistoryEntry>>;

    async fn get_item_metadata(&self, item_id: &str) -> Result<Option<ItemMetadata>>;
}

/// The remote, rate-sensitive source-of-truth play log
#[async_trait]
pub trait RemoteHistorySource: Send + Sync {
    async fn fetch_recent_history(&self, limit: usize) -> Result<Vec<HistoryEntry>>;
}

/// Everything an evaluator gets to look at for one item
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
    pub content_type: ContentType,
    pub title: String,
    pub creator: String,
    pub container_name: String,
    pub lyrics: Option<String>,
}

impl EvaluationContext {
    pub fn for_item(meta: &ItemMetadata, lyrics: Option<String>) -> Self {
        Self {
            content_type: meta.content_type,
            title: meta.title.clone(),
            creator: meta.creator.clone(),
            container_name: meta.container_name.clone(),
            lyrics,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome {
    Ready(Evaluation),
    Pending,
    Unavailable,
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, item_id: &str, context: &EvaluationContext) -> EvaluationOutcome;
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn fetch_text(&self, item: &PlaybackSnapshot) -> Result<Option<String>>;
}

/// Access token set from configuration and replaceable at runtime
#[derive(Default)]
pub struct SharedTokenProvider {
    token: RwLock<Option<String>>,
}

impl SharedTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token.filter(|t| !t.trim().is_empty())),
        }
    }

    /// Swaps the token used from the next request on; a blank token clears it
    pub fn replace(&self, token: Option<String>) {
        let mut slot = self.token.write().unwrap_or_else(PoisonError::into_inner);
        *slot = token.filter(|t| !t.trim().is_empty());
    }
}

#[async_trait]
impl CredentialProvider for SharedTokenProvider {
    async fn access_token(&self) -> Result<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| SyncError::unauthorized("no access token configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blank_token_is_unauthorized() {
        let provider = SharedTokenProvider::new(Some("   ".into()));
        assert!(provider.access_token().await.unwrap_err().is_unauthorized());

        let provider = SharedTokenProvider::new(Some("tok".into()));
        assert_eq!(provider.access_token().await.unwrap(), "tok");
    }

    #[tokio::test]
    async fn replaced_token_is_used_from_then_on() {
        let provider = SharedTokenProvider::new(Some("revoked".into()));
        provider.replace(Some("fresh".into()));
        assert_eq!(provider.access_token().await.unwrap(), "fresh");

        provider.replace(Some("".into()));
        assert!(provider.access_token().await.unwrap_err().is_unauthorized());
    }
}
