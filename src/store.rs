use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::{Result, SyncError};
use crate::providers::HistoryStore;
use crate::types::{HistoryEntry, HistoryOrigin, ItemMetadata};

const MAX_HISTORY_SIZE: usize = 500;
const DEDUP_WINDOW_SECONDS: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPlay {
    item_id: String,
    played_at_ms: i64,
}

/// On-disk layout: plays newest first, metadata keyed by item id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredLog {
    plays: Vec<StoredPlay>,
    items: HashMap<String, ItemMetadata>,
}

impl StoredLog {
    /// Drops metadata no remaining play points at
    fn prune_items(&mut self) {
        let live: HashSet<&str> = self.plays.iter().map(|p| p.item_id.as_str()).collect();
        let before = self.items.len();
        self.items.retain(|id, _| live.contains(id.as_str()));
        if self.items.len() < before {
            debug!("Pruned {} unreferenced items", before - self.items.len());
        }
    }

    fn to_entry(&self, play: &StoredPlay) -> HistoryEntry {
        let played_at = DateTime::from_timestamp_millis(play.played_at_ms).unwrap_or_else(Utc::now);
        match self.items.get(&play.item_id) {
            Some(meta) => HistoryEntry::from_metadata(meta, played_at, HistoryOrigin::LocalStore),
            None => HistoryEntry {
                item_id: play.item_id.clone(),
                title: String::new(),
                creator: String::new(),
                container_name: String::new(),
                artwork_url: None,
                duration_ms: 0,
                played_at,
                origin: HistoryOrigin::LocalStore,
            },
        }
    }
}

/// Play log kept in a JSON file, or only in memory when no path is given
pub struct JsonHistoryStore {
    path: Option<PathBuf>,
    log: Mutex<StoredLog>,
}

impl JsonHistoryStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            log: Mutex::new(StoredLog::default()),
        }
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let log = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<StoredLog>(&bytes).map_err(|e| {
                SyncError::inconsistent(format!("corrupt history file {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoredLog::default(),
            Err(e) => return Err(e.into()),
        };
        info!(
            "Opened history store {} ({} plays, {} items)",
            path.display(),
            log.plays.len(),
            log.items.len()
        );
        Ok(Self {
            path: Some(path),
            log: Mutex::new(log),
        })
    }

    async fn persist(&self, log: &StoredLog) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(log)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for JsonHistoryStore {
    async fn append_history_entry(&self, item_id: &str, played_at: DateTime<Utc>) -> Result<()> {
        let mut log = self.log.lock().await;
        let played_at_ms = played_at.timestamp_millis();
        let window_ms = DEDUP_WINDOW_SECONDS * 1000;

        let duplicate = log
            .plays
            .iter()
            .any(|p| p.item_id == item_id && (p.played_at_ms - played_at_ms).abs() <= window_ms);
        if duplicate {
            debug!("Skipping duplicate play of '{}'", item_id);
            return Ok(());
        }

        let mut next = log.clone();
        let position = next
            .plays
            .iter()
            .position(|p| p.played_at_ms < played_at_ms)
            .unwrap_or(next.plays.len());
        next.plays.insert(
            position,
            StoredPlay {
                item_id: item_id.to_string(),
                played_at_ms,
            },
        );
        next.plays.truncate(MAX_HISTORY_SIZE);
        next.prune_items();

        self.persist(&next).await?;
        *log = next;
        Ok(())
    }

    async fn upsert_item_metadata(&self, metadata: &ItemMetadata) -> Result<()> {
        let mut log = self.log.lock().await;
        if log.items.get(&metadata.item_id) == Some(metadata) {
            return Ok(());
        }
        let mut next = log.clone();
        next.items.insert(metadata.item_id.clone(), metadata.clone());
        self.persist(&next).await?;
        *log = next;
        Ok(())
    }

    async fn list_history_entries(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let log = self.log.lock().await;
        Ok(log
            .plays
            .iter()
            .take(limit)
            .map(|play| log.to_entry(play))
            .collect())
    }

    async fn get_item_metadata(&self, item_id: &str) -> Result<Option<ItemMetadata>> {
        Ok(self.log.lock().await.items.get(item_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn meta(id: &str) -> ItemMetadata {
        ItemMetadata {
            item_id: id.into(),
            title: format!("Song {}", id),
            creator: "Band".into(),
            duration_ms: 180_000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn lists_newest_first_with_metadata() {
        let store = JsonHistoryStore::in_memory();
        let t0 = Utc::now();
        store.upsert_item_metadata(&meta("a")).await.unwrap();
        store.append_history_entry("a", t0).await.unwrap();
        store.append_history_entry("b", t0 + Duration::minutes(4)).await.unwrap();
        store.append_history_entry("c", t0 - Duration::minutes(4)).await.unwrap();

        let entries = store.list_history_entries(10).await.unwrap();
        let ids: Vec<_> = entries.iter().map(|e| e.item_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert_eq!(entries[1].title, "Song a");
        assert_eq!(entries[0].title, "");
        assert!(entries.iter().all(|e| e.origin == HistoryOrigin::LocalStore));

        assert_eq!(store.list_history_entries(2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn repeated_play_within_window_is_dropped() {
        let store = JsonHistoryStore::in_memory();
        let t0 = Utc::now();
        store.append_history_entry("a", t0).await.unwrap();
        store.append_history_entry("a", t0 + Duration::seconds(5)).await.unwrap();
        store.append_history_entry("a", t0 + Duration::seconds(60)).await.unwrap();
        assert_eq!(store.list_history_entries(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.json");
        let t0 = Utc::now();

        {
            let store = JsonHistoryStore::open(&path).await.unwrap();
            store.upsert_item_metadata(&meta("a")).await.unwrap();
            store.append_history_entry("a", t0).await.unwrap();
        }

        let store = JsonHistoryStore::open(&path).await.unwrap();
        let entries = store.list_history_entries(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].played_at.timestamp_millis(), t0.timestamp_millis());
        assert_eq!(store.get_item_metadata("a").await.unwrap(), Some(meta("a")));
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            JsonHistoryStore::open(&path).await,
            Err(SyncError::DataInconsistency(_))
        ));
    }

    #[tokio::test]
    async fn log_is_capped() {
        let store = JsonHistoryStore::in_memory();
        let t0 = Utc::now();
        for i in 0..(MAX_HISTORY_SIZE + 5) {
            let id = format!("item-{}", i);
            store.upsert_item_metadata(&meta(&id)).await.unwrap();
            store
                .append_history_entry(&id, t0 + Duration::minutes(i as i64))
                .await
                .unwrap();
        }
        let entries = store.list_history_entries(usize::MAX).await.unwrap();
        assert_eq!(entries.len(), MAX_HISTORY_SIZE);
        assert_eq!(entries[0].item_id, format!("item-{}", MAX_HISTORY_SIZE + 4));
        assert_eq!(entries[0].title, format!("Song item-{}", MAX_HISTORY_SIZE + 4));

        assert!(store.log.lock().await.items.len() <= MAX_HISTORY_SIZE);
        assert_eq!(store.get_item_metadata("item-0").await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("sub");
        let store = JsonHistoryStore::open(blocker.join("history.json")).await.unwrap();
        // A plain file where the parent directory should go makes every write fail.
        std::fs::write(&blocker, b"").unwrap();

        assert!(store.upsert_item_metadata(&meta("a")).await.is_err());
        assert!(store.append_history_entry("a", Utc::now()).await.is_err());

        assert!(store.list_history_entries(10).await.unwrap().is_empty());
        assert_eq!(store.get_item_metadata("a").await.unwrap(), None);
    }
}
