use chrono::Duration as ChronoDuration;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::evaluation::EvaluationCache;
use crate::providers::{EvaluationContext, EvaluationOutcome, HistoryStore, RemoteHistorySource};
use crate::types::{
    EvaluationSummary, HistoryEntry, HistoryOrigin, ItemMetadata, MergedHistoryEntry,
};

pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(180);
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(60);

struct RemoteFetch {
    fetched_at: Instant,
    limit: usize,
    entries: Vec<HistoryEntry>,
}

pub struct HistoryReconciler {
    store: Arc<dyn HistoryStore>,
    remote: Arc<dyn RemoteHistorySource>,
    evaluations: Option<Arc<EvaluationCache>>,
    tolerance: Duration,
    staleness: Duration,
    last_remote: Mutex<Option<RemoteFetch>>,
}

impl HistoryReconciler {
    pub fn new(
        store: Arc<dyn HistoryStore>,
        remote: Arc<dyn RemoteHistorySource>,
        evaluations: Option<Arc<EvaluationCache>>,
        tolerance: Duration,
        staleness: Duration,
    ) -> Self {
        Self {
            store,
            remote,
            evaluations,
            tolerance,
            staleness,
            last_remote: Mutex::new(None),
        }
    }

    /// Up to `limit` plays, newest first, from whichever sources answer
    pub async fn reconcile(&self, limit: usize) -> Vec<MergedHistoryEntry> {
        let local = match self.store.list_history_entries(limit).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Local history unavailable, using remote only: {}", e);
                Vec::new()
            }
        };
        let remote = self.remote_entries(limit).await;

        let tolerance = ChronoDuration::from_std(self.tolerance).unwrap_or(ChronoDuration::zero());
        let mut merged = merge_histories(local, remote, tolerance, limit);
        self.backfill_metadata(&mut merged).await;
        self.attach_evaluations(&mut merged).await;

        info!("Reconciled history: {} entries", merged.len());
        merged
    }

    /// Remote plays, re-fetched only once the last fetch has gone stale
    async fn remote_entries(&self, limit: usize) -> Vec<HistoryEntry> {
        let mut last = self.last_remote.lock().await;
        if let Some(fetch) = last.as_ref() {
            if fetch.fetched_at.elapsed() < self.staleness && fetch.limit >= limit {
                debug!("Using remote history fetched {:?} ago", fetch.fetched_at.elapsed());
                return fetch.entries.iter().take(limit).cloned().collect();
            }
        }

        match self.remote.fetch_recent_history(limit).await {
            Ok(entries) => {
                *last = Some(RemoteFetch {
                    fetched_at: Instant::now(),
                    limit,
                    entries: entries.clone(),
                });
                entries
            }
            Err(e) => {
                warn!("Remote history unavailable: {}", e);
                // A stale copy beats nothing
                last.as_ref()
                    .map(|fetch| fetch.entries.iter().take(limit).cloned().collect())
                    .unwrap_or_default()
            }
        }
    }

    async fn backfill_metadata(&self, merged: &mut [MergedHistoryEntry]) {
        for item in merged.iter_mut().filter(|m| m.entry.title.is_empty()) {
            if let Ok(Some(meta)) = self.store.get_item_metadata(&item.entry.item_id).await {
                fill_blanks(&mut item.entry, &meta);
            }
        }
    }

    async fn attach_evaluations(&self, merged: &mut [MergedHistoryEntry]) {
        let Some(evaluations) = &self.evaluations else {
            return;
        };

        for item in merged.iter_mut() {
            let item_id = item.entry.item_id.clone();
            if let Some(hit) = evaluations.cached(&item_id).await {
                item.evaluation = Some(EvaluationSummary::from(&hit.evaluation));
                item.lyrics_excerpt = hit.lyrics_excerpt;
                continue;
            }

            let context = EvaluationContext::for_item(&entry_metadata(&item.entry), None);
            match evaluations.evaluate(&item_id, &context).await {
                EvaluationOutcome::Ready(evaluation) => {
                    item.evaluation = Some(EvaluationSummary::from(&evaluation));
                }
                EvaluationOutcome::Pending => {
                    debug!("Evaluation for '{}' still pending", item_id);
                }
                EvaluationOutcome::Unavailable => {
                    debug!("No evaluation available for '{}'", item_id);
                }
            }
        }
    }
}

fn entry_metadata(entry: &HistoryEntry) -> ItemMetadata {
    ItemMetadata {
        item_id: entry.item_id.clone(),
        title: entry.title.clone(),
        creator: entry.creator.clone(),
        container_name: entry.container_name.clone(),
        artwork_url: entry.artwork_url.clone(),
        duration_ms: entry.duration_ms,
        ..Default::default()
    }
}

fn fill_blanks(entry: &mut HistoryEntry, meta: &ItemMetadata) {
    if entry.title.is_empty() {
        entry.title = meta.title.clone();
    }
    if entry.creator.is_empty() {
        entry.creator = meta.creator.clone();
    }
    if entry.container_name.is_empty() {
        entry.container_name = meta.container_name.clone();
    }
    if entry.artwork_url.is_none() {
        entry.artwork_url = meta.artwork_url.clone();
    }
    if entry.duration_ms == 0 {
        entry.duration_ms = meta.duration_ms;
    }
}

fn combine(local: &HistoryEntry, remote: &HistoryEntry) -> HistoryEntry {
    let mut entry = remote.clone();
    if entry.title.is_empty() {
        entry.title = local.title.clone();
    }
    if entry.creator.is_empty() {
        entry.creator = local.creator.clone();
    }
    if entry.container_name.is_empty() {
        entry.container_name = local.container_name.clone();
    }
    if entry.artwork_url.is_none() {
        entry.artwork_url = local.artwork_url.clone();
    }
    if entry.duration_ms == 0 {
        entry.duration_ms = local.duration_ms;
    }
    entry.origin = HistoryOrigin::Merged;
    entry
}

/// Deterministic merge of two play logs.
///
/// Output is sorted newest first (stable, so equal timestamps keep merge
/// order) and cut to `limit`.
pub fn merge_histories(
    local: Vec<HistoryEntry>,
    remote: Vec<HistoryEntry>,
    tolerance: ChronoDuration,
    limit: usize,
) -> Vec<MergedHistoryEntry> {
    let mut consumed = vec![false; remote.len()];
    let mut merged = Vec::with_capacity(local.len() + remote.len());

    // Greedy: first unconsumed remote play of the same item inside the window.
    for local_entry in local {
        let matched = remote.iter().enumerate().position(|(i, candidate)| {
            !consumed[i]
                && candidate.item_id == local_entry.item_id
                && (candidate.played_at - local_entry.played_at).abs() <= tolerance
        });

        match matched {
            Some(i) => {
                consumed[i] = true;
                merged.push(MergedHistoryEntry {
                    entry: combine(&local_entry, &remote[i]),
                    local_played_at: Some(local_entry.played_at),
                    evaluation: None,
                    lyrics_excerpt: None,
                });
            }
            None => {
                let mut entry = local_entry;
                entry.origin = HistoryOrigin::LocalStore;
                merged.push(MergedHistoryEntry {
                    entry,
                    local_played_at: None,
                    evaluation: None,
                    lyrics_excerpt: None,
                });
            }
        }
    }

    for (entry, used) in remote.into_iter().zip(consumed) {
        if used {
            continue;
        }
        let mut entry = entry;
        entry.origin = HistoryOrigin::RemoteSource;
        merged.push(MergedHistoryEntry {
            entry,
            local_played_at: None,
            evaluation: None,
            lyrics_excerpt: None,
        });
    }

    merged.sort_by(|a, b| b.entry.played_at.cmp(&a.entry.played_at));
    merged.truncate(limit);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, SyncError};
    use crate::providers::Evaluator;
    use crate::store::JsonHistoryStore;
    use crate::types::Evaluation;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn entry(id: &str, at: DateTime<Utc>, origin: HistoryOrigin) -> HistoryEntry {
        HistoryEntry {
            item_id: id.into(),
            title: format!("{} ({:?})", id, origin),
            creator: "Artist".into(),
            container_name: String::new(),
            artwork_url: None,
            duration_ms: 0,
            played_at: at,
            origin,
        }
    }

    fn local(id: &str, at: DateTime<Utc>) -> HistoryEntry {
        entry(id, at, HistoryOrigin::LocalStore)
    }

    fn remote(id: &str, at: DateTime<Utc>) -> HistoryEntry {
        entry(id, at, HistoryOrigin::RemoteSource)
    }

    fn window() -> ChronoDuration {
        ChronoDuration::seconds(180)
    }

    struct FakeRemote {
        calls: AtomicUsize,
        entries: Option<Vec<HistoryEntry>>,
    }

    #[async_trait]
    impl RemoteHistorySource for FakeRemote {
        async fn fetch_recent_history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.entries {
                Some(entries) => Ok(entries.iter().take(limit).cloned().collect()),
                None => Err(SyncError::transient("remote down")),
            }
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl HistoryStore for BrokenStore {
        async fn append_history_entry(&self, _item_id: &str, _played_at: DateTime<Utc>) -> Result<()> {
            Err(SyncError::transient("disk gone"))
        }
        async fn upsert_item_metadata(&self, _metadata: &ItemMetadata) -> Result<()> {
            Err(SyncError::transient("disk gone"))
        }
        async fn list_history_entries(&self, _limit: usize) -> Result<Vec<HistoryEntry>> {
            Err(SyncError::transient("disk gone"))
        }
        async fn get_item_metadata(&self, _item_id: &str) -> Result<Option<ItemMetadata>> {
            Err(SyncError::transient("disk gone"))
        }
    }

    struct RatingEvaluator;

    #[async_trait]
    impl Evaluator for RatingEvaluator {
        async fn evaluate(&self, item_id: &str, _context: &EvaluationContext) -> EvaluationOutcome {
            if item_id == "unknown" {
                return EvaluationOutcome::Unavailable;
            }
            EvaluationOutcome::Ready(Evaluation {
                rating: format!("rating-{}", item_id),
                level: 1,
                confidence: 0.5,
                explanation: String::new(),
            })
        }
    }

    #[test]
    fn close_plays_merge_into_one_remote_timed_entry() {
        let merged = merge_histories(
            vec![local("x", t0())],
            vec![remote("x", t0() + ChronoDuration::seconds(90))],
            window(),
            10,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].entry.origin, HistoryOrigin::Merged);
        assert_eq!(merged[0].entry.played_at, t0() + ChronoDuration::seconds(90));
        assert_eq!(merged[0].local_played_at, Some(t0()));
        assert_eq!(merged[0].entry.title, "x (RemoteSource)");
    }

    #[test]
    fn distant_plays_stay_separate() {
        let merged = merge_histories(
            vec![local("x", t0())],
            vec![remote("x", t0() + ChronoDuration::seconds(181))],
            window(),
            10,
        );
        let origins: Vec<_> = merged.iter().map(|m| m.entry.origin).collect();
        assert_eq!(origins, vec![HistoryOrigin::RemoteSource, HistoryOrigin::LocalStore]);
    }

    #[test]
    fn first_remote_candidate_wins_and_is_consumed_once() {
        let remote_entries = vec![
            remote("x", t0() + ChronoDuration::seconds(120)),
            remote("x", t0() + ChronoDuration::seconds(10)),
        ];
        let merged = merge_histories(
            vec![local("x", t0()), local("x", t0() + ChronoDuration::seconds(60))],
            remote_entries,
            window(),
            10,
        );
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().all(|m| m.entry.origin == HistoryOrigin::Merged));
        // The first local play took the first remote candidate in remote order
        let first = merged
            .iter()
            .find(|m| m.local_played_at == Some(t0()))
            .unwrap();
        assert_eq!(first.entry.played_at, t0() + ChronoDuration::seconds(120));
    }

    #[test]
    fn merge_is_deterministic_sorted_and_truncated() {
        let local_entries = vec![
            local("c", t0() + ChronoDuration::minutes(20)),
            local("b", t0() + ChronoDuration::minutes(10)),
            local("a", t0()),
        ];
        let remote_entries = vec![
            remote("d", t0() + ChronoDuration::minutes(30)),
            remote("b", t0() + ChronoDuration::minutes(11)),
            remote("e", t0() + ChronoDuration::minutes(5)),
        ];

        let first = merge_histories(local_entries.clone(), remote_entries.clone(), window(), 3);
        let second = merge_histories(local_entries, remote_entries, window(), 3);
        assert_eq!(first, second);

        let ids: Vec<_> = first.iter().map(|m| m.entry.item_id.as_str()).collect();
        assert_eq!(ids, vec!["d", "c", "b"]);
        assert_eq!(first[2].entry.origin, HistoryOrigin::Merged);
    }

    #[test]
    fn merged_entry_keeps_local_metadata_where_remote_is_blank() {
        let mut local_entry = local("x", t0());
        local_entry.duration_ms = 200_000;
        local_entry.artwork_url = Some("art".into());
        let mut remote_entry = remote("x", t0());
        remote_entry.title = String::new();

        let merged = merge_histories(vec![local_entry], vec![remote_entry], window(), 10);
        assert_eq!(merged[0].entry.title, "x (LocalStore)");
        assert_eq!(merged[0].entry.duration_ms, 200_000);
        assert_eq!(merged[0].entry.artwork_url.as_deref(), Some("art"));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_fetch_respects_staleness_window() {
        let store = Arc::new(JsonHistoryStore::in_memory());
        let fake = Arc::new(FakeRemote {
            calls: AtomicUsize::new(0),
            entries: Some(vec![remote("x", t0())]),
        });
        let reconciler = HistoryReconciler::new(
            store,
            fake.clone(),
            None,
            DEFAULT_TOLERANCE,
            Duration::from_secs(60),
        );

        reconciler.reconcile(10).await;
        reconciler.reconcile(5).await;
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);

        reconciler.reconcile(20).await;
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        reconciler.reconcile(20).await;
        assert_eq!(fake.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn degrades_to_whichever_source_answers() {
        let fake = Arc::new(FakeRemote {
            calls: AtomicUsize::new(0),
            entries: Some(vec![remote("r", t0())]),
        });
        let reconciler = HistoryReconciler::new(
            Arc::new(BrokenStore),
            fake,
            None,
            DEFAULT_TOLERANCE,
            DEFAULT_STALENESS,
        );
        let merged = reconciler.reconcile(10).await;
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].entry.origin, HistoryOrigin::RemoteSource);

        let store = Arc::new(JsonHistoryStore::in_memory());
        store.append_history_entry("l", t0()).await.unwrap();
        let down = Arc::new(FakeRemote {
            calls: AtomicUsize::new(0),
            entries: None,
        });
        let reconciler =
            HistoryReconciler::new(store, down, None, DEFAULT_TOLERANCE, DEFAULT_STALENESS);
        let merged = reconciler.reconcile(10).await;
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].entry.origin, HistoryOrigin::LocalStore);
    }

    #[tokio::test]
    async fn entries_are_enriched_from_evaluations_and_store() {
        let store = Arc::new(JsonHistoryStore::in_memory());
        store
            .upsert_item_metadata(&ItemMetadata {
                item_id: "l".into(),
                title: "Local Song".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        store.append_history_entry("l", t0()).await.unwrap();
        store
            .append_history_entry("unknown", t0() + ChronoDuration::minutes(5))
            .await
            .unwrap();

        let evaluations = Arc::new(EvaluationCache::new(Arc::new(RatingEvaluator)));
        let warm = EvaluationContext {
            lyrics: Some("cached words".into()),
            ..Default::default()
        };
        evaluations.evaluate("l", &warm).await;

        let remote_source = Arc::new(FakeRemote {
            calls: AtomicUsize::new(0),
            entries: Some(vec![remote("r", t0() + ChronoDuration::minutes(10))]),
        });
        let reconciler = HistoryReconciler::new(
            store,
            remote_source,
            Some(evaluations),
            DEFAULT_TOLERANCE,
            DEFAULT_STALENESS,
        );

        let merged = reconciler.reconcile(10).await;
        let ids: Vec<_> = merged.iter().map(|m| m.entry.item_id.as_str()).collect();
        assert_eq!(ids, vec!["r", "unknown", "l"]);

        assert_eq!(merged[0].evaluation.as_ref().map(|e| e.rating.as_str()), Some("rating-r"));
        assert_eq!(merged[0].lyrics_excerpt, None);
        assert_eq!(merged[1].evaluation, None);
        assert_eq!(merged[2].entry.title, "Local Song");
        assert_eq!(merged[2].lyrics_excerpt.as_deref(), Some("cached words"));
    }
}
