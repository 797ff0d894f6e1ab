use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;

use crate::types::{truncate_text, EvaluationSlot, PlaybackSnapshot, SnapshotView};

/// Largest gap between the extrapolated and the reported cursor that still
/// counts as "the same, uninterrupted playback"
pub const SEEK_TOLERANCE_MS: u64 = 2_000;

/// Lyrics longer than this are cut before they go out to subscribers
pub const SNAPSHOT_LYRICS_CAP: usize = 6_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackChange {
    /// Same item, cursor within tolerance: nothing to broadcast
    Unchanged,
    /// Same item, but the cursor or the play state moved under us
    Corrected,
    /// A different item (or the first observation) replaced the record
    Replaced,
}

impl TrackChange {
    pub fn bumped(self) -> bool {
        self != TrackChange::Unchanged
    }
}

#[derive(Debug)]
struct CacheState {
    /// `None` until the first poll lands
    playback: Option<PlaybackSnapshot>,
    version: u64,
    updated_at: DateTime<Utc>,
    /// When `playback.position_ms` was last written
    anchor_at: DateTime<Utc>,
    lyrics: Option<String>,
    evaluation: Option<EvaluationSlot>,
}

impl CacheState {
    fn bump(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }

    fn position_at(&self, now: DateTime<Utc>) -> u64 {
        let Some(playback) = &self.playback else {
            return 0;
        };
        extrapolate(playback, self.anchor_at, now)
    }

    fn identity(&self) -> Option<&str> {
        self.playback.as_ref().map(|p| p.identity.as_str())
    }
}

fn extrapolate(playback: &PlaybackSnapshot, anchor_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    if !playback.is_playing {
        return playback.position_ms;
    }
    let elapsed = (now - anchor_at).num_milliseconds().max(0) as u64;
    let position = playback.position_ms.saturating_add(elapsed);
    if playback.duration_ms > 0 {
        position.min(playback.duration_ms)
    } else {
        position
    }
}

fn same_serialized<T: Serialize>(a: &T, b: &T) -> bool {
    match (serde_json::to_string(a), serde_json::to_string(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

pub struct PlaybackCache {
    evaluator_configured: bool,
    state: Mutex<CacheState>,
}

impl PlaybackCache {
    /// `evaluator_configured` decides whether a new item starts with a
    /// pending evaluation or with none at all.
    pub fn new(evaluator_configured: bool) -> Self {
        let now = Utc::now();
        Self {
            evaluator_configured,
            state: Mutex::new(CacheState {
                playback: None,
                version: 0,
                updated_at: now,
                anchor_at: now,
                lyrics: None,
                evaluation: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn evaluator_configured(&self) -> bool {
        self.evaluator_configured
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    pub fn current_item(&self) -> Option<PlaybackSnapshot> {
        self.lock().playback.clone().filter(|p| !p.is_idle())
    }

    pub fn apply_track(&self, candidate: PlaybackSnapshot) -> TrackChange {
        self.apply_track_at(candidate, Utc::now())
    }

    pub fn apply_track_at(&self, candidate: PlaybackSnapshot, now: DateTime<Utc>) -> TrackChange {
        let mut state = self.lock();

        if state.identity() != Some(candidate.identity.as_str()) {
            debug!(
                "Item changed: {:?} -> '{}'",
                state.identity(),
                candidate.identity
            );
            state.evaluation = if self.evaluator_configured && !candidate.is_idle() {
                Some(EvaluationSlot::Pending)
            } else {
                None
            };
            state.playback = Some(candidate);
            state.anchor_at = now;
            state.lyrics = None;
            state.bump(now);
            return TrackChange::Replaced;
        }

        let expected = state.position_at(now);
        let Some(stored) = state.playback.as_mut() else {
            return TrackChange::Unchanged;
        };
        let drift = expected.abs_diff(candidate.position_ms);
        if drift <= SEEK_TOLERANCE_MS && stored.is_playing == candidate.is_playing {
            return TrackChange::Unchanged;
        }

        debug!(
            "Correcting cursor for '{}': expected {}ms, reported {}ms (playing: {})",
            candidate.identity, expected, candidate.position_ms, candidate.is_playing
        );
        stored.position_ms = candidate.position_ms;
        stored.is_playing = candidate.is_playing;
        state.anchor_at = now;
        state.bump(now);
        TrackChange::Corrected
    }

    // Sidecars for an item that is no longer current are dropped.
    pub fn apply_lyrics(&self, item_id: &str, lyrics: Option<String>) -> bool {
        let mut state = self.lock();
        if state.identity() != Some(item_id) {
            debug!("Dropping lyrics for stale item '{}'", item_id);
            return false;
        }
        if same_serialized(&state.lyrics, &lyrics) {
            return false;
        }
        state.lyrics = lyrics;
        state.bump(Utc::now());
        true
    }

    pub fn apply_evaluation(&self, item_id: &str, evaluation: Option<EvaluationSlot>) -> bool {
        let mut state = self.lock();
        if state.identity() != Some(item_id) {
            debug!("Dropping evaluation for stale item '{}'", item_id);
            return false;
        }
        if same_serialized(&state.evaluation, &evaluation) {
            return false;
        }
        state.evaluation = evaluation;
        state.bump(Utc::now());
        true
    }

    pub fn current_lyrics(&self) -> Option<String> {
        self.lock().lyrics.clone()
    }

    pub fn snapshot(&self) -> SnapshotView {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> SnapshotView {
        let state = self.lock();
        let mut playback = state.playback.clone().unwrap_or_default();
        playback.position_ms = state.position_at(now);
        SnapshotView {
            version: state.version,
            updated_at: state.updated_at,
            playback,
            lyrics: state
                .lyrics
                .as_deref()
                .map(|text| truncate_text(text, SNAPSHOT_LYRICS_CAP)),
            evaluation: state.evaluation.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Evaluation;
    use chrono::Duration;

    fn playing(id: &str, position_ms: u64) -> PlaybackSnapshot {
        PlaybackSnapshot {
            identity: id.into(),
            title: format!("title {}", id),
            position_ms,
            duration_ms: 200_000,
            is_playing: true,
            ..Default::default()
        }
    }

    fn verdict() -> Evaluation {
        Evaluation {
            rating: "clean".into(),
            level: 1,
            confidence: 0.9,
            explanation: "nothing flagged".into(),
        }
    }

    #[test]
    fn steady_playback_never_bumps() {
        let cache = PlaybackCache::new(false);
        let t0 = Utc::now();
        assert_eq!(cache.apply_track_at(playing("a", 10_000), t0), TrackChange::Replaced);
        let version = cache.version();

        // Each poll reports a cursor within 2s of where extrapolation puts it.
        for (secs, reported) in [(3, 13_500), (6, 15_100), (9, 19_000), (12, 21_000)] {
            let change = cache.apply_track_at(playing("a", reported), t0 + Duration::seconds(secs));
            assert_eq!(change, TrackChange::Unchanged);
        }
        assert_eq!(cache.version(), version);
    }

    #[test]
    fn seek_is_corrected_without_replacing() {
        let cache = PlaybackCache::new(true);
        let t0 = Utc::now();
        cache.apply_track_at(playing("a", 10_000), t0);
        cache.apply_lyrics("a", Some("la la".into()));
        let version = cache.version();

        let change = cache.apply_track_at(playing("a", 90_000), t0 + Duration::seconds(3));
        assert_eq!(change, TrackChange::Corrected);
        assert_eq!(cache.version(), version + 1);

        let view = cache.snapshot_at(t0 + Duration::seconds(4));
        assert_eq!(view.playback.position_ms, 91_000);
        assert_eq!(view.lyrics.as_deref(), Some("la la"));
    }

    #[test]
    fn new_item_clears_lyrics_and_marks_evaluation_pending() {
        let cache = PlaybackCache::new(true);
        cache.apply_track(playing("a", 0));
        cache.apply_lyrics("a", Some("old words".into()));
        cache.apply_evaluation("a", Some(EvaluationSlot::Ready(verdict())));

        cache.apply_track(playing("b", 0));
        let view = cache.snapshot();
        assert_eq!(view.playback.identity, "b");
        assert_eq!(view.lyrics, None);
        assert_eq!(view.evaluation, Some(EvaluationSlot::Pending));
    }

    #[test]
    fn without_evaluator_new_item_has_no_evaluation() {
        let cache = PlaybackCache::new(false);
        cache.apply_track(playing("a", 0));
        assert_eq!(cache.snapshot().evaluation, None);
    }

    #[test]
    fn first_idle_poll_bumps_once() {
        let cache = PlaybackCache::new(true);
        assert_eq!(cache.apply_track(PlaybackSnapshot::idle()), TrackChange::Replaced);
        assert_eq!(cache.apply_track(PlaybackSnapshot::idle()), TrackChange::Unchanged);
        assert_eq!(cache.version(), 1);

        let view = cache.snapshot();
        assert!(!view.playback.is_playing);
        assert_eq!(view.evaluation, None);
    }

    #[test]
    fn pause_is_recorded_and_freezes_cursor() {
        let cache = PlaybackCache::new(false);
        let t0 = Utc::now();
        cache.apply_track_at(playing("a", 10_000), t0);

        let mut paused = playing("a", 11_000);
        paused.is_playing = false;
        let change = cache.apply_track_at(paused, t0 + Duration::seconds(1));
        assert_eq!(change, TrackChange::Corrected);

        let later = cache.snapshot_at(t0 + Duration::seconds(60));
        assert_eq!(later.playback.position_ms, 11_000);
        assert!(!later.playback.is_playing);
    }

    #[test]
    fn sidecars_only_bump_on_real_change() {
        let cache = PlaybackCache::new(true);
        cache.apply_track(playing("a", 0));
        let version = cache.version();

        assert!(cache.apply_lyrics("a", Some("words".into())));
        assert!(!cache.apply_lyrics("a", Some("words".into())));
        assert!(cache.apply_evaluation("a", Some(EvaluationSlot::Ready(verdict()))));
        assert!(!cache.apply_evaluation("a", Some(EvaluationSlot::Ready(verdict()))));
        assert_eq!(cache.version(), version + 2);

        assert!(!cache.apply_lyrics("other", Some("nope".into())));
        assert_eq!(cache.version(), version + 2);
    }

    #[test]
    fn snapshot_clamps_cursor_and_caps_lyrics() {
        let cache = PlaybackCache::new(false);
        let t0 = Utc::now();
        cache.apply_track_at(playing("a", 199_000), t0);
        cache.apply_lyrics("a", Some("x".repeat(SNAPSHOT_LYRICS_CAP + 50)));

        let view = cache.snapshot_at(t0 + Duration::seconds(30));
        assert_eq!(view.playback.position_ms, 200_000);
        assert_eq!(view.lyrics.map(|l| l.len()), Some(SNAPSHOT_LYRICS_CAP));
        assert_eq!(cache.current_lyrics().map(|l| l.len()), Some(SNAPSHOT_LYRICS_CAP + 50));
    }
}
