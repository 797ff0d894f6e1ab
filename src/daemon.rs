use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broadcast::BroadcastHub;
use crate::cache::{PlaybackCache, TrackChange};
use crate::error::Result;
use crate::evaluation::EvaluationCache;
use crate::providers::{
    CredentialProvider, EvaluationContext, EvaluationOutcome, HistoryStore, PlaybackSource,
    TextExtractor,
};
use crate::types::{truncate_text, EvaluationSlot, PlaybackSnapshot};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Lyrics sent along to the evaluator are cut to this many characters
pub const EVALUATION_LYRICS_CAP: usize = 2_000;

/// Failed lyrics lookups per item before the daemon stops asking
pub const MAX_LYRICS_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonStatus {
    Stopped,
    Authorizing,
    Running,
    /// Credentials were missing or rejected; waiting for re-authorization
    Unauthorized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    pub change: TrackChange,
    pub delivered: usize,
}

struct DaemonState {
    status: DaemonStatus,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct SidecarProgress {
    item_id: String,
    lyrics_done: bool,
    lyrics_attempts: u32,
    evaluation_done: bool,
}

pub struct PollingDaemon {
    cache: Arc<PlaybackCache>,
    hub: Arc<BroadcastHub>,
    source: Arc<dyn PlaybackSource>,
    credentials: Arc<dyn CredentialProvider>,
    store: Option<Arc<dyn HistoryStore>>,
    text: Option<Arc<dyn TextExtractor>>,
    evaluations: Option<Arc<EvaluationCache>>,
    interval: Duration,
    state: Mutex<DaemonState>,
    progress: Mutex<SidecarProgress>,
}

impl PollingDaemon {
    pub fn new(
        cache: Arc<PlaybackCache>,
        hub: Arc<BroadcastHub>,
        source: Arc<dyn PlaybackSource>,
        credentials: Arc<dyn CredentialProvider>,
        interval: Duration,
    ) -> Self {
        Self {
            cache,
            hub,
            source,
            credentials,
            store: None,
            text: None,
            evaluations: None,
            interval,
            state: Mutex::new(DaemonState {
                status: DaemonStatus::Stopped,
                cancel: None,
                task: None,
            }),
            progress: Mutex::new(SidecarProgress::default()),
        }
    }

    pub fn with_history_store(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_text_extractor(mut self, text: Arc<dyn TextExtractor>) -> Self {
        self.text = Some(text);
        self
    }

    pub fn with_evaluations(mut self, evaluations: Arc<EvaluationCache>) -> Self {
        self.evaluations = Some(evaluations);
        self
    }

    pub async fn status(&self) -> DaemonStatus {
        self.state.lock().await.status
    }

    /// Starts polling unless already running.
    ///
    /// Without valid credentials the daemon parks in `Unauthorized` and does
    /// not retry; calling `start` again is the re-authorization path.
    pub async fn start(self: &Arc<Self>) -> Result<DaemonStatus> {
        let mut state = self.state.lock().await;
        if matches!(state.status, DaemonStatus::Running | DaemonStatus::Authorizing) {
            debug!("Polling already {:?}; start ignored", state.status);
            return Ok(state.status);
        }

        state.status = DaemonStatus::Authorizing;
        info!("Authorizing playback polling");
        if let Err(e) = self.credentials.access_token().await {
            state.status = DaemonStatus::Unauthorized;
            warn!("Polling not started: {}", e);
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let daemon = Arc::clone(self);
        let token = cancel.clone();
        state.task = Some(tokio::spawn(async move { daemon.run_loop(token).await }));
        state.cancel = Some(cancel);
        state.status = DaemonStatus::Running;
        info!("Polling playback every {:?}", self.interval);
        Ok(DaemonStatus::Running)
    }

    pub async fn stop(&self) {
        let task = {
            let mut state = self.state.lock().await;
            if let Some(cancel) = state.cancel.take() {
                cancel.cancel();
            }
            if state.status != DaemonStatus::Unauthorized {
                state.status = DaemonStatus::Stopped;
            }
            state.task.take()
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Polling task ended abnormally: {}", e);
            }
            info!("Polling stopped");
        }
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.tick().await {
                Ok(outcome) => {
                    if outcome.delivered > 0 {
                        debug!("Tick: {:?}, delivered to {}", outcome.change, outcome.delivered);
                    }
                }
                Err(e) if e.is_unauthorized() => {
                    error!("Playback source rejected credentials: {}", e);
                    let mut state = self.state.lock().await;
                    state.status = DaemonStatus::Unauthorized;
                    state.cancel = None;
                    state.task = None;
                    break;
                }
                Err(e) => warn!("Poll tick skipped: {}", e),
            }
        }
        debug!("Polling loop exited");
    }

    /// One poll cycle: fetch, apply, refresh sidecars, fan out
    pub async fn tick(&self) -> Result<TickOutcome> {
        let candidate = match self.source.fetch_current_playback().await? {
            Some(candidate) => candidate.normalized()?,
            None => PlaybackSnapshot::idle(),
        };

        let now = Utc::now();
        let change = self.cache.apply_track_at(candidate.clone(), now);
        if change == TrackChange::Replaced && !candidate.is_idle() {
            info!("Now playing: '{}' by '{}'", candidate.title, candidate.creator);
            self.record_play(&candidate, now).await;
        }

        if let Some(item) = self.cache.current_item() {
            self.refresh_sidecars(&item).await;
        }

        let delivered = self.hub.notify().await;
        Ok(TickOutcome { change, delivered })
    }

    async fn record_play(&self, item: &PlaybackSnapshot, played_at: chrono::DateTime<Utc>) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.upsert_item_metadata(&item.metadata()).await {
            warn!("Could not store metadata for '{}': {}", item.identity, e);
        }
        if let Err(e) = store.append_history_entry(&item.identity, played_at).await {
            warn!("Could not record play of '{}': {}", item.identity, e);
        }
    }

    // Lyrics failures never hold back the evaluation.
    async fn refresh_sidecars(&self, item: &PlaybackSnapshot) {
        let mut progress = self.progress.lock().await;
        if progress.item_id != item.identity {
            *progress = SidecarProgress {
                item_id: item.identity.clone(),
                ..Default::default()
            };
        }

        if !progress.lyrics_done {
            match &self.text {
                Some(text) => match text.fetch_text(item).await {
                    Ok(lyrics) => {
                        self.cache.apply_lyrics(&item.identity, lyrics);
                        progress.lyrics_done = true;
                    }
                    Err(e) => {
                        progress.lyrics_attempts += 1;
                        warn!(
                            "Lyrics lookup for '{}' failed (attempt {}/{}): {}",
                            item.identity, progress.lyrics_attempts, MAX_LYRICS_ATTEMPTS, e
                        );
                        if progress.lyrics_attempts >= MAX_LYRICS_ATTEMPTS {
                            info!("Giving up on lyrics for '{}'", item.identity);
                            progress.lyrics_done = true;
                        }
                    }
                },
                None => progress.lyrics_done = true,
            }
        }

        if progress.evaluation_done {
            return;
        }
        let Some(evaluations) = &self.evaluations else {
            progress.evaluation_done = true;
            return;
        };

        let lyrics = self
            .cache
            .current_lyrics()
            .map(|text| truncate_text(&text, EVALUATION_LYRICS_CAP));
        let context = EvaluationContext::for_item(&item.metadata(), lyrics);
        match evaluations.evaluate(&item.identity, &context).await {
            EvaluationOutcome::Ready(evaluation) => {
                self.cache
                    .apply_evaluation(&item.identity, Some(EvaluationSlot::Ready(evaluation)));
                progress.evaluation_done = true;
            }
            EvaluationOutcome::Pending => {
                debug!("Evaluation for '{}' still pending", item.identity);
            }
            EvaluationOutcome::Unavailable => {
                warn!("Evaluator unavailable for '{}'", item.identity);
                self.cache.apply_evaluation(&item.identity, None);
                progress.evaluation_done = true;
            }
        }
    }
}
