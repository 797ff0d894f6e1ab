use anyhow::Context;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod broadcast;
pub mod cache;
pub mod config;
pub mod daemon;
pub mod error;
pub mod evaluation;
pub mod history;
pub mod lyrics;
pub mod page_scraper;
pub mod pool;
pub mod providers;
pub mod spotify;
pub mod store;
pub mod track_cleaning;
pub mod types;
pub mod websocket;
pub mod websocket_commands;

use broadcast::BroadcastHub;
use cache::PlaybackCache;
use config::Config;
use daemon::PollingDaemon;
use evaluation::{EvaluationCache, HttpEvaluator};
use history::HistoryReconciler;
use lyrics::{LrclibClient, LyricsChain};
use page_scraper::{PageScraper, ScraperSessionFactory};
use pool::ResourcePool;
use providers::{SharedTokenProvider, TextExtractor};
use spotify::SpotifyClient;
use store::JsonHistoryStore;
use websocket::SyncServer;
use websocket_commands::CommandContext;

const SCRAPER_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Runs the service until Ctrl-C or until the WebSocket listener fails
pub async fn run() -> anyhow::Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    info!("Starting nowcast...");
    let config = Config::from_env().context("failed to load configuration")?;

    let credentials = Arc::new(SharedTokenProvider::new(config.spotify_access_token.clone()));
    let spotify = Arc::new(
        SpotifyClient::new(credentials.clone()).context("failed to build Spotify client")?,
    );
    let store = Arc::new(
        JsonHistoryStore::open(&config.history_path)
            .await
            .with_context(|| format!("failed to open {}", config.history_path.display()))?,
    );

    let evaluations = match &config.evaluator_url {
        Some(url) => {
            let evaluator = HttpEvaluator::new(url.clone(), config.evaluator_token.clone())
                .context("failed to build evaluator client")?;
            info!("Evaluations enabled via {}", url);
            Some(Arc::new(EvaluationCache::new(Arc::new(evaluator))))
        }
        None => None,
    };

    let mut text_sources: Vec<Arc<dyn TextExtractor>> =
        vec![Arc::new(LrclibClient::new().context("failed to build LRCLib client")?)];
    let scraper_pool = config.lyrics_page_template.as_ref().map(|template| {
        let pool = ResourcePool::new(
            ScraperSessionFactory::new(SCRAPER_REQUEST_TIMEOUT),
            config.pool_wait_timeout,
            config.pool_idle_timeout,
        );
        text_sources.push(Arc::new(PageScraper::new(pool.clone(), template.clone())));
        info!("Lyrics page fallback enabled");
        pool
    });

    let reaper_cancel = CancellationToken::new();
    let reaper = scraper_pool
        .as_ref()
        .map(|pool| pool.spawn_reaper(config.pool_sweep_interval, reaper_cancel.clone()));

    let cache = Arc::new(PlaybackCache::new(evaluations.is_some()));
    let hub = Arc::new(BroadcastHub::new(cache.clone()));

    let mut daemon = PollingDaemon::new(
        cache.clone(),
        hub.clone(),
        spotify.clone(),
        credentials.clone(),
        config.poll_interval,
    )
    .with_history_store(store.clone())
    .with_text_extractor(Arc::new(LyricsChain::new(text_sources)));
    if let Some(evaluations) = &evaluations {
        daemon = daemon.with_evaluations(evaluations.clone());
    }
    let daemon = Arc::new(daemon);

    match daemon.start().await {
        Ok(status) => info!("Polling daemon {:?}", status),
        Err(e) => warn!(
            "Polling daemon is unauthorized ({}); send START_POLLING once credentials are set",
            e
        ),
    }

    let reconciler = Arc::new(HistoryReconciler::new(
        store,
        spotify,
        evaluations,
        config.history_tolerance,
        config.remote_staleness,
    ));

    let server = SyncServer::new(
        config.ws_port,
        Arc::new(CommandContext {
            cache,
            hub,
            daemon: daemon.clone(),
            credentials,
            reconciler,
            history_limit: config.history_limit,
        }),
    );

    let outcome = tokio::select! {
        result = server.start() => result,
        signal = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            signal.context("failed to listen for Ctrl-C")
        }
    };

    daemon.stop().await;
    reaper_cancel.cancel();
    if let Some(reaper) = reaper {
        if let Err(e) = reaper.await {
            error!("Pool reaper ended abnormally: {}", e);
        }
    }
    if let Some(pool) = scraper_pool {
        pool.close().await;
    }
    info!("nowcast stopped");
    outcome
}
