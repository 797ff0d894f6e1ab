use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::daemon::DEFAULT_POLL_INTERVAL;
use crate::history::{DEFAULT_STALENESS, DEFAULT_TOLERANCE};

/// Runtime settings, read from the environment (and `.env`)
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub ws_port: u16,
    pub poll_interval: Duration,
    /// Default and maximum size of a history request
    pub history_limit: usize,
    pub history_tolerance: Duration,
    pub remote_staleness: Duration,
    pub pool_wait_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_sweep_interval: Duration,
    pub history_path: PathBuf,
    pub evaluator_url: Option<String>,
    pub evaluator_token: Option<String>,
    /// e.g. `https://example.com/{creator}-{title}-lyrics`
    pub lyrics_page_template: Option<String>,
    pub spotify_access_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_port: 8765,
            poll_interval: DEFAULT_POLL_INTERVAL,
            history_limit: 50,
            history_tolerance: DEFAULT_TOLERANCE,
            remote_staleness: DEFAULT_STALENESS,
            pool_wait_timeout: Duration::from_secs(30),
            pool_idle_timeout: Duration::from_secs(300),
            pool_sweep_interval: Duration::from_secs(60),
            history_path: PathBuf::from("nowcast-history.json"),
            evaluator_url: None,
            evaluator_token: None,
            lyrics_page_template: None,
            spotify_access_token: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or blank keys keep their
    /// defaults.
    pub fn from_lookup<L>(lookup: L) -> Result<Self>
    where
        L: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Config::default();

        let secs = |key: &str, default: Duration| -> Result<Duration> {
            Ok(parse(&get, key)?.map(Duration::from_secs).unwrap_or(default))
        };

        let config = Config {
            ws_port: parse(&get, "NOWCAST_WS_PORT")?.unwrap_or(defaults.ws_port),
            poll_interval: parse(&get, "NOWCAST_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            history_limit: parse(&get, "NOWCAST_HISTORY_LIMIT")?.unwrap_or(defaults.history_limit),
            history_tolerance: secs("NOWCAST_HISTORY_TOLERANCE_SECS", defaults.history_tolerance)?,
            remote_staleness: secs("NOWCAST_REMOTE_STALENESS_SECS", defaults.remote_staleness)?,
            pool_wait_timeout: secs("NOWCAST_POOL_WAIT_TIMEOUT_SECS", defaults.pool_wait_timeout)?,
            pool_idle_timeout: secs("NOWCAST_POOL_IDLE_TIMEOUT_SECS", defaults.pool_idle_timeout)?,
            pool_sweep_interval: secs(
                "NOWCAST_POOL_SWEEP_INTERVAL_SECS",
                defaults.pool_sweep_interval,
            )?,
            history_path: get("NOWCAST_HISTORY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.history_path),
            evaluator_url: get("NOWCAST_EVALUATOR_URL"),
            evaluator_token: get("NOWCAST_EVALUATOR_TOKEN"),
            lyrics_page_template: get("NOWCAST_LYRICS_PAGE_TEMPLATE"),
            spotify_access_token: get("SPOTIFY_ACCESS_TOKEN"),
        };

        if config.poll_interval.is_zero() {
            anyhow::bail!("NOWCAST_POLL_INTERVAL_MS must be greater than zero");
        }
        if config.history_limit == 0 {
            anyhow::bail!("NOWCAST_HISTORY_LIMIT must be greater than zero");
        }
        if config.pool_sweep_interval.is_zero() {
            anyhow::bail!("NOWCAST_POOL_SWEEP_INTERVAL_SECS must be greater than zero");
        }
        Ok(config)
    }
}

fn parse<T, G>(get: &G, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.parse::<T>()
                .with_context(|| format!("invalid value for {}: '{}'", key, raw))
        })
        .transpose()
}
