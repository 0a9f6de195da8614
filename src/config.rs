use crate::asset_cache::{DEFAULT_ASSETS, DEFAULT_CACHE_NAME};
use crate::track::UserId;
use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "info,offline_player=debug";

/// `RUST_LOG` when it is set and parses, the default filter otherwise.
pub fn log_filter(rust_log: Option<String>) -> EnvFilter {
    rust_log
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend_url: String,
    pub user_id: UserId,
    pub port: u16,
    pub data_dir: PathBuf,
    pub asset_cache_name: String,
    pub offline_assets: Vec<String>,
    pub probe_url: String,
    pub probe_interval: Duration,
    pub http_timeout: Duration,
}

impl Config {
    /// Reads the process environment (after `.env` has been loaded).
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend_url = var("BACKEND_URL")
            .context("BACKEND_URL must be set")?
            .trim_end_matches('/')
            .to_string();
        let user_id = UserId::new(var("USER_ID").context("USER_ID must be set")?);

        let port = match var("PORT") {
            Some(raw) => raw.parse().context("PORT must be a number")?,
            None => 3000,
        };
        let probe_interval = match var("PROBE_INTERVAL_SECS") {
            Some(raw) => raw.parse().context("PROBE_INTERVAL_SECS must be a number")?,
            None => 3,
        };
        let http_timeout = match var("HTTP_TIMEOUT_SECS") {
            Some(raw) => raw.parse().context("HTTP_TIMEOUT_SECS must be a number")?,
            None => 10,
        };

        let offline_assets = match var("OFFLINE_ASSETS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => DEFAULT_ASSETS.iter().map(|s| s.to_string()).collect(),
        };

        Ok(Self {
            probe_url: var("PROBE_URL").unwrap_or_else(|| backend_url.clone()),
            backend_url,
            user_id,
            port,
            data_dir: var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            asset_cache_name: var("ASSET_CACHE_NAME")
                .unwrap_or_else(|| DEFAULT_CACHE_NAME.to_string()),
            offline_assets,
            probe_interval: Duration::from_secs(probe_interval),
            http_timeout: Duration::from_secs(http_timeout),
        })
    }
}
