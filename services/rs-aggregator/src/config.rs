//!
//! src/config.rs  Andrew Belles  Oct 2nd, 2025
//!
//! Loads the aggregator configuration from the environment (.env aware)
//! and provides defaults for everything that is not a secret
//!

use std::{net::SocketAddr, time};

use url::Url;

use crate::errors::AggregatorError;

/// Constants for HTTP Config
pub const HTTP_TIMEOUT: u64 = 8000;
pub const HTTP_CONNECT_TIMEOUT: u64 = 2000;
pub const HTTP_POOL_MAX_IDLE: usize = 16;
pub const HTTP_POOL_IDLE_TIMEOUT: u64 = 90000;
pub const HTTP_MAX_REDIRECTS: u8 = 4;

pub const RETRY_MAX_ATTEMPTS: u8 = 3;
pub const RETRY_BASE_BACKOFF: u64 = 250;
pub const RETRY_JITTER: bool = true;

/// Cache lifetimes, in seconds
pub const TTL_PROFILE_INFO: u64 = 12 * 60 * 60;
pub const TTL_RECENT_TRACKS: u64 = 20;
pub const TTL_COMPATIBILITY: u64 = 12 * 60 * 60;
pub const TTL_STATIONS: u64 = 12 * 60 * 60;
pub const CACHE_MAX_ENTRIES: u64 = 10_000;

/// Client side batch widths
pub const BATCH_PROFILE_INFO: usize = 10;
pub const BATCH_COMPATIBILITY: usize = 10;
pub const BATCH_RECENT_TRACKS: usize = 5;

/// Number of tracks requested per user, 3 plus a possible now playing duplicate
pub const RECENT_TRACKS_LIMIT: u32 = 4;

/// Wrapper over env::var to return an invalid enviroment var error
fn env_check(s: &str) -> Result<String, AggregatorError> {
    match std::env::var(s) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AggregatorError::Config(format!("{s} was not set"))),
    }
}

fn env_or(s: &str, default: &str) -> String {
    std::env::var(s)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_to_u64(s: &str, default: u64) -> u64 {
    match std::env::var(s) {
        Ok(v) => v.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default
    }
}

fn env_to_usize(s: &str, default: usize) -> usize {
    match std::env::var(s) {
        Ok(v) => v.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default
    }
}

/// Ensures that url is https
pub(crate) fn ensure_https(url: &Url) -> Result<(), String> {
    if url.scheme() == "https" {
        Ok(())
    } else {
        Err(format!("URL must be https: {url}"))
    }
}

/// Url::join drops the last segment unless the base ends in '/'
pub(crate) fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let mut path = url.path().to_string();
        path.push('/');
        url.set_path(&path);
    }
    url
}

///
/// Configuration for the last.fm api
///
#[derive(Debug, Clone)]
pub struct LastFmConfig {
    pub base_url: Url,
    pub api_key: String
}

fn build_lastfm() -> Result<LastFmConfig, AggregatorError> {
    let api_key  = env_check("LASTFM_API_KEY")?;
    let base_url = env_or("LASTFM_BASE_URL", "https://ws.audioscrobbler.com/2.0/");

    let base_url = Url::parse(&base_url)
        .map_err(|e| AggregatorError::Config(
            format!("LASTFM_BASE_URL invalid {e}")
        ))?;
    ensure_https(&base_url).map_err(AggregatorError::Config)?;

    Ok( LastFmConfig { base_url: with_trailing_slash(base_url), api_key } )
}

///
/// Configuration for Http timeouts, retries, etc.
///
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u8,
    pub base_backoff: time::Duration,
    pub jitter: bool
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            base_backoff: time::Duration::from_millis(RETRY_BASE_BACKOFF),
            jitter: RETRY_JITTER
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: time::Duration,
    pub connect_timeout: time::Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: time::Duration,
    pub max_redirects: u8,
    pub retry: RetryConfig
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: time::Duration::from_millis(HTTP_TIMEOUT),
            connect_timeout: time::Duration::from_millis(HTTP_CONNECT_TIMEOUT),
            pool_max_idle_per_host: HTTP_POOL_MAX_IDLE,
            pool_idle_timeout: time::Duration::from_millis(HTTP_POOL_IDLE_TIMEOUT),
            max_redirects: HTTP_MAX_REDIRECTS,
            retry: RetryConfig::default()
        }
    }
}

///
/// Configuration for the response cache. TTLs are per endpoint
///
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: u64,
    pub ttl_profile_info: u64,
    pub ttl_recent_tracks: u64,  // short, now playing ages fast
    pub ttl_compatibility: u64,
    pub ttl_stations: u64
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: CACHE_MAX_ENTRIES,
            ttl_profile_info: TTL_PROFILE_INFO,
            ttl_recent_tracks: TTL_RECENT_TRACKS,
            ttl_compatibility: TTL_COMPATIBILITY,
            ttl_stations: TTL_STATIONS
        }
    }
}

fn build_cache() -> CacheConfig {
    let defaults = CacheConfig::default();
    CacheConfig {
        max_entries: env_to_u64("CACHE_MAX_ENTRIES", defaults.max_entries),
        ttl_profile_info: env_to_u64("CACHE_TTL_PROFILE_INFO", defaults.ttl_profile_info),
        ttl_recent_tracks: env_to_u64("CACHE_TTL_RECENT_TRACKS", defaults.ttl_recent_tracks),
        ttl_compatibility: env_to_u64("CACHE_TTL_COMPATIBILITY", defaults.ttl_compatibility),
        ttl_stations: env_to_u64("CACHE_TTL_STATIONS", defaults.ttl_stations),
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr
}

fn build_server() -> Result<ServerConfig, AggregatorError> {
    let bind = env_or("AGGREGATOR_BIND", "127.0.0.1:3000");
    let bind = bind.parse::<SocketAddr>()
        .map_err(|e| AggregatorError::Config(format!("AGGREGATOR_BIND invalid {e}")))?;
    Ok( ServerConfig { bind } )
}

///
/// Configuration for the station record store
///
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub db_url: String,
    pub seed_path: Option<String>  // json array of station rows, upserted at start
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { db_url: "sqlite:./data/stations.db".to_string(), seed_path: None }
    }
}

///
/// Configuration for the batched client that talks to the aggregation
/// endpoints (the same shape the browser used)
///
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: Url,
    pub profile_info_batch: usize,
    pub compatibility_batch: usize,
    pub recent_tracks_batch: usize
}

impl ClientConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url: with_trailing_slash(base_url),
            profile_info_batch: BATCH_PROFILE_INFO,
            compatibility_batch: BATCH_COMPATIBILITY,
            recent_tracks_batch: BATCH_RECENT_TRACKS
        }
    }
}

fn build_client(server: &ServerConfig) -> Result<ClientConfig, AggregatorError> {
    let default_base = format!("http://{}/aggregate/", server.bind);
    let base_url = env_or("AGGREGATOR_BASE_URL", &default_base);
    let base_url = Url::parse(&base_url)
        .map_err(|e| AggregatorError::Config(
            format!("AGGREGATOR_BASE_URL invalid {e}")
        ))?;

    let mut cfg = ClientConfig::new(base_url);
    cfg.profile_info_batch  = env_to_usize("BATCH_PROFILE_INFO", cfg.profile_info_batch);
    cfg.compatibility_batch = env_to_usize("BATCH_COMPATIBILITY", cfg.compatibility_batch);
    cfg.recent_tracks_batch = env_to_usize("BATCH_RECENT_TRACKS", cfg.recent_tracks_batch);
    Ok(cfg)
}

///
/// Configuration for Logger
///

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub filter_directives: String,
    pub format: LogFormat,
    pub with_ansi: bool,
    pub include_file_line: bool,
    pub include_target: bool
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter_directives: "info,rs_aggregator=debug,reqwest=warn,sqlx=warn".to_string(),
            format: LogFormat::Json,
            with_ansi: true,
            include_file_line: true,
            include_target: true
        }
    }
}

fn build_logging() -> LoggingConfig {
    let mut cfg = LoggingConfig::default();
    if env_or("LOG_FORMAT", "json").eq_ignore_ascii_case("pretty") {
        cfg.format = LogFormat::Pretty;
    }
    cfg
}

///
/// AppConfig which holds everything the service needs at start
///
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub lastfm: LastFmConfig,
    pub http: HttpConfig,
    pub cache: CacheConfig,
    pub server: ServerConfig,
    pub persistence: PersistenceConfig,
    pub client: ClientConfig,
    pub logging: LoggingConfig
}

///
/// Return all environment variables to caller at program start.
///
pub fn load_config() -> Result<AppConfig, AggregatorError> {
    dotenvy::dotenv().ok();

    let lastfm  = build_lastfm()?;
    let http    = HttpConfig::default();
    let cache   = build_cache();
    let server  = build_server()?;
    let persistence = PersistenceConfig {
        db_url: env_or("DATABASE_URL", &PersistenceConfig::default().db_url),
        seed_path: std::env::var("STATIONS_SEED").ok().filter(|p| !p.trim().is_empty())
    };
    let client  = build_client(&server)?;
    let logging = build_logging();

    Ok( AppConfig { lastfm, http, cache, server, persistence, client, logging } )
}
