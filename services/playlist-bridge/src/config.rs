use url::Url;
use std::{str::FromStr, time};
use crate::errors::BridgeError;

/// Constants for HTTP Config
pub const HTTP_TIMEOUT: u64 = 8000;
pub const HTTP_CONNECT_TIMEOUT: u64 = 2000;
pub const HTTP_POOL_MAX_IDLE: usize = 16;
pub const HTTP_POOL_IDLE_TIMEOUT: u64 = 90000;
pub const HTTP_MAX_REDIRECTS: u8 = 4;

pub const RETRY_MAX_RETRIES: u32 = 3;
pub const RETRY_BASE_BACKOFF: u64 = 500;
pub const RETRY_FACTOR: u32 = 2;
pub const RETRY_MAX_BACKOFF: u64 = 4000;
pub const RETRY_JITTER: bool = false;

pub const DEFAULT_CONCURRENCY: usize = 5;
pub const RUN_TIMEOUT: u64 = 600;

/// Reads an optional variable, empty counts as unset
fn env_opt(s: &str) -> Option<String> {
    std::env::var(s).ok().filter(|v| !v.trim().is_empty())
}

/// Parses `value` or falls back to `default` when unset. A value that
/// is present but malformed is a config error rather than a silent default
fn parse_or<T: FromStr>(name: &str, value: Option<String>, default: T) ->
    Result<T, BridgeError> {
    match value {
        Some(v) => v.trim().parse::<T>().map_err(|_| BridgeError::Config(
            format!("{name} invalid: {v}")
        )),
        None => Ok(default)
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T, BridgeError> {
    parse_or(name, env_opt(name), default)
}

/// Ensures that url is https
fn ensure_https(url: &Url) -> Result<(), String> {
    if url.scheme() == "https" {
        Ok(())
    } else {
        Err(format!("URL must be https: {url}"))
    }
}

fn ensure_host(url: &Url, expected_host: &str) -> Result<(), String> {
    match url.host_str() {
        Some(h) if h.eq_ignore_ascii_case(expected_host) => Ok(()),
        Some(h) => Err(
            format!("Unexpected host for {url} (got {h}, expected {expected_host})")
        ),
        None => Err(format!("URL missing host: {url}"))
    }
}

/// Parses and validates an API base, always ending in a slash so
/// relative joins keep the version segment
fn api_base(name: &str, raw: &str, expected_host: &str) -> Result<Url, BridgeError> {
    let mut base = Url::parse(raw)
        .map_err(|e| BridgeError::Config(format!("{name} invalid {e}")))?;

    ensure_https(&base).map_err(BridgeError::Config)?;
    ensure_host(&base, expected_host).map_err(BridgeError::Config)?;

    if !base.path().ends_with('/') {
        let mut path = base.path().to_string();
        path.push('/');
        base.set_path(&path);
    }
    Ok(base)
}

///
/// Catalog client configuration, one per platform
///
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub api_base: Url,
    pub concurrency: usize,
    pub min_interval: time::Duration
}

fn build_spotify() -> Result<CatalogConfig, BridgeError> {
    let raw = env_opt("SPOTIFY_API_BASE")
        .unwrap_or_else(|| "https://api.spotify.com/v1/".to_string());
    let api_base = api_base("SPOTIFY_API_BASE", &raw, "api.spotify.com")?;

    Ok(CatalogConfig {
        api_base,
        concurrency: env_or("SPOTIFY_CONCURRENCY", DEFAULT_CONCURRENCY)?.max(1),
        min_interval: time::Duration::from_millis(env_or("SPOTIFY_MIN_INTERVAL_MS", 0)?)
    })
}

fn build_youtube() -> Result<CatalogConfig, BridgeError> {
    let raw = env_opt("YOUTUBE_API_BASE")
        .unwrap_or_else(|| "https://www.googleapis.com/youtube/v3/".to_string());
    let api_base = api_base("YOUTUBE_API_BASE", &raw, "www.googleapis.com")?;

    // search quota is per project, keep a gap between calls
    Ok(CatalogConfig {
        api_base,
        concurrency: env_or("YOUTUBE_CONCURRENCY", DEFAULT_CONCURRENCY)?.max(1),
        min_interval: time::Duration::from_millis(env_or("YOUTUBE_MIN_INTERVAL_MS", 100)?)
    })
}

///
/// Access tokens handed over by the OAuth collaborator. Absent tokens
/// only fail once the platform is actually used
///
#[derive(Clone, Default)]
pub struct TokenConfig {
    pub spotify: Option<String>,
    pub youtube: Option<String>
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("spotify", &self.spotify.as_ref().map(|_| "<redacted>"))
            .field("youtube", &self.youtube.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn build_tokens() -> TokenConfig {
    TokenConfig {
        spotify: env_opt("SPOTIFY_ACCESS_TOKEN"),
        youtube: env_opt("YOUTUBE_ACCESS_TOKEN")
    }
}

///
/// Configuration for Http timeouts, pooling, etc.
///
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: time::Duration,
    pub connect_timeout: time::Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: time::Duration,
    pub max_redirects: u8
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: time::Duration::from_millis(HTTP_TIMEOUT),
            connect_timeout: time::Duration::from_millis(HTTP_CONNECT_TIMEOUT),
            pool_max_idle_per_host: HTTP_POOL_MAX_IDLE,
            pool_idle_timeout: time::Duration::from_millis(HTTP_POOL_IDLE_TIMEOUT),
            max_redirects: HTTP_MAX_REDIRECTS
        }
    }
}

///
/// Backoff schedule for transient failures of a single call
///
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_backoff: time::Duration,
    pub factor: u32,
    pub max_backoff: time::Duration,
    pub jitter: bool
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: RETRY_MAX_RETRIES,
            base_backoff: time::Duration::from_millis(RETRY_BASE_BACKOFF),
            factor: RETRY_FACTOR,
            max_backoff: time::Duration::from_millis(RETRY_MAX_BACKOFF),
            jitter: RETRY_JITTER
        }
    }
}

fn build_retry() -> Result<RetryConfig, BridgeError> {
    let d = RetryConfig::default();
    Ok(RetryConfig {
        max_retries: env_or("RETRY_MAX", d.max_retries)?,
        base_backoff: time::Duration::from_millis(env_or("RETRY_BASE_MS", RETRY_BASE_BACKOFF)?),
        factor: d.factor,
        max_backoff: time::Duration::from_millis(env_or("RETRY_CAP_MS", RETRY_MAX_BACKOFF)?),
        jitter: env_or("RETRY_JITTER", d.jitter)?
    })
}

///
/// Thresholds for accepting a catalog candidate as the same recording
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchingConfig {
    pub accept_threshold: f64,        // minimum score to auto-accept
    pub margin_threshold: f64,        // top1 - top2 gap to auto-accept
    pub duration_full_credit_secs: u32,
    pub duration_zero_credit_secs: u32,
    pub search_limit: usize           // candidates requested per search
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.72,
            margin_threshold: 0.05,
            duration_full_credit_secs: 3,
            duration_zero_credit_secs: 15,
            search_limit: 5
        }
    }
}

impl MatchingConfig {
    pub fn validate(&self) -> Result<(), BridgeError> {
        if !(0.0..=1.0).contains(&self.accept_threshold) {
            return Err(BridgeError::Config(
                format!("accept threshold out of range: {}", self.accept_threshold)
            ));
        }
        if !(0.0..=1.0).contains(&self.margin_threshold) {
            return Err(BridgeError::Config(
                format!("margin threshold out of range: {}", self.margin_threshold)
            ));
        }
        if self.duration_full_credit_secs >= self.duration_zero_credit_secs {
            return Err(BridgeError::Config(
                "duration full-credit window must be narrower than zero-credit window"
                    .to_string()
            ));
        }
        if self.search_limit == 0 {
            return Err(BridgeError::Config("search limit must be positive".to_string()));
        }
        Ok(())
    }
}

fn build_matching() -> Result<MatchingConfig, BridgeError> {
    let d = MatchingConfig::default();
    let matching = MatchingConfig {
        accept_threshold: env_or("MATCH_ACCEPT_THRESHOLD", d.accept_threshold)?,
        margin_threshold: env_or("MATCH_MARGIN_THRESHOLD", d.margin_threshold)?,
        duration_full_credit_secs: env_or("MATCH_DURATION_FULL_SECS", d.duration_full_credit_secs)?,
        duration_zero_credit_secs: env_or("MATCH_DURATION_ZERO_SECS", d.duration_zero_credit_secs)?,
        search_limit: env_or("MATCH_SEARCH_LIMIT", d.search_limit)?
    };
    matching.validate()?;
    Ok(matching)
}

///
/// Fan-out limits and run deadline
///
#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    pub resolve_concurrency: usize,   // cap on in-flight searches per run
    pub run_timeout: time::Duration   // whole convert/sync deadline
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            resolve_concurrency: DEFAULT_CONCURRENCY,
            run_timeout: time::Duration::from_secs(RUN_TIMEOUT)
        }
    }
}

fn build_concurrency() -> Result<ConcurrencyConfig, BridgeError> {
    Ok(ConcurrencyConfig {
        resolve_concurrency: env_or("RESOLVE_CONCURRENCY", DEFAULT_CONCURRENCY)?.max(1),
        run_timeout: time::Duration::from_secs(env_or("RUN_TIMEOUT_SECS", RUN_TIMEOUT)?)
    })
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub db_url: String
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { db_url: "sqlite:./data/bridge.db".to_string() }
    }
}

///
/// Configuration for Logger
///

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json
}

impl FromStr for LogFormat {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(BridgeError::Config(format!("unknown log format: {other}")))
        }
    }
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
            filter_directives: "info,playlist_bridge=debug,reqwest=warn,sqlx=warn".to_string(),
            format: LogFormat::Json,
            with_ansi: true,
            include_file_line: true,
            include_target: true
        }
    }
}

///
/// AppConfig which holds everything the clients and the engine need
///
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub spotify: CatalogConfig,
    pub youtube: CatalogConfig,
    pub tokens: TokenConfig,
    pub http: HttpConfig,
    pub retry: RetryConfig,
    pub matching: MatchingConfig,
    pub concurrency: ConcurrencyConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig
}

///
/// Return all environment variables to caller at program start.
///
pub fn load_config() -> Result<AppConfig, BridgeError> {
    dotenvy::dotenv().ok();

    let spotify     = build_spotify()?;
    let youtube     = build_youtube()?;
    let tokens      = build_tokens();
    let http        = HttpConfig::default();
    let retry       = build_retry()?;
    let matching    = build_matching()?;
    let concurrency = build_concurrency()?;
    let persistence = PersistenceConfig {
        db_url: env_opt("DATABASE_URL").unwrap_or_else(|| PersistenceConfig::default().db_url)
    };
    let logging = LoggingConfig {
        format: env_or("LOG_FORMAT", LogFormat::Json)?,
        ..LoggingConfig::default()
    };

    Ok( AppConfig {
        spotify, youtube, tokens, http, retry, matching,
        concurrency, persistence, logging
    } )
}
