use dotenvy::dotenv;
use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::blacklist::BLACKLIST_FILE_NAME;

const GIGABYTE: u64 = 1024 * 1024 * 1024;
const MEGABYTE: u64 = 1024 * 1024;

pub const DEFAULT_STORAGE_LIMIT_GB: u64 = 10;
pub const DEFAULT_MAX_FILE_SIZE_MB: u64 = 50;
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 5;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything the cache engine needs to know about its environment.
#[derive(Clone, Debug)]
pub struct MediaCacheSettings {
    pub cache_directory: PathBuf,
    pub storage_limit_bytes: u64,
    /// Base URL of the main server; media metadata is POSTed to `{url}/api/media`.
    pub main_server_url: Option<String>,
    pub outbound_proxy: Option<String>,
    pub max_file_size_bytes: u64,
    pub max_concurrent_downloads: usize,
    pub fetch_timeout: Duration,
    /// Permits plain http and loopback/private origins. Development and tests only.
    pub allow_private_origins: bool,
    /// URLs merged into the blacklist at start-up.
    pub seed_blacklist: Vec<String>,
}

impl MediaCacheSettings {
    pub fn new(cache_directory: impl Into<PathBuf>) -> Self {
        MediaCacheSettings {
            cache_directory: cache_directory.into(),
            storage_limit_bytes: DEFAULT_STORAGE_LIMIT_GB * GIGABYTE,
            main_server_url: None,
            outbound_proxy: None,
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_MB * MEGABYTE,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            allow_private_origins: false,
            seed_blacklist: vec![],
        }
    }

    pub fn from_env() -> Self {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let cache_directory = lookup("MEDIA_CACHE_DIR")
            .filter(|x| !x.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                env::current_dir()
                    .unwrap_or_else(|_| PathBuf::from("."))
                    .join("MediaCache")
            });

        let limit_gb: u64 = parse_or(&lookup, "EXTERNAL_MEDIA_LIMIT", DEFAULT_STORAGE_LIMIT_GB);
        let max_file_size_mb: u64 = parse_or(&lookup, "MAX_FILE_SIZE_MB", DEFAULT_MAX_FILE_SIZE_MB);
        let timeout_secs: u64 = parse_or(
            &lookup,
            "FETCH_TIMEOUT_SECS",
            DEFAULT_FETCH_TIMEOUT.as_secs(),
        );

        let seed_blacklist = lookup("ADD_TO_BLACKLIST")
            .filter(|x| !x.trim().is_empty())
            .and_then(|raw| match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(urls) => Some(urls),
                Err(e) => {
                    log::warn!("Ignoring ADD_TO_BLACKLIST, expected a JSON array of URLs: {e}");
                    None
                }
            })
            .unwrap_or_default();

        // zero is treated as unset
        let limit_gb = if limit_gb == 0 {
            DEFAULT_STORAGE_LIMIT_GB
        } else {
            limit_gb
        };

        MediaCacheSettings {
            cache_directory,
            storage_limit_bytes: limit_gb * GIGABYTE,
            main_server_url: non_empty(lookup("MAIN_SERVER_URL"))
                .map(|x| x.trim_end_matches('/').to_string()),
            outbound_proxy: non_empty(lookup("OUTBOUND_PROXY")),
            max_file_size_bytes: max_file_size_mb * MEGABYTE,
            max_concurrent_downloads: parse_or(
                &lookup,
                "MAX_CONCURRENT_DOWNLOADS",
                DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            )
            .max(1),
            fetch_timeout: Duration::from_secs(timeout_secs.max(1)),
            allow_private_origins: parse_flag(&lookup, "ALLOW_PRIVATE_ORIGINS"),
            seed_blacklist,
        }
    }

    pub fn blacklist_path(&self) -> PathBuf {
        self.cache_directory.join(BLACKLIST_FILE_NAME)
    }
}

#[derive(Clone, Debug)]
pub struct ServerSettings {
    pub address: SocketAddr,
}

impl ServerSettings {
    pub fn from_env() -> Self {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = non_empty(lookup("HOST")).unwrap_or_else(|| "0.0.0.0".to_string());
        let port = non_empty(lookup("PORT")).unwrap_or_else(|| "5000".to_string());

        let address = format!("{host}:{port}").parse::<SocketAddr>().unwrap_or_else(|e| {
            log::warn!("Invalid listen address {host}:{port} ({e}), using 0.0.0.0:5000");
            SocketAddr::from(([0, 0, 0, 0], 5000))
        });

        ServerSettings { address }
    }
}

/// Schedule and thresholds for the attachment sweeps.
#[derive(Clone, Debug)]
pub struct SweepSettings {
    pub database_url: Option<String>,
    pub dedup_interval: Duration,
    pub pending_interval: Duration,
    pub pending_expiry: Duration,
}

impl Default for SweepSettings {
    fn default() -> Self {
        SweepSettings {
            database_url: None,
            dedup_interval: Duration::from_secs(24 * 60 * 60),
            pending_interval: Duration::from_secs(30 * 60),
            pending_expiry: Duration::from_secs(60 * 60),
        }
    }
}

impl SweepSettings {
    pub fn from_env() -> Self {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = SweepSettings::default();
        let secs = |key: &str, default: Duration| {
            Duration::from_secs(parse_or(&lookup, key, default.as_secs()).max(1))
        };

        SweepSettings {
            database_url: non_empty(lookup("DATABASE_URL")),
            dedup_interval: secs("DEDUP_INTERVAL_SECS", defaults.dedup_interval),
            pending_interval: secs("PENDING_SWEEP_INTERVAL_SECS", defaults.pending_interval),
            pending_expiry: secs("PENDING_EXPIRY_SECS", defaults.pending_expiry),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|x| x.trim().to_string())
        .filter(|x| !x.is_empty())
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Display + Copy,
    T::Err: Display,
{
    match non_empty(lookup(key)) {
        Some(raw) => raw.parse().unwrap_or_else(|e| {
            log::warn!("Invalid {key} value {raw:?} ({e}), using default {default}");
            default
        }),
        None => default,
    }
}

fn parse_flag<F>(lookup: &F, key: &str) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    non_empty(lookup(key))
        .map(|x| matches!(x.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
