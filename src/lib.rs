extern crate log;

pub mod blacklist;
pub mod cache_key;
pub mod config;
pub mod db;
pub mod delivery;
pub mod error;
pub mod media;
pub mod models;
pub mod proxy;
pub mod retriever;
pub mod schema;
pub mod server;
pub mod storage;
pub mod tasks;

pub use blacklist::BlacklistStore;
pub use config::{MediaCacheSettings, ServerSettings, SweepSettings};
pub use error::ProxyError;
pub use proxy::MediaProxyService;
pub use retriever::{CacheEntry, DownloadCoordinator};
pub use storage::StorageEvictionManager;
