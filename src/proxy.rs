use anyhow::{Context, Result};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use url::Url;

use crate::blacklist::BlacklistStore;
use crate::config::MediaCacheSettings;
use crate::delivery;
use crate::error::ProxyError;
use crate::retriever::{CacheEntry, DownloadCoordinator};
use crate::storage::{self, StorageEvictionManager};

/// Entry point for `GET /api/proxy/media`: blacklist, then cache, then origin.
pub struct MediaProxyService {
    settings: MediaCacheSettings,
    blacklist: Arc<BlacklistStore>,
    storage: Arc<StorageEvictionManager>,
    downloads: DownloadCoordinator,
    served: AtomicU64,
}

impl MediaProxyService {
    pub async fn new(settings: MediaCacheSettings) -> Result<Self> {
        tokio::fs::create_dir_all(&settings.cache_directory)
            .await
            .with_context(|| {
                format!(
                    "failed to create cache directory {}",
                    settings.cache_directory.display()
                )
            })?;

        let blacklist = Arc::new(BlacklistStore::load(settings.blacklist_path()).await);
        if !settings.seed_blacklist.is_empty() {
            blacklist.extend(settings.seed_blacklist.clone()).await;
        }

        let storage = Arc::new(StorageEvictionManager::new(
            &settings.cache_directory,
            settings.storage_limit_bytes,
        ));

        match storage.status().await {
            Ok(status) => log::info!(
                "Media cache {} {} ({} of {} bytes)",
                settings.cache_directory.display(),
                status.usage_bar(30),
                status.folder_size_bytes,
                status.storage_limit_bytes
            ),
            Err(e) => log::warn!("Could not measure media cache: {e:#}"),
        }

        let downloads = DownloadCoordinator::new(&settings, blacklist.clone(), storage.clone())?;

        Ok(MediaProxyService {
            settings,
            blacklist,
            storage,
            downloads,
            served: AtomicU64::new(0),
        })
    }

    pub fn settings(&self) -> &MediaCacheSettings {
        &self.settings
    }

    pub fn blacklist(&self) -> &Arc<BlacklistStore> {
        &self.blacklist
    }

    pub fn storage(&self) -> &Arc<StorageEvictionManager> {
        &self.storage
    }

    pub fn downloads(&self) -> &DownloadCoordinator {
        &self.downloads
    }

    pub fn served_count(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    pub async fn get_media(
        &self,
        url: Option<&str>,
        headers: &HeaderMap,
    ) -> Result<Response, ProxyError> {
        let url = url
            .map(|x| x.trim().trim_matches('"').trim())
            .filter(|x| !x.is_empty())
            .ok_or_else(|| ProxyError::InvalidRequest("URL parameter is required.".to_string()))?;

        let parsed = Url::parse(url)
            .map_err(|e| ProxyError::InvalidRequest(format!("invalid URL {url}: {e}")))?;

        if self.blacklist.is_blacklisted(url).await {
            log::debug!("Refusing blacklisted {url}");
            return Err(ProxyError::Blacklisted(url.to_string()));
        }

        match CacheEntry::lookup(&self.settings.cache_directory, url).await {
            Ok(Some(entry)) => {
                log::debug!("Cache hit for {url}");
                match self.deliver(&entry, headers).await {
                    Err(ProxyError::Storage(reason)) => {
                        log::warn!("Cached copy of {url} unusable ({reason}), downloading again");
                    }
                    result => return result,
                }
            }
            Ok(None) => log::debug!("Cache miss for {url}"),
            Err(e) => log::warn!("Cache lookup for {url} failed: {e}"),
        }

        // cached entries passed this check when they were fetched
        if let Err(reason) = self.downloads.policy().check(&parsed).await {
            log::warn!("Refusing {url}: {reason}");
            return Err(ProxyError::InvalidRequest(format!(
                "{url} is not allowed: {reason}"
            )));
        }

        let range = headers.get(header::RANGE).and_then(|x| x.to_str().ok());
        let entry = self.downloads.fetch(url, range).await?;

        match self.deliver(&entry, headers).await {
            Err(ProxyError::Storage(_)) => Err(ProxyError::upstream(
                url,
                "file missing after download",
            )),
            result => result,
        }
    }

    async fn deliver(&self, entry: &CacheEntry, headers: &HeaderMap) -> Result<Response, ProxyError> {
        let response = delivery::serve(entry, headers).await?;

        if let Err(e) = storage::touch(&entry.path).await {
            log::debug!("Could not refresh access time of {}: {e:#}", entry.key);
        }
        self.served.fetch_add(1, Ordering::Relaxed);

        Ok(response)
    }
}
