use anyhow::{Context, Result};
use async_mutex::Mutex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::PathBuf;

pub const BLACKLIST_FILE_NAME: &str = "blacklisted_urls.json";

// Older deployments stored a map of url -> time of blacklisting.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredBlacklist {
    Urls(HashSet<String>),
    Timestamped(HashMap<String, serde_json::Value>),
}

/// Durable set of URLs that must never be fetched again.
///
/// Membership checks hit the in-memory set only. Every addition rewrites the whole file while the
/// lock is held, so concurrent additions can never interleave their writes. When the file cannot
/// be written the in-memory set stays authoritative for the life of the process.
pub struct BlacklistStore {
    path: PathBuf,
    urls: Mutex<HashSet<String>>,
}

impl BlacklistStore {
    /// Loads the set from `path`. A missing or unparsable file yields an empty set.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();

        let urls = match tokio::fs::read(&path).await {
            Ok(raw) => match serde_json::from_slice::<StoredBlacklist>(&raw) {
                Ok(StoredBlacklist::Urls(urls)) => urls,
                Ok(StoredBlacklist::Timestamped(entries)) => entries.into_keys().collect(),
                Err(e) => {
                    log::warn!(
                        "Blacklist at {} is unreadable, starting empty: {e}",
                        path.display()
                    );
                    HashSet::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::warn!("No blacklist found at {}, starting empty", path.display());
                HashSet::new()
            }
            Err(e) => {
                log::warn!(
                    "Failed to read blacklist at {}, starting empty: {e}",
                    path.display()
                );
                HashSet::new()
            }
        };

        log::info!("Loaded {} blacklisted URLs", urls.len());

        BlacklistStore {
            path,
            urls: Mutex::new(urls),
        }
    }

    pub async fn is_blacklisted(&self, url: &str) -> bool {
        self.urls.lock().await.contains(url)
    }

    /// Returns false when the URL was already present; the file is left untouched in that case.
    pub async fn add(&self, url: &str, reason: &str) -> bool {
        let mut urls = self.urls.lock().await;

        if !urls.insert(url.to_string()) {
            log::debug!("{url} already blacklisted");
            return false;
        }

        log::warn!("Blacklisting {url}: {reason}");
        self.persist(&urls).await;
        true
    }

    /// Merges several URLs with a single write. Returns how many were new.
    pub async fn extend<I>(&self, candidates: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut urls = self.urls.lock().await;
        let added = candidates
            .into_iter()
            .filter(|url| urls.insert(url.clone()))
            .count();

        if added > 0 {
            log::info!("Added {added} URLs to the blacklist");
            self.persist(&urls).await;
        }

        added
    }

    pub async fn urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.urls.lock().await.iter().cloned().collect();
        urls.sort();
        urls
    }

    pub async fn len(&self) -> usize {
        self.urls.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn persist(&self, urls: &HashSet<String>) {
        if let Err(e) = self.write(urls).await {
            log::error!("Error saving blacklisted URLs: {e:#}");
        }
    }

    async fn write(&self, urls: &HashSet<String>) -> Result<()> {
        let mut sorted: Vec<&String> = urls.iter().collect();
        sorted.sort();
        let json = serde_json::to_vec_pretty(&sorted)?;

        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, json)
            .await
            .with_context(|| format!("failed to write {}", temp_path.display()))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;

        Ok(())
    }
}
