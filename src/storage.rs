use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{FileTimes, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::sync::Mutex;

use crate::blacklist::BLACKLIST_FILE_NAME;

#[derive(Clone, Debug)]
pub struct CacheFile {
    pub path: PathBuf,
    pub len: u64,
    pub accessed: SystemTime,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub scanned: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,
    pub remaining_bytes: u64,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    pub folder_size_bytes: u64,
    pub storage_limit_bytes: u64,
    pub limit_reached: bool,
}

impl StorageStatus {
    pub fn usage_percent(&self) -> f64 {
        if self.storage_limit_bytes == 0 {
            return 100.0;
        }
        self.folder_size_bytes as f64 * 100.0 / self.storage_limit_bytes as f64
    }

    /// Renders e.g. `[#####---------------] 25.0%` for log lines.
    pub fn usage_bar(&self, width: usize) -> String {
        let percent = self.usage_percent();
        let filled = ((percent / 100.0) * width as f64).round().min(width as f64) as usize;
        format!(
            "[{}{}] {percent:.1}%",
            "#".repeat(filled),
            "-".repeat(width - filled)
        )
    }
}

/// Keeps the cache directory under its byte budget by deleting the least recently accessed
/// payload files first.
pub struct StorageEvictionManager {
    cache_directory: PathBuf,
    budget_bytes: u64,
    // one eviction pass at a time; fetches for different keys still write in parallel
    pass: Mutex<()>,
}

impl StorageEvictionManager {
    pub fn new(cache_directory: impl Into<PathBuf>, budget_bytes: u64) -> Self {
        StorageEvictionManager {
            cache_directory: cache_directory.into(),
            budget_bytes,
            pass: Mutex::new(()),
        }
    }

    /// Deletes files, oldest access time first, until the payload plus `incoming` fits the budget.
    pub async fn enforce_budget(&self, incoming: u64) -> Result<EvictionReport> {
        let _pass = self.pass.lock().await;

        let mut files = self.cache_files().await?;
        let total: u64 = files.iter().map(|x| x.len).sum();
        let target = self.budget_bytes.saturating_sub(incoming);

        let mut report = EvictionReport {
            scanned: files.len(),
            remaining_bytes: total,
            ..Default::default()
        };

        if total <= target {
            return Ok(report);
        }

        log::info!(
            "Cache holds {total} bytes, making room for {incoming} more within {} bytes",
            self.budget_bytes
        );

        files.sort_by_key(|x| x.accessed);

        for file in files {
            if report.remaining_bytes <= target {
                break;
            }

            match tokio::fs::remove_file(&file.path).await {
                Ok(()) => {
                    log::debug!("Evicted {}", file.path.display());
                    report.removed_files += 1;
                    report.removed_bytes += file.len;
                    report.remaining_bytes -= file.len;
                }
                // removed underneath us, the space is free either way
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    report.remaining_bytes -= file.len;
                }
                Err(e) => {
                    log::warn!("Failed to evict {}: {e}", file.path.display());
                }
            }
        }

        log::warn!(
            "Evicted {} files ({} bytes), {} bytes remain",
            report.removed_files,
            report.removed_bytes,
            report.remaining_bytes
        );

        Ok(report)
    }

    pub async fn status(&self) -> Result<StorageStatus> {
        let folder_size_bytes = self.cache_files().await?.iter().map(|x| x.len).sum();

        Ok(StorageStatus {
            folder_size_bytes,
            storage_limit_bytes: self.budget_bytes,
            limit_reached: folder_size_bytes >= self.budget_bytes,
        })
    }

    /// Lists eviction candidates: regular files other than the blacklist and in-progress
    /// `*.tmp` downloads.
    pub async fn cache_files(&self) -> Result<Vec<CacheFile>> {
        let mut entries = tokio::fs::read_dir(&self.cache_directory)
            .await
            .with_context(|| format!("failed to list {}", self.cache_directory.display()))?;

        let mut files = vec![];
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == BLACKLIST_FILE_NAME || name.ends_with(".tmp") {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) => {
                    log::debug!("Skipping {}: {e}", entry.path().display());
                    continue;
                }
            };

            if !metadata.is_file() {
                continue;
            }

            let accessed = metadata
                .accessed()
                .or_else(|_| metadata.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);

            files.push(CacheFile {
                path: entry.path(),
                len: metadata.len(),
                accessed,
            });
        }

        Ok(files)
    }
}

/// Marks a cache file as just accessed, independent of the mount's atime behaviour.
pub async fn touch(path: &Path) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.set_times(FileTimes::new().set_accessed(SystemTime::now()))?;
        Ok(())
    })
    .await?
}
