use anyhow::{bail, Context, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::StreamExt;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONNECTION, CONTENT_DISPOSITION, CONTENT_RANGE,
    CONTENT_TYPE, LOCATION, RANGE, USER_AGENT,
};
use reqwest::redirect::Policy;
use reqwest::{Client, Proxy, Response, StatusCode};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use url::{Host, Url};

use crate::blacklist::BlacklistStore;
use crate::cache_key;
use crate::config::MediaCacheSettings;
use crate::error::ProxyError;
use crate::media::{file_name_from, MediaMetadata, MetadataReporter};
use crate::storage::StorageEvictionManager;

pub const MAX_REDIRECTS: usize = 5;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const BROWSER_ACCEPT: &str = "image/avif,image/webp,image/apng,image/*,video/*,audio/*,*/*;q=0.8";

/// A completed download living in the cache directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub path: PathBuf,
    pub length: u64,
    pub modified: SystemTime,
}

impl CacheEntry {
    /// Returns `None` when no entry exists for `url`.
    pub async fn lookup(cache_directory: &Path, url: &str) -> std::io::Result<Option<Self>> {
        let key = cache_key::derive(url);
        let path = cache_directory.join(&key);

        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(CacheEntry {
                key,
                length: metadata.len(),
                modified: metadata.modified().unwrap_or_else(|_| SystemTime::now()),
                path,
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Decides which origins the proxy may contact.
#[derive(Clone, Copy, Debug)]
pub struct OriginPolicy {
    allow_private: bool,
}

impl OriginPolicy {
    pub fn new(allow_private: bool) -> Self {
        OriginPolicy { allow_private }
    }

    pub async fn check(&self, url: &Url) -> std::result::Result<(), String> {
        match url.scheme() {
            "https" => (),
            "http" if self.allow_private => (),
            scheme => return Err(format!("unsupported scheme {scheme:?}")),
        }

        if self.allow_private {
            return Ok(());
        }

        match url.host() {
            None => Err("URL has no host".to_string()),
            Some(Host::Ipv4(ip)) => check_address(IpAddr::V4(ip)),
            Some(Host::Ipv6(ip)) => check_address(IpAddr::V6(ip)),
            Some(Host::Domain(domain)) => {
                let domain = domain.trim_end_matches('.').to_ascii_lowercase();
                if domain == "localhost" || domain.ends_with(".localhost") {
                    return Err(format!("host {domain} is not allowed"));
                }

                let port = url.port_or_known_default().unwrap_or(443);
                let resolved = tokio::net::lookup_host((domain.as_str(), port)).await;
                match resolved {
                    Ok(addresses) => {
                        for address in addresses {
                            check_address(address.ip())?;
                        }
                        Ok(())
                    }
                    // unresolvable hosts fail at fetch time instead
                    Err(e) => {
                        log::debug!("Could not resolve {domain}: {e}");
                        Ok(())
                    }
                }
            }
        }
    }
}

fn check_address(ip: IpAddr) -> std::result::Result<(), String> {
    if is_forbidden_address(ip) {
        Err(format!("address {ip} is not publicly routable"))
    } else {
        Ok(())
    }
}

fn is_forbidden_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => is_forbidden_v4(ip),
        IpAddr::V6(ip) => {
            if let Some(mapped) = ip.to_ipv4_mapped() {
                return is_forbidden_v4(mapped);
            }
            let first = ip.segments()[0];
            ip.is_loopback()
                || ip.is_unspecified()
                || ip.is_multicast()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

fn is_forbidden_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || (a == 100 && (64..128).contains(&b))
}

/// Only a range that asks for the whole body is worth sending upstream; anything narrower is
/// served locally once the complete file is cached.
pub fn is_full_range(range: &str) -> bool {
    range.trim().eq_ignore_ascii_case("bytes=0-")
}

/// Total size named by a `Content-Range` that spans the whole representation
/// (`bytes 0-{N-1}/{N}`). Any narrower or unknown-length span yields `None`.
pub fn complete_range_length(content_range: &str) -> Option<u64> {
    let (span, total) = content_range.trim().strip_prefix("bytes ")?.split_once('/')?;
    let (start, end) = span.trim().split_once('-')?;

    let total: u64 = total.trim().parse().ok()?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;

    (start == 0 && total > 0 && end.checked_add(1) == Some(total)).then_some(total)
}

fn partial_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|x| x.to_str().ok())
        .and_then(complete_range_length)
}

/// Media types the cache will store.
pub fn is_media_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    essence.starts_with("image/") || essence.starts_with("video/") || essence.starts_with("audio/")
}

type SharedDownload = Shared<BoxFuture<'static, std::result::Result<CacheEntry, ProxyError>>>;

struct Coordinator {
    client: Client,
    cache_directory: PathBuf,
    max_file_size_bytes: u64,
    policy: OriginPolicy,
    blacklist: Arc<BlacklistStore>,
    storage: Arc<StorageEvictionManager>,
    reporter: Option<MetadataReporter>,
    permits: Semaphore,
    in_flight: Mutex<HashMap<String, SharedDownload>>,
}

/// Clears the in-flight slot for a key when the download task ends, however it ends.
struct InFlightGuard {
    coordinator: Arc<Coordinator>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.coordinator
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Fetches media from origins with at most one download per cache key at a time.
#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<Coordinator>,
}

impl DownloadCoordinator {
    pub fn new(
        settings: &MediaCacheSettings,
        blacklist: Arc<BlacklistStore>,
        storage: Arc<StorageEvictionManager>,
    ) -> Result<Self> {
        let reporter = settings
            .main_server_url
            .as_deref()
            .map(MetadataReporter::new)
            .transpose()?;

        Ok(DownloadCoordinator {
            inner: Arc::new(Coordinator {
                client: build_client(settings)?,
                cache_directory: settings.cache_directory.clone(),
                max_file_size_bytes: settings.max_file_size_bytes,
                policy: OriginPolicy::new(settings.allow_private_origins),
                blacklist,
                storage,
                reporter,
                permits: Semaphore::new(settings.max_concurrent_downloads.max(1)),
                in_flight: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn policy(&self) -> OriginPolicy {
        self.inner.policy
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Downloads `url` into the cache, or joins the download already running for it.
    ///
    /// The download itself runs on its own task, so it completes even if every caller goes away.
    /// All callers joined to the same download observe the same result.
    pub async fn fetch(
        &self,
        url: &str,
        range: Option<&str>,
    ) -> std::result::Result<CacheEntry, ProxyError> {
        if self.inner.blacklist.is_blacklisted(url).await {
            return Err(ProxyError::Blacklisted(url.to_string()));
        }

        let key = cache_key::derive(url);

        let download = {
            let mut in_flight = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            if let Some(existing) = in_flight.get(&key) {
                log::debug!("Joining in-flight download of {url}");
                existing.clone()
            } else {
                let download = self.spawn_download(&key, url, range);
                in_flight.insert(key.clone(), download.clone());
                download
            }
        };

        download.await
    }

    fn spawn_download(&self, key: &str, url: &str, range: Option<&str>) -> SharedDownload {
        let coordinator = self.inner.clone();
        let task_url = url.to_string();
        let range = range.filter(|x| is_full_range(x)).map(str::to_string);
        let guard = InFlightGuard {
            coordinator: coordinator.clone(),
            key: key.to_string(),
        };

        let handle = tokio::spawn(async move {
            let _guard = guard;
            coordinator.download(&task_url, range.as_deref()).await
        });

        let url = url.to_string();
        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(ProxyError::upstream(&url, format!("download task failed: {e}"))),
            }
        }
        .boxed()
        .shared()
    }
}

impl Coordinator {
    async fn download(
        &self,
        url: &str,
        range: Option<&str>,
    ) -> std::result::Result<CacheEntry, ProxyError> {
        // a download that finished just before this one was registered
        if let Ok(Some(entry)) = CacheEntry::lookup(&self.cache_directory, url).await {
            return Ok(entry);
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ProxyError::upstream(url, "download limiter closed"))?;

        log::debug!("Downloading {url}");

        let response = match self.resolve(url, range).await? {
            response
                if response.status() == StatusCode::PARTIAL_CONTENT
                    && partial_length(&response).is_none() =>
            {
                log::debug!("Partial reply for {url} is incomplete, refetching without a range");
                drop(response);
                self.resolve(url, None).await?
            }
            response => response,
        };

        // a 206 is only cacheable when it carries the complete body
        let expected_length = if response.status() == StatusCode::PARTIAL_CONTENT {
            match partial_length(&response) {
                Some(total) => Some(total),
                None => {
                    return Err(self
                        .reject(url, ProxyError::upstream(url, "incomplete partial response"))
                        .await)
                }
            }
        } else {
            None
        };

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|x| x.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if !is_media_content_type(&content_type) {
            return Err(self
                .reject(
                    url,
                    ProxyError::UnsupportedMedia {
                        url: url.to_string(),
                        content_type,
                    },
                )
                .await);
        }

        let declared = response.content_length();
        if declared.is_some_and(|x| x > self.max_file_size_bytes) {
            return Err(self
                .reject(url, ProxyError::upstream(url, "file too large"))
                .await);
        }

        if let Err(e) = self.storage.enforce_budget(declared.unwrap_or(0)).await {
            log::warn!("Eviction pass failed before caching {url}: {e:#}");
        }

        let file_name = file_name_from(
            response
                .headers()
                .get(CONTENT_DISPOSITION)
                .and_then(|x| x.to_str().ok()),
            response.url(),
        );

        let path = cache_key::cache_path(&self.cache_directory, url);
        let temp_path = path.with_extension("tmp");

        let written = match self
            .write_through(response, &temp_path, &path, expected_length)
            .await
        {
            Ok(written) => written,
            Err(e) => {
                if let Err(e) = tokio::fs::remove_file(&temp_path).await {
                    if e.kind() != ErrorKind::NotFound {
                        log::warn!("Failed to remove {}: {e}", temp_path.display());
                    }
                }
                return Err(self
                    .reject(url, ProxyError::upstream(url, format!("{e:#}")))
                    .await);
            }
        };

        log::info!("Cached {url} ({written} bytes, {content_type})");

        if let Some(reporter) = &self.reporter {
            reporter.report_detached(
                MediaMetadata::new(url, &content_type, file_name, written),
                path.clone(),
            );
        }

        CacheEntry::lookup(&self.cache_directory, url)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| ProxyError::upstream(url, "file missing after download"))
    }

    /// Issues the GET and follows redirects by hand so every hop passes the blacklist and the
    /// origin policy.
    async fn resolve(
        &self,
        url: &str,
        range: Option<&str>,
    ) -> std::result::Result<Response, ProxyError> {
        let mut current = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => {
                return Err(self
                    .reject(url, ProxyError::upstream(url, format!("invalid URL: {e}")))
                    .await)
            }
        };
        let mut hops = 0;

        loop {
            let mut request = self.client.get(current.clone());
            if let Some(range) = range {
                request = request.header(RANGE, range);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let reason = if e.is_timeout() {
                        "request timed out".to_string()
                    } else {
                        format!("request failed: {e}")
                    };
                    return Err(self.reject(url, ProxyError::upstream(url, reason)).await);
                }
            };

            let status = response.status();

            if is_followed_redirect(status) {
                if hops == MAX_REDIRECTS {
                    log::warn!("Too many redirects for {url}");
                    return Err(ProxyError::upstream(url, "too many redirects"));
                }

                let target = match response
                    .headers()
                    .get(LOCATION)
                    .and_then(|x| x.to_str().ok())
                    .and_then(|location| current.join(location).ok())
                {
                    Some(target) => target,
                    None => {
                        return Err(self
                            .reject(url, ProxyError::upstream(url, "invalid redirect target"))
                            .await)
                    }
                };

                if self.blacklist.is_blacklisted(target.as_str()).await {
                    return Err(self
                        .reject(
                            url,
                            ProxyError::upstream(
                                url,
                                format!("redirect target {target} is blacklisted"),
                            ),
                        )
                        .await);
                }

                if let Err(reason) = self.policy.check(&target).await {
                    return Err(self
                        .reject(
                            url,
                            ProxyError::upstream(
                                url,
                                format!("redirect target {target} rejected: {reason}"),
                            ),
                        )
                        .await);
                }

                hops += 1;
                log::debug!("Redirect {hops} for {url} -> {target}");
                current = target;
                continue;
            }

            if !status.is_success() {
                return Err(self
                    .reject(url, ProxyError::upstream(url, format!("HTTP error: {status}")))
                    .await);
            }

            return Ok(response);
        }
    }

    async fn write_through(
        &self,
        response: Response,
        temp_path: &Path,
        path: &Path,
        expected_length: Option<u64>,
    ) -> Result<u64> {
        let mut file = File::create(temp_path)
            .await
            .with_context(|| format!("failed to create {}", temp_path.display()))?;

        let mut body = response.bytes_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("download interrupted")?;
            written += chunk.len() as u64;
            if written > self.max_file_size_bytes {
                bail!("file too large");
            }
            file.write_all(&chunk)
                .await
                .context("failed to save file")?;
        }

        file.flush().await.context("failed to save file")?;
        file.sync_all().await.context("failed to save file")?;
        drop(file);

        if let Some(expected) = expected_length {
            if written != expected {
                bail!("truncated body: received {written} of {expected} bytes");
            }
        }

        tokio::fs::rename(temp_path, path)
            .await
            .with_context(|| format!("failed to move download into {}", path.display()))?;

        Ok(written)
    }

    async fn reject(&self, url: &str, error: ProxyError) -> ProxyError {
        self.blacklist.add(url, &error.to_string()).await;
        error
    }
}

fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

fn build_client(settings: &MediaCacheSettings) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(ACCEPT, HeaderValue::from_static(BROWSER_ACCEPT));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));

    let builder = Client::builder()
        .default_headers(headers)
        .redirect(Policy::none())
        .timeout(settings.fetch_timeout)
        .gzip(true)
        .brotli(true)
        .deflate(true);

    let builder = match &settings.outbound_proxy {
        Some(proxy) => {
            log::info!("Routing origin fetches through {proxy}");
            builder.proxy(Proxy::all(proxy).context("invalid OUTBOUND_PROXY")?)
        }
        None => builder.no_proxy(),
    };

    builder.build().context("failed to build origin client")
}
