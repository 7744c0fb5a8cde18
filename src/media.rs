use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Body of the `POST {main}/api/media` callback sent after a successful download.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    pub url: String,
    pub is_image: bool,
    pub is_video: bool,
    pub file_name: String,
    pub file_size: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl MediaMetadata {
    pub fn new(url: &str, content_type: &str, file_name: String, file_size: u64) -> Self {
        let essence = content_type.trim().to_ascii_lowercase();
        MediaMetadata {
            url: url.to_string(),
            is_image: essence.starts_with("image/"),
            is_video: essence.starts_with("video/"),
            file_name,
            file_size,
            width: None,
            height: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MetadataReporter {
    client: Client,
    endpoint: String,
}

impl MetadataReporter {
    pub fn new(main_server_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build metadata client")?;

        Ok(MetadataReporter {
            client,
            endpoint: format!("{}/api/media", main_server_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn report(&self, metadata: &MediaMetadata) -> Result<()> {
        self.client
            .post(&self.endpoint)
            .json(metadata)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", self.endpoint))?
            .error_for_status()?;

        log::debug!("Reported metadata for {}", metadata.url);
        Ok(())
    }

    /// Probes image dimensions from the cached file and reports in the background. Failures are
    /// logged and never reach the download that triggered them.
    pub fn report_detached(&self, mut metadata: MediaMetadata, path: PathBuf) {
        let reporter = self.clone();

        tokio::spawn(async move {
            if metadata.is_image {
                if let Some((width, height)) = probe_dimensions(&path).await {
                    metadata.width = Some(width);
                    metadata.height = Some(height);
                }
            }

            if let Err(e) = reporter.report(&metadata).await {
                log::warn!("Failed to report media metadata for {}: {e:#}", metadata.url);
            }
        });
    }
}

/// Reads just enough of the file to learn its pixel dimensions.
pub async fn probe_dimensions(path: &Path) -> Option<(u32, u32)> {
    let path = path.to_path_buf();

    let probed = tokio::task::spawn_blocking(move || -> Result<(u32, u32)> {
        let dimensions = image::io::Reader::open(&path)?
            .with_guessed_format()?
            .into_dimensions()?;
        Ok(dimensions)
    })
    .await;

    match probed {
        Ok(Ok(dimensions)) => Some(dimensions),
        Ok(Err(e)) => {
            log::debug!("Could not read image dimensions: {e:#}");
            None
        }
        Err(e) => {
            log::warn!("Dimension probe panicked: {e}");
            None
        }
    }
}

/// `filename=` from Content-Disposition when present, otherwise the last path segment.
pub fn file_name_from(content_disposition: Option<&str>, url: &Url) -> String {
    let from_header = content_disposition.and_then(|header| {
        header
            .split(';')
            .map(str::trim)
            .find_map(|part| part.strip_prefix("filename="))
            .map(|name| name.trim_matches('"').trim().to_string())
            .filter(|name| !name.is_empty())
    });

    from_header
        .or_else(|| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "unknown".to_string())
}
