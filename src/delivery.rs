use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use md5::{Digest, Md5};
use regex::Regex;
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::error::ProxyError;
use crate::retriever::CacheEntry;

pub const CACHE_CONTROL_VALUE: &str = "public, max-age=31536000";

const SNIFF_LEN: usize = 8192;

lazy_static! {
    static ref RANGE_RE: Regex = Regex::new(r"^bytes=(\d+)-(\d*)$").unwrap();
}

/// Inclusive byte range within a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Parses `bytes=start-end` (end optional) against a file of `length` bytes.
///
/// Anything else, including multi-range requests and bounds past the end of the file, is
/// unsatisfiable.
pub fn parse_range(value: &str, length: u64) -> Result<ByteRange, ProxyError> {
    let unsatisfiable = ProxyError::RangeNotSatisfiable { length };

    let captures = RANGE_RE
        .captures(value.trim())
        .ok_or_else(|| unsatisfiable.clone())?;

    let start: u64 = captures[1].parse().map_err(|_| unsatisfiable.clone())?;
    let end: u64 = match &captures[2] {
        "" => length.checked_sub(1).ok_or_else(|| unsatisfiable.clone())?,
        raw => raw.parse().map_err(|_| unsatisfiable.clone())?,
    };

    if start >= length || end >= length || start > end {
        return Err(unsatisfiable);
    }

    Ok(ByteRange { start, end })
}

/// Quoted base64 MD5 of the file contents.
pub async fn compute_etag(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!(
        "\"{}\"",
        general_purpose::STANDARD.encode(hasher.finalize())
    ))
}

pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let if_none_match = if_none_match.trim();
    if_none_match == "*"
        || if_none_match
            .split(',')
            .map(|x| x.trim().trim_start_matches("W/"))
            .any(|x| x == etag)
}

async fn sniff_content_type(file: &mut File) -> std::io::Result<String> {
    let mut head = Vec::with_capacity(SNIFF_LEN);
    (&mut *file).take(SNIFF_LEN as u64).read_to_end(&mut head).await?;
    file.seek(SeekFrom::Start(0)).await?;

    Ok(infer::get(&head)
        .map(|kind| kind.mime_type().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string()))
}

fn storage_error(entry: &CacheEntry, e: std::io::Error) -> ProxyError {
    log::error!("Failed to serve cached file {}: {e}", entry.path.display());
    ProxyError::Storage(format!("failed to read cached file {}", entry.key))
}

fn insert(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Builds the response for a cached file: `304` when the client's validator matches, `206` for
/// a satisfiable range, `200` with the full body otherwise.
pub async fn serve(entry: &CacheEntry, request: &HeaderMap) -> Result<Response, ProxyError> {
    let mut file = File::open(&entry.path)
        .await
        .map_err(|e| storage_error(entry, e))?;
    let metadata = file.metadata().await.map_err(|e| storage_error(entry, e))?;
    let length = metadata.len();
    let modified = metadata.modified().unwrap_or(entry.modified);

    let etag = compute_etag(&entry.path)
        .await
        .map_err(|e| storage_error(entry, e))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(CACHE_CONTROL_VALUE),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    insert(&mut headers, header::ETAG, &etag);
    insert(
        &mut headers,
        header::LAST_MODIFIED,
        &httpdate::fmt_http_date(modified),
    );

    if let Some(if_none_match) = request
        .get(header::IF_NONE_MATCH)
        .and_then(|x| x.to_str().ok())
    {
        if etag_matches(if_none_match, &etag) {
            log::debug!("Not modified: {}", entry.key);
            return Ok((StatusCode::NOT_MODIFIED, headers).into_response());
        }
    }

    let content_type = sniff_content_type(&mut file)
        .await
        .map_err(|e| storage_error(entry, e))?;
    insert(&mut headers, header::CONTENT_TYPE, &content_type);

    if let Some(range) = request.get(header::RANGE) {
        let range = range
            .to_str()
            .map_err(|_| ProxyError::RangeNotSatisfiable { length })
            .and_then(|x| parse_range(x, length))?;

        file.seek(SeekFrom::Start(range.start))
            .await
            .map_err(|e| storage_error(entry, e))?;

        insert(
            &mut headers,
            header::CONTENT_RANGE,
            &format!("bytes {}-{}/{length}", range.start, range.end),
        );
        insert(&mut headers, header::CONTENT_LENGTH, &range.len().to_string());

        let body = Body::from_stream(ReaderStream::new(file.take(range.len())));
        return Ok((StatusCode::PARTIAL_CONTENT, headers, body).into_response());
    }

    insert(&mut headers, header::CONTENT_LENGTH, &length.to_string());
    let body = Body::from_stream(ReaderStream::new(file));

    Ok((StatusCode::OK, headers, body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    const URL: &str = "https://cdn.example.com/blob.bin";

    async fn cached(bytes: &[u8]) -> (TempDir, CacheEntry) {
        let dir = tempdir().unwrap();
        std::fs::write(crate::cache_key::cache_path(dir.path(), URL), bytes).unwrap();
        let entry = CacheEntry::lookup(dir.path(), URL).await.unwrap().unwrap();
        (dir, entry)
    }

    fn thousand_bytes() -> Vec<u8> {
        (0..1000u32).map(|x| (x % 251) as u8).collect()
    }

    async fn body_of(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(
            parse_range("bytes=0-99", 1000).unwrap(),
            ByteRange { start: 0, end: 99 }
        );
        assert_eq!(
            parse_range("bytes=900-", 1000).unwrap(),
            ByteRange { start: 900, end: 999 }
        );
        assert!(parse_range("bytes=2000-", 1000).is_err());
        assert!(parse_range("bytes=0-1000", 1000).is_err());
        assert!(parse_range("bytes=50-10", 1000).is_err());
        assert!(parse_range("bytes=-500", 1000).is_err());
        assert!(parse_range("bytes=0-1,5-9", 1000).is_err());
        assert!(parse_range("items=0-1", 1000).is_err());
        assert!(parse_range("bytes=0-", 0).is_err());
    }

    #[test]
    fn test_etag_matching() {
        assert!(etag_matches("\"abc\"", "\"abc\""));
        assert!(etag_matches("\"x\", \"abc\"", "\"abc\""));
        assert!(etag_matches("W/\"abc\"", "\"abc\""));
        assert!(etag_matches("*", "\"abc\""));
        assert!(!etag_matches("\"abd\"", "\"abc\""));
    }

    #[tokio::test]
    async fn test_etag_is_base64_md5() {
        let (_dir, entry) = cached(b"abc").await;
        assert_eq!(
            compute_etag(&entry.path).await.unwrap(),
            "\"kAFQmDzST7DWlj99KOF/cg==\""
        );
    }

    #[tokio::test]
    async fn test_full_response() {
        let (_dir, entry) = cached(&thousand_bytes()).await;
        let response = serve(&entry, &HeaderMap::new()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers().clone();
        assert_eq!(headers[header::CACHE_CONTROL], CACHE_CONTROL_VALUE);
        assert_eq!(headers[header::CONTENT_LENGTH], "1000");
        assert_eq!(headers[header::CONTENT_TYPE], "application/octet-stream");
        assert!(headers.contains_key(header::ETAG));
        assert!(headers.contains_key(header::LAST_MODIFIED));
        assert_eq!(body_of(response).await, thousand_bytes());
    }

    #[tokio::test]
    async fn test_content_type_is_sniffed() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        let (_dir, entry) = cached(&png).await;
        let response = serve(&entry, &HeaderMap::new()).await.unwrap();

        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(body_of(response).await, png.to_vec());
    }

    #[tokio::test]
    async fn test_matching_validator_is_not_modified() {
        let (_dir, entry) = cached(&thousand_bytes()).await;
        let etag = compute_etag(&entry.path).await.unwrap();

        let mut request = HeaderMap::new();
        request.insert(header::IF_NONE_MATCH, HeaderValue::from_str(&etag).unwrap());
        let response = serve(&entry, &request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(response.headers()[header::ETAG], etag.as_str());
        assert!(body_of(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_partial_content() {
        let (_dir, entry) = cached(&thousand_bytes()).await;

        let mut request = HeaderMap::new();
        request.insert(header::RANGE, HeaderValue::from_static("bytes=0-99"));
        let response = serve(&entry, &request).await.unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-99/1000");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "100");
        assert_eq!(body_of(response).await, thousand_bytes()[..100].to_vec());
    }

    #[tokio::test]
    async fn test_open_ended_range_runs_to_end() {
        let (_dir, entry) = cached(&thousand_bytes()).await;

        let mut request = HeaderMap::new();
        request.insert(header::RANGE, HeaderValue::from_static("bytes=990-"));
        let response = serve(&entry, &request).await.unwrap();

        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 990-999/1000");
        assert_eq!(body_of(response).await, thousand_bytes()[990..].to_vec());
    }

    #[tokio::test]
    async fn test_range_past_end_is_unsatisfiable() {
        let (_dir, entry) = cached(&thousand_bytes()).await;

        let mut request = HeaderMap::new();
        request.insert(header::RANGE, HeaderValue::from_static("bytes=2000-"));
        let error = serve(&entry, &request).await.unwrap_err();

        assert_eq!(error, ProxyError::RangeNotSatisfiable { length: 1000 });
    }

    #[tokio::test]
    async fn test_missing_file_is_storage_error() {
        let (_dir, entry) = cached(b"gone").await;
        std::fs::remove_file(&entry.path).unwrap();

        let error = serve(&entry, &HeaderMap::new()).await.unwrap_err();
        assert!(matches!(error, ProxyError::Storage(_)));
    }
}
