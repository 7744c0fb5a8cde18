use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use media_proxy::server::{router, AppState};
use media_proxy::{cache_key, MediaCacheSettings, MediaProxyService, ProxyError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn png_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend((0..len - bytes.len()).map(|x| (x % 251) as u8));
    bytes
}

fn settings(dir: &Path) -> MediaCacheSettings {
    let mut settings = MediaCacheSettings::new(dir);
    settings.allow_private_origins = true;
    settings
}

async fn app(settings: MediaCacheSettings) -> (Router, Arc<MediaProxyService>) {
    let proxy = Arc::new(MediaProxyService::new(settings).await.unwrap());
    (router(AppState::new(proxy.clone())), proxy)
}

fn media_request(url: &str) -> axum::http::request::Builder {
    let encoded: String = url::form_urlencoded::byte_serialize(url.as_bytes()).collect();
    Request::builder().uri(format!("/api/proxy/media?url={encoded}"))
}

async fn send(app: &Router, request: axum::http::request::Builder) -> Response {
    app.clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_of(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn mount_png(server: &MockServer, route: &str, body: Vec<u8>, hits: u64) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "image/png"))
        .expect(hits)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_repeat_requests_are_served_from_cache() {
    let origin = MockServer::start().await;
    mount_png(&origin, "/cat.png", png_bytes(1000), 1).await;

    let dir = tempdir().unwrap();
    let (app, proxy) = app(settings(dir.path())).await;
    let url = format!("{}/cat.png", origin.uri());

    let first = send(&app, media_request(&url)).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()[header::CONTENT_TYPE], "image/png");
    assert_eq!(
        first.headers()[header::CACHE_CONTROL],
        "public, max-age=31536000"
    );
    let etag = first.headers()[header::ETAG].to_str().unwrap().to_string();
    assert_eq!(body_of(first).await, png_bytes(1000));

    let second = send(&app, media_request(&url)).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()[header::ETAG], etag.as_str());
    assert_eq!(body_of(second).await, png_bytes(1000));

    let cached = cache_key::cache_path(dir.path(), &url);
    assert_eq!(std::fs::read(cached).unwrap(), png_bytes(1000));
    assert_eq!(proxy.served_count(), 2);
}

#[tokio::test]
async fn test_conditional_and_range_requests() {
    let origin = MockServer::start().await;
    mount_png(&origin, "/clip.png", png_bytes(1000), 1).await;

    let dir = tempdir().unwrap();
    let (app, _) = app(settings(dir.path())).await;
    let url = format!("{}/clip.png", origin.uri());

    // a narrow range on a miss still caches the whole file
    let partial = send(&app, media_request(&url).header(header::RANGE, "bytes=10-19")).await;
    assert_eq!(partial.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(partial.headers()[header::CONTENT_RANGE], "bytes 10-19/1000");
    let etag = partial.headers()[header::ETAG].to_str().unwrap().to_string();
    assert_eq!(body_of(partial).await, png_bytes(1000)[10..20].to_vec());

    let not_modified = send(
        &app,
        media_request(&url).header(header::IF_NONE_MATCH, etag.as_str()),
    )
    .await;
    assert_eq!(not_modified.status(), StatusCode::NOT_MODIFIED);
    assert!(body_of(not_modified).await.is_empty());

    let unsatisfiable = send(&app, media_request(&url).header(header::RANGE, "bytes=5000-")).await;
    assert_eq!(unsatisfiable.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(unsatisfiable.headers()[header::CONTENT_RANGE], "bytes */1000");
}

#[tokio::test]
async fn test_missing_url_parameter() {
    let dir = tempdir().unwrap();
    let (app, _) = app(settings(dir.path())).await;

    let response = send(&app, Request::builder().uri("/api/proxy/media")).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_of(response).await, b"URL parameter is required.".to_vec());
}

#[tokio::test]
async fn test_blacklist_survives_restart() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"))
        .expect(1)
        .mount(&origin)
        .await;

    let dir = tempdir().unwrap();
    let url = format!("{}/page", origin.uri());

    {
        let (app, _) = app(settings(dir.path())).await;
        let response = send(&app, media_request(&url)).await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    let (app, proxy) = app(settings(dir.path())).await;
    assert!(proxy.blacklist().is_blacklisted(&url).await);

    let response = send(&app, media_request(&url)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(!cache_key::cache_path(dir.path(), &url).exists());
}

#[tokio::test]
async fn test_concurrent_requests_share_one_download() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/big.png"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(png_bytes(4096), "image/png")
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&origin)
        .await;

    let dir = tempdir().unwrap();
    let (_, proxy) = app(settings(dir.path())).await;
    let url = format!("{}/big.png", origin.uri());

    let requests = (0..6).map(|_| {
        let proxy = proxy.clone();
        let url = url.clone();
        tokio::spawn(async move {
            let response = proxy
                .get_media(Some(&url), &axum::http::HeaderMap::new())
                .await?;
            Ok::<_, ProxyError>(body_of(response).await)
        })
    });

    for body in futures::future::join_all(requests).await {
        assert_eq!(body.unwrap().unwrap(), png_bytes(4096));
    }
    assert_eq!(proxy.downloads().in_flight_count(), 0);
}

#[tokio::test]
async fn test_metadata_is_reported_after_download() {
    let origin = MockServer::start().await;
    let main = MockServer::start().await;

    let png = {
        let dir = tempdir().unwrap();
        let file = dir.path().join("tiny.png");
        image::RgbImage::new(4, 3).save(&file).unwrap();
        std::fs::read(file).unwrap()
    };
    mount_png(&origin, "/tiny.png", png.clone(), 1).await;
    Mock::given(method("POST"))
        .and(path("/api/media"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&main)
        .await;

    let dir = tempdir().unwrap();
    let mut settings = settings(dir.path());
    settings.main_server_url = Some(main.uri());
    let (app, _) = app(settings).await;

    let url = format!("{}/tiny.png", origin.uri());
    let response = send(&app, media_request(&url)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut reported = None;
    for _ in 0..100 {
        if let Some(request) = main.received_requests().await.unwrap_or_default().pop() {
            reported = Some(request);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let body: serde_json::Value = reported.expect("metadata callback").body_json().unwrap();
    assert_eq!(body["url"], url.as_str());
    assert_eq!(body["isImage"], true);
    assert_eq!(body["fileName"], "tiny.png");
    assert_eq!(body["fileSize"], png.len() as u64);
    assert_eq!(body["width"], 4);
    assert_eq!(body["height"], 3);
}

#[tokio::test]
async fn test_health_reports_counters() {
    let origin = MockServer::start().await;
    mount_png(&origin, "/a.png", png_bytes(100), 1).await;

    let dir = tempdir().unwrap();
    let (app, _) = app(settings(dir.path())).await;
    send(&app, media_request(&format!("{}/a.png", origin.uri()))).await;

    let response = send(&app, Request::builder().uri("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body_of(response).await).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["servedFiles"], 1);
    assert_eq!(health["storage"]["folderSizeBytes"], 100);
}
