use crate::{error::ProxyError, server::AppState};
use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

#[derive(Deserialize)]
pub struct MediaQuery {
    url: Option<String>,
}

pub async fn proxy_media(
    State(state): State<AppState>,
    Query(query): Query<MediaQuery>,
    headers: HeaderMap,
) -> Response {
    match state.proxy.get_media(query.url.as_deref(), &headers).await {
        Ok(response) => response,
        Err(e) => {
            match &e {
                ProxyError::Storage(_) => log::error!("Failed to serve media: {e}"),
                ProxyError::Upstream { .. } | ProxyError::UnsupportedMedia { .. } => {
                    log::warn!("Failed to proxy media: {e}")
                }
                _ => log::debug!("Rejected media request: {e}"),
            }
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::MediaCacheSettings;
    use crate::proxy::MediaProxyService;
    use crate::server::{router, AppState};
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use std::sync::Arc;
    use tempfile::tempdir;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_missing_url_is_bad_request() {
        let dir = tempdir().unwrap();
        let proxy = MediaProxyService::new(MediaCacheSettings::new(dir.path()))
            .await
            .unwrap();
        let app = router(AppState::new(Arc::new(proxy)));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/proxy/media")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"URL parameter is required.");
    }

    #[tokio::test]
    async fn test_cors_preflight_allows_range() {
        let dir = tempdir().unwrap();
        let proxy = MediaProxyService::new(MediaCacheSettings::new(dir.path()))
            .await
            .unwrap();
        let app = router(AppState::new(Arc::new(proxy)));

        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/proxy/media?url=x")
                    .header(header::ORIGIN, "https://app.example")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                    .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "range")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
    }
}
