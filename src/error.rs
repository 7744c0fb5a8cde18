use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Outcome of a failed `GetMedia` call.
///
/// Cloneable because a single origin fetch is shared by every coalesced waiter, and all of them
/// must observe the same failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0} has been blacklisted due to previous errors or invalid content type")]
    Blacklisted(String),
    #[error("invalid media type {content_type:?} from {url}")]
    UnsupportedMedia { url: String, content_type: String },
    #[error("{url} - {reason}")]
    Upstream { url: String, reason: String },
    #[error("requested range not satisfiable for a {length} byte file")]
    RangeNotSatisfiable { length: u64 },
    #[error("storage failure: {0}")]
    Storage(String),
}

impl ProxyError {
    pub fn upstream(url: &str, reason: impl Into<String>) -> Self {
        ProxyError::Upstream {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) | ProxyError::Blacklisted(_) => StatusCode::BAD_REQUEST,
            ProxyError::UnsupportedMedia { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ProxyError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            ProxyError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), self.to_string()).into_response();

        if let ProxyError::RangeNotSatisfiable { length } = self {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{length}")) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::InvalidRequest("URL parameter is required.".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::Blacklisted("https://a.example/x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::UnsupportedMedia {
                url: "https://a.example/x".into(),
                content_type: "text/html".into()
            }
            .status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            ProxyError::upstream("https://a.example/x", "HTTP error: 404 Not Found").status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::RangeNotSatisfiable { length: 10 }.status(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
    }

    #[test]
    fn test_range_error_carries_content_range() {
        let response = ProxyError::RangeNotSatisfiable { length: 1000 }.into_response();

        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes */1000"
        );
    }
}
