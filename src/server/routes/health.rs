use crate::{server::AppState, storage::StorageStatus};
use axum::{extract::State, response::Json};
use serde::Serialize;
use serde_json::{json, Value};

pub async fn root() -> Json<Value> {
    Json(json!({ "status": "Proxy service is running" }))
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub service: &'static str,
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub storage_limit_bytes: u64,
    pub served_files: u64,
    pub blacklisted_urls: usize,
    pub in_flight_downloads: usize,
    pub storage: Option<StorageStatus>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    let proxy = &state.proxy;

    let storage = match proxy.storage().status().await {
        Ok(status) => Some(status),
        Err(e) => {
            log::warn!("Could not measure media cache: {e:#}");
            None
        }
    };

    Json(HealthReport {
        service: "media-proxy",
        status: "healthy",
        uptime_seconds: state.started_at.elapsed().as_secs(),
        storage_limit_bytes: proxy.settings().storage_limit_bytes,
        served_files: proxy.served_count(),
        blacklisted_urls: proxy.blacklist().len().await,
        in_flight_downloads: proxy.downloads().in_flight_count(),
        storage,
    })
}
