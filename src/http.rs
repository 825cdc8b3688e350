use crate::clock::Clock;
use crate::collector::CollectorStatus;
use crate::dashboard::{provider_filter, usage_since, DashboardData, DataRange, DataUsageReport, StatusReport};
use crate::error::SettingsError;
use crate::sample::local_seconds;
use crate::settings::{MonitorSettings, SettingsStore};
use crate::store::SampleStore;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct HttpState {
    pub store: SampleStore,
    pub settings: Arc<SettingsStore>,
    pub status: watch::Receiver<CollectorStatus>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Deserialize)]
struct DataQuery {
    range: Option<String>,
    provider: Option<String>,
}

#[derive(Debug, Serialize)]
struct ConfigUpdateResponse {
    success: bool,
    config: MonitorSettings,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

fn unavailable(err: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_data(State(state): State<HttpState>, Query(query): Query<DataQuery>) -> ApiResult<DashboardData> {
    let now = local_seconds(state.clock.now());
    let since = DataRange::parse(query.range.as_deref()).since(now);
    let samples = state
        .store
        .query(since, provider_filter(query.provider))
        .await
        .map_err(unavailable)?;
    Ok(Json(DashboardData::from_samples(&samples)))
}

async fn get_providers(State(state): State<HttpState>) -> ApiResult<Vec<String>> {
    let providers = state.store.list_providers().await.map_err(unavailable)?;
    Ok(Json(providers.into_iter().collect()))
}

async fn get_data_usage(State(state): State<HttpState>) -> ApiResult<DataUsageReport> {
    let since = usage_since(local_seconds(state.clock.now()));
    let usage = state.store.usage(since).await.map_err(unavailable)?;
    Ok(Json(usage.into()))
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusReport> {
    let settings = state.settings.read();
    let status = state.status.borrow().clone();
    Json(StatusReport::build(state.clock.now(), &settings, &status))
}

async fn get_config(State(state): State<HttpState>) -> Json<MonitorSettings> {
    Json(state.settings.read())
}

async fn post_config(State(state): State<HttpState>, Json(payload): Json<Value>) -> ApiResult<ConfigUpdateResponse> {
    let settings = state.settings.clone();
    let outcome = tokio::task::spawn_blocking(move || settings.update_json(&payload))
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    match outcome {
        Ok(config) => Ok(Json(ConfigUpdateResponse { success: true, config })),
        Err(SettingsError::Invalid(err)) => {
            tracing::warn!(error = %err, "rejected monitor settings update");
            Err((StatusCode::BAD_REQUEST, err.to_string()))
        }
        Err(err @ SettingsError::Persist(_)) => {
            tracing::error!(error = %format!("{err:#}"), "failed to persist monitor settings");
            Err((StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
        }
    }
}

pub fn router(state: HttpState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/data", get(get_data))
        .route("/providers", get(get_providers))
        .route("/data-usage", get(get_data_usage))
        .route("/status", get(get_status))
        .route("/config", get(get_config).post(post_config))
        .layer(cors)
        .with_state(state)
}
