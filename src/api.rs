use crate::error::ServiceError;
use crate::models::{CampaignMessage, CampaignType, DeviceType};
use crate::retry_queue::RetryStats;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/push_retries/stats", get(retry_stats))
        .route("/api/v1/push_retries", delete(cancel_retries))
        .route("/api/v1/campaigns", post(enqueue_campaign))
        .route("/api/v1/campaigns/{campaign_guid}", get(campaigns_by_guid))
        .route(
            "/api/v1/campaigns/{campaign_guid}/results",
            get(campaign_results),
        )
        .route("/api/v1/push_test", post(push_test))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn retry_stats(State(state): State<Arc<AppState>>) -> Json<RetryStats> {
    Json(state.engine.queue().stats())
}

#[derive(Deserialize)]
struct CancelQuery {
    /// Number of oldest pending retries to cancel; absent means all.
    count: Option<usize>,
}

async fn cancel_retries(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CancelQuery>,
) -> impl IntoResponse {
    let cancelled = state.engine.queue().cancel(query.count);
    info!(cancelled, requested = ?query.count, "Cancelled retries via API");
    Json(json!({ "cancelled_count": cancelled }))
}

/// Local stand-in for the broker bridge: accepts one raw campaign message
/// and hands it to the ingest loop.
async fn enqueue_campaign(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    state
        .ingest_tx
        .send(body.to_vec())
        .await
        .map_err(|_| ServiceError::Internal("ingest channel closed".to_string()))?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))))
}

#[derive(Deserialize)]
struct CampaignFilter {
    device_type: Option<DeviceType>,
    campaign_type: Option<CampaignType>,
}

async fn campaigns_by_guid(
    State(state): State<Arc<AppState>>,
    Path(campaign_guid): Path<String>,
    Query(filter): Query<CampaignFilter>,
) -> Result<impl IntoResponse, ServiceError> {
    let campaigns = state
        .store
        .campaigns_by_guid(&campaign_guid, filter.device_type, filter.campaign_type)
        .await?;
    Ok(Json(json!({
        "campaign_guid": campaign_guid,
        "count": campaigns.len(),
        "campaigns": campaigns,
    })))
}

async fn campaign_results(
    State(state): State<Arc<AppState>>,
    Path(campaign_guid): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let results = state.store.results_by_guid(&campaign_guid).await?;
    let success_count = results.iter().filter(|r| r.was_success).count();
    Ok(Json(json!({
        "campaign_guid": campaign_guid,
        "total": results.len(),
        "success_count": success_count,
        "failure_count": results.len() - success_count,
        "results": results,
    })))
}

#[derive(Deserialize)]
struct PushTestRequest {
    token: String,
    device_type: String,
    #[serde(default)]
    certificate: serde_json::Value,
    certificate_password: Option<String>,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Sends a one-off notification through the normal dispatch path under a
/// generated `test-` guid, so results land in the store like any campaign.
async fn push_test(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PushTestRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let campaign_guid = format!("test-{}", Uuid::new_v4());
    let message = CampaignMessage {
        campaign_guid: campaign_guid.clone(),
        token: request.token,
        device_type: request.device_type,
        campaign_type: "push".to_string(),
        credentials: crate::models::CampaignCredentials {
            certificate: request.certificate,
            certificate_password: request.certificate_password,
        },
        payload: request.payload,
    };

    let campaign = message.into_campaign()?;
    state.store.save_campaign(&campaign).await?;
    state.engine.dispatch(campaign);

    info!(campaign_guid = %campaign_guid, "Dispatched test push");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "campaign_guid": campaign_guid })),
    ))
}
