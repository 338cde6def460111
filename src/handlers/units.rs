use super::common::ok;
use crate::{handlers::AppState, services::units::UnitTransition, ApiResult};
use axum::{extract::State, routing::post, Json, Router};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct OrderUnitsRequest {
    pub unit_ids: Vec<String>,
    pub order_id: String,
}

#[derive(Debug, Deserialize)]
pub struct OrderRef {
    pub order_id: String,
}

#[derive(Debug, Deserialize)]
pub struct UnitIdsRequest {
    pub unit_ids: Vec<String>,
}

async fn reserve_units(
    State(state): State<AppState>,
    Json(payload): Json<OrderUnitsRequest>,
) -> ApiResult<UnitTransition> {
    let transition = state
        .services
        .units
        .reserve(payload.unit_ids, &payload.order_id)
        .await?;
    Ok(ok(transition))
}

async fn mark_sold(
    State(state): State<AppState>,
    Json(payload): Json<OrderUnitsRequest>,
) -> ApiResult<UnitTransition> {
    let transition = state
        .services
        .units
        .mark_sold(payload.unit_ids, &payload.order_id)
        .await?;
    Ok(ok(transition))
}

async fn release_for_order(
    State(state): State<AppState>,
    Json(payload): Json<OrderRef>,
) -> ApiResult<UnitTransition> {
    Ok(ok(state.services.units.release_for_order(&payload.order_id).await?))
}

async fn release_units(
    State(state): State<AppState>,
    Json(payload): Json<UnitIdsRequest>,
) -> ApiResult<UnitTransition> {
    Ok(ok(state.services.units.release(payload.unit_ids).await?))
}

async fn mark_damaged(
    State(state): State<AppState>,
    Json(payload): Json<UnitIdsRequest>,
) -> ApiResult<UnitTransition> {
    Ok(ok(state.services.units.mark_damaged(payload.unit_ids).await?))
}

async fn mark_used(
    State(state): State<AppState>,
    Json(payload): Json<UnitIdsRequest>,
) -> ApiResult<UnitTransition> {
    Ok(ok(state.services.units.mark_used(payload.unit_ids).await?))
}

pub fn unit_routes() -> Router<AppState> {
    Router::new()
        .route("/reserve", post(reserve_units))
        .route("/sold", post(mark_sold))
        .route("/release", post(release_units))
        .route("/release-order", post(release_for_order))
        .route("/damaged", post(mark_damaged))
        .route("/used", post(mark_used))
}
