use super::common::{created, ok, parse_optional_status, ListParams, PaginatedResponse};
use crate::{
    entities::{raw_material, stock_movement, MaterialStatus},
    errors::ServiceError,
    handlers::AppState,
    services::raw_materials::{AdjustStockRequest, CreateRawMaterialRequest, StockAdjustment},
    ApiResponse, ApiResult,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

async fn create_material(
    State(state): State<AppState>,
    Json(payload): Json<CreateRawMaterialRequest>,
) -> Result<(StatusCode, Json<ApiResponse<raw_material::Model>>), ServiceError> {
    Ok(created(
        state.services.raw_materials.create_material(payload).await?,
    ))
}

async fn list_materials(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<PaginatedResponse<raw_material::Model>> {
    let status = parse_optional_status::<MaterialStatus>("status", params.status.as_deref())?;
    let page = params.page_request();
    let (materials, total) = state
        .services
        .raw_materials
        .list_materials(status, page)
        .await?;
    Ok(ok(PaginatedResponse::new(materials, page, total)))
}

async fn get_material(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<raw_material::Model> {
    Ok(ok(state.services.raw_materials.get_material(&id).await?))
}

async fn adjust_stock(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<AdjustStockRequest>,
) -> ApiResult<StockAdjustment> {
    Ok(ok(state
        .services
        .raw_materials
        .adjust_stock(&id, payload)
        .await?))
}

async fn list_movements(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<stock_movement::Model>> {
    Ok(ok(state.services.raw_materials.list_movements(&id).await?))
}

pub fn raw_material_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_material).get(list_materials))
        .route("/:id", get(get_material))
        .route("/:id/adjust", post(adjust_stock))
        .route("/:id/movements", get(list_movements))
}
