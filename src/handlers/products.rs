use super::common::{created, ok, parse_optional_status, ListParams, PaginatedResponse};
use crate::{
    entities::{individual_product, product, ProductStatus, UnitStatus},
    errors::ServiceError,
    handlers::AppState,
    services::{
        products::CreateProductRequest,
        stock_ledger::ProductStockSnapshot,
        units::{ProductionBatch, ProductionRequest},
    },
    ApiResponse, ApiResult,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct UnitFilter {
    pub status: Option<String>,
}

async fn create_product(
    State(state): State<AppState>,
    Json(payload): Json<CreateProductRequest>,
) -> Result<(StatusCode, Json<ApiResponse<product::Model>>), ServiceError> {
    let product = state.services.products.create_product(payload).await?;
    Ok(created(product))
}

async fn list_products(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<PaginatedResponse<product::Model>> {
    let status = parse_optional_status::<ProductStatus>("status", params.status.as_deref())?;
    let page = params.page_request();
    let (products, total) = state.services.products.list_products(status, page).await?;
    Ok(ok(PaginatedResponse::new(products, page, total)))
}

async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<product::Model> {
    Ok(ok(state.services.products.get_product(&id).await?))
}

/// Registers freshly produced units.
async fn complete_production(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<ProductionRequest>,
) -> Result<(StatusCode, Json<ApiResponse<ProductionBatch>>), ServiceError> {
    let batch = state
        .services
        .units
        .complete_production(&id, payload.quantity, payload.notes)
        .await?;
    Ok(created(batch))
}

async fn recompute_stock(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ProductStockSnapshot> {
    Ok(ok(state.services.products.recompute_stock(&id).await?))
}

async fn list_units(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(filter): Query<UnitFilter>,
) -> ApiResult<Vec<individual_product::Model>> {
    let status = parse_optional_status::<UnitStatus>("status", filter.status.as_deref())?;
    // 404 for an unknown product rather than an empty list.
    state.services.products.get_product(&id).await?;
    Ok(ok(state.services.units.list_units(&id, status).await?))
}

pub fn product_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_product).get(list_products))
        .route("/:id", get(get_product))
        .route("/:id/production", post(complete_production))
        .route("/:id/recompute", post(recompute_stock))
        .route("/:id/units", get(list_units))
}
