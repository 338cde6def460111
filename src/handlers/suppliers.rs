use super::common::{created, ok, ListParams, PaginatedResponse};
use crate::{
    entities::supplier,
    errors::ServiceError,
    handlers::AppState,
    services::suppliers::CreateSupplierRequest,
    ApiResponse, ApiResult,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::info;

async fn create_supplier(
    State(state): State<AppState>,
    Json(payload): Json<CreateSupplierRequest>,
) -> Result<(StatusCode, Json<ApiResponse<supplier::Model>>), ServiceError> {
    let supplier = state.services.suppliers.create_supplier(payload).await?;
    info!("Supplier created: {}", supplier.id);
    Ok(created(supplier))
}

async fn list_suppliers(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<PaginatedResponse<supplier::Model>> {
    let page = params.page_request();
    let (suppliers, total) = state.services.suppliers.list_suppliers(page).await?;
    Ok(ok(PaginatedResponse::new(suppliers, page, total)))
}

async fn get_supplier(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<supplier::Model> {
    Ok(ok(state.services.suppliers.get_supplier(&id).await?))
}

pub fn supplier_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_supplier).get(list_suppliers))
        .route("/:id", get(get_supplier))
}
