use super::common::{created, ok, parse_optional_status, parse_status, ListParams, PaginatedResponse};
use crate::{
    entities::{order, order_item, OrderStatus},
    errors::ServiceError,
    handlers::AppState,
    services::orders::{
        CreateOrderRequest, ItemSelection, OrderWithItems, RecordPaymentRequest,
        UpdateItemUnitsRequest,
    },
    ApiResponse, ApiResult,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use tracing::info;

/// Status arrives as text so that unknown values map to a 400.
#[derive(Debug, Deserialize)]
pub struct UpdateStatusBody {
    pub status: String,
}

async fn create_order(
    State(state): State<AppState>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<OrderWithItems>>), ServiceError> {
    let order = state.services.orders.create_order(payload).await?;
    info!(order_id = %order.order.id, "Order created via API");
    Ok(created(order))
}

async fn list_orders(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<PaginatedResponse<order::Model>> {
    let status = parse_optional_status::<OrderStatus>("status", params.status.as_deref())?;
    let page = params.page_request();
    let (orders, total) = state.services.orders.list_orders(status, page).await?;
    Ok(ok(PaginatedResponse::new(orders, page, total)))
}

async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<OrderWithItems> {
    Ok(ok(state.services.orders.get_order(&id).await?))
}

async fn get_order_items(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<order_item::Model>> {
    Ok(ok(state.services.orders.get_order_items(&id).await?))
}

async fn update_order_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateStatusBody>,
) -> ApiResult<OrderWithItems> {
    let status: OrderStatus = parse_status("status", &payload.status)?;
    Ok(ok(state.services.orders.update_status(&id, status).await?))
}

async fn record_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<RecordPaymentRequest>,
) -> ApiResult<order::Model> {
    Ok(ok(state
        .services
        .orders
        .record_payment(&id, payload.amount)
        .await?))
}

async fn update_item_units(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
    Json(payload): Json<UpdateItemUnitsRequest>,
) -> ApiResult<ItemSelection> {
    Ok(ok(state
        .services
        .orders
        .update_order_item_units(&item_id, payload.unit_ids)
        .await?))
}

pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_order).get(list_orders))
        .route("/:id", get(get_order))
        .route("/:id/items", get(get_order_items))
        .route("/:id/status", put(update_order_status))
        .route("/:id/payments", post(record_payment))
}

pub fn order_item_routes() -> Router<AppState> {
    Router::new().route("/:id/units", put(update_item_units))
}
