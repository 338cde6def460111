use super::common::{created, ok, parse_optional_status, parse_status, ListParams, PaginatedResponse};
use crate::{
    entities::{purchase_order, PurchaseOrderStatus},
    errors::ServiceError,
    handlers::AppState,
    services::purchase_orders::{
        CreatePurchaseOrderRequest, PurchaseOrderWithItems, UpdatePurchaseOrderStatusRequest,
    },
    ApiResponse, ApiResult,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct PurchaseOrderStatusBody {
    pub status: String,
    pub delivery_rating: Option<Decimal>,
}

async fn create_purchase_order(
    State(state): State<AppState>,
    Json(payload): Json<CreatePurchaseOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<PurchaseOrderWithItems>>), ServiceError> {
    Ok(created(
        state
            .services
            .purchase_orders
            .create_purchase_order(payload)
            .await?,
    ))
}

async fn list_purchase_orders(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<PaginatedResponse<purchase_order::Model>> {
    let status =
        parse_optional_status::<PurchaseOrderStatus>("status", params.status.as_deref())?;
    let page = params.page_request();
    let (orders, total) = state
        .services
        .purchase_orders
        .list_purchase_orders(status, page)
        .await?;
    Ok(ok(PaginatedResponse::new(orders, page, total)))
}

async fn get_purchase_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<PurchaseOrderWithItems> {
    Ok(ok(state
        .services
        .purchase_orders
        .get_purchase_order(&id)
        .await?))
}

/// Approve, ship, deliver or cancel.
async fn update_purchase_order_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<PurchaseOrderStatusBody>,
) -> ApiResult<PurchaseOrderWithItems> {
    let request = UpdatePurchaseOrderStatusRequest {
        status: parse_status("status", &payload.status)?,
        delivery_rating: payload.delivery_rating,
    };
    Ok(ok(state
        .services
        .purchase_orders
        .update_status(&id, request)
        .await?))
}

pub fn purchase_order_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_purchase_order).get(list_purchase_orders))
        .route("/:id", get(get_purchase_order))
        .route("/:id/status", put(update_purchase_order_status))
}
