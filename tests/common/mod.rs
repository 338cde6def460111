#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use carpet_inventory::{
    config::AppConfig,
    db::{self, DbConfig},
    entities::{individual_product, product, raw_material, supplier, OrderItemType},
    events::{self, EventSender},
    services::{
        orders::{CreateOrderItemRequest, CreateOrderRequest, OrderWithItems},
        products::CreateProductRequest,
        raw_materials::CreateRawMaterialRequest,
        suppliers::CreateSupplierRequest,
    },
    AppState,
};
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tower::ServiceExt;

/// Fully wired application on a fresh SQLite database.
pub struct TestApp {
    pub state: AppState,
    router: Router,
    _event_task: JoinHandle<()>,
    _dir: Option<TempDir>,
}

impl TestApp {
    /// In-memory database behind a single connection.
    pub async fn new() -> Self {
        Self::build(DbConfig::in_memory_sqlite(), None).await
    }

    /// Database file in a temporary directory, shared by `connections` pooled
    /// connections so concurrent requests really overlap.
    pub async fn on_disk(connections: u32) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = DbConfig::sqlite_file(&dir.path().join("ledger.db"), connections);
        Self::build(config, Some(dir)).await
    }

    async fn build(db_config: DbConfig, dir: Option<TempDir>) -> Self {
        let pool = db::establish_connection_with_config(&db_config)
            .await
            .expect("sqlite pool");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let mut cfg = AppConfig::new(
            db_config.url.clone(),
            "127.0.0.1".to_string(),
            0,
            "test".to_string(),
        );
        cfg.settlement_worker_enabled = false;

        let (event_sender, event_rx) = EventSender::channel(cfg.event_channel_capacity);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let state = AppState::new(Arc::new(pool), cfg, event_sender);
        let router = carpet_inventory::app(state.clone());

        Self {
            state,
            router,
            _event_task: event_task,
            _dir: dir,
        }
    }

    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(json) => builder.body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    pub async fn create_product(&self, name: &str, tracked: bool, base_quantity: i32) -> product::Model {
        self.state
            .services
            .products
            .create_product(CreateProductRequest {
                name: name.to_string(),
                length: None,
                width: None,
                dimension_unit: None,
                weight: None,
                category: Some("rugs".to_string()),
                subcategory: None,
                unit_price: Decimal::new(2500, 0),
                base_quantity,
                individual_stock_tracking: tracked,
                min_stock_level: 0,
            })
            .await
            .expect("create product")
    }

    /// Creates a tracked product and produces `units` units of it.
    pub async fn product_with_units(
        &self,
        name: &str,
        units: u32,
    ) -> (product::Model, Vec<individual_product::Model>) {
        let product = self.create_product(name, true, 0).await;
        let batch = self
            .state
            .services
            .units
            .complete_production(&product.id, units, None)
            .await
            .expect("complete production");
        (product, batch.units)
    }

    pub async fn create_supplier(&self, name: &str) -> supplier::Model {
        self.state
            .services
            .suppliers
            .create_supplier(CreateSupplierRequest {
                name: name.to_string(),
                contact_email: None,
                phone: None,
            })
            .await
            .expect("create supplier")
    }

    pub async fn create_material(
        &self,
        name: &str,
        supplier_id: Option<String>,
        current_stock: Decimal,
    ) -> raw_material::Model {
        self.state
            .services
            .raw_materials
            .create_material(CreateRawMaterialRequest {
                name: name.to_string(),
                supplier_id,
                supplier_name: None,
                unit: "kg".to_string(),
                current_stock,
                min_threshold: Decimal::new(10, 0),
                max_capacity: Decimal::new(1000, 0),
                reorder_point: None,
                cost_per_unit: Decimal::new(2, 0),
            })
            .await
            .expect("create material")
    }

    pub async fn create_order(&self, items: Vec<CreateOrderItemRequest>) -> OrderWithItems {
        self.state
            .services
            .orders
            .create_order(CreateOrderRequest {
                customer_id: "CUST-1".to_string(),
                items,
                gst_rate: None,
                gst_included: None,
                discount_amount: Decimal::ZERO,
                paid_amount: Decimal::ZERO,
                notes: None,
            })
            .await
            .expect("create order")
    }
}

/// A product line priced at 100 per piece.
pub fn product_line(product_id: &str, quantity: i32, unit_ids: &[&str]) -> CreateOrderItemRequest {
    CreateOrderItemRequest {
        item_type: OrderItemType::Product,
        product_id: Some(product_id.to_string()),
        raw_material_id: None,
        item_name: None,
        quantity,
        unit_price: Decimal::new(100, 0),
        total_price: None,
        selected_unit_ids: unit_ids.iter().map(|id| id.to_string()).collect(),
    }
}

pub fn material_line(raw_material_id: &str, quantity: i32) -> CreateOrderItemRequest {
    CreateOrderItemRequest {
        item_type: OrderItemType::RawMaterial,
        product_id: None,
        raw_material_id: Some(raw_material_id.to_string()),
        item_name: None,
        quantity,
        unit_price: Decimal::new(10, 0),
        total_price: None,
        selected_unit_ids: Vec::new(),
    }
}
