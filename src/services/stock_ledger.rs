//! Derived stock counters.
//!
//! `products.current_stock`, `products.individual_products_count`, `products.status` and
//! `raw_materials.status` are only ever written from here.

use crate::entities::{
    individual_product, product, MaterialStatus, ProductStatus, UnitStatus,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::ServiceContext;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QuerySelect, Set,
};
use serde::Serialize;
use tracing::{debug, instrument};

/// `out-of-stock` at or below zero, `low-stock` at or below the threshold,
/// `overstock` above capacity, `in-stock` otherwise.
pub fn recompute_material_status(
    current_stock: Decimal,
    min_threshold: Decimal,
    max_capacity: Decimal,
) -> MaterialStatus {
    if current_stock <= Decimal::ZERO {
        MaterialStatus::OutOfStock
    } else if current_stock <= min_threshold {
        MaterialStatus::LowStock
    } else if current_stock > max_capacity {
        MaterialStatus::Overstock
    } else {
        MaterialStatus::InStock
    }
}

/// Unit counts of one product, per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnitCounts {
    pub available: i64,
    pub reserved: i64,
    pub sold: i64,
    pub used: i64,
    pub damaged: i64,
}

impl UnitCounts {
    pub fn total(&self) -> i64 {
        self.available + self.reserved + self.sold + self.used + self.damaged
    }

    fn add(&mut self, status: UnitStatus, count: i64) {
        match status {
            UnitStatus::Available => self.available += count,
            UnitStatus::Reserved => self.reserved += count,
            UnitStatus::Sold => self.sold += count,
            UnitStatus::Used => self.used += count,
            UnitStatus::Damaged => self.damaged += count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductStockSnapshot {
    pub product_id: String,
    pub current_stock: i32,
    pub individual_products_count: i32,
    pub status: ProductStatus,
    pub counts: UnitCounts,
    #[serde(skip)]
    pub previous_status: ProductStatus,
}

impl ProductStockSnapshot {
    /// True when this recompute moved the product into a restock band.
    pub fn entered_low_stock(&self) -> bool {
        self.status != self.previous_status
            && matches!(self.status, ProductStatus::LowStock | ProductStatus::OutOfStock)
    }
}

/// Counts units of `product_id` grouped by status.
pub async fn count_units<C>(conn: &C, product_id: &str) -> Result<UnitCounts, ServiceError>
where
    C: ConnectionTrait,
{
    let rows: Vec<(UnitStatus, i64)> = individual_product::Entity::find()
        .select_only()
        .column(individual_product::Column::Status)
        .column_as(individual_product::Column::Id.count(), "count")
        .filter(individual_product::Column::ProductId.eq(product_id))
        .group_by(individual_product::Column::Status)
        .into_tuple()
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    let mut counts = UnitCounts::default();
    for (status, count) in rows {
        counts.add(status, count);
    }
    Ok(counts)
}

/// Rewrites the derived counters of one product from its live unit set. Idempotent.
pub async fn recompute_product_stock<C>(
    conn: &C,
    product_id: &str,
) -> Result<ProductStockSnapshot, ServiceError>
where
    C: ConnectionTrait,
{
    let product = product::Entity::find_by_id(product_id.to_string())
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;

    let counts = count_units(conn, product_id).await?;

    let current_stock = if product.individual_stock_tracking {
        i32::try_from(counts.available).unwrap_or(i32::MAX)
    } else {
        product.base_quantity
    };
    let individual_products_count = i32::try_from(counts.total()).unwrap_or(i32::MAX);
    let status = ProductStatus::from_levels(current_stock, product.min_stock_level);
    let previous_status = product.status;

    if product.current_stock != current_stock
        || product.individual_products_count != individual_products_count
        || product.status != status
    {
        let mut active: product::ActiveModel = product.into();
        active.current_stock = Set(current_stock);
        active.individual_products_count = Set(individual_products_count);
        active.status = Set(status);
        active.update(conn).await.map_err(ServiceError::db_error)?;
    }

    debug!(
        product_id,
        current_stock, individual_products_count, %status, "Recomputed product stock"
    );

    Ok(ProductStockSnapshot {
        product_id: product_id.to_string(),
        current_stock,
        individual_products_count,
        status,
        counts,
        previous_status,
    })
}

/// Recomputes every product in `product_ids` once.
pub async fn recompute_products<C, I>(
    conn: &C,
    product_ids: I,
) -> Result<Vec<ProductStockSnapshot>, ServiceError>
where
    C: ConnectionTrait,
    I: IntoIterator<Item = String>,
{
    let mut snapshots = Vec::new();
    for product_id in crate::services::dedup_ids(product_ids) {
        snapshots.push(recompute_product_stock(conn, &product_id).await?);
    }
    Ok(snapshots)
}

/// Publishes a low-stock notification for each snapshot that crossed into a restock band.
pub fn notify_low_stock(events: &EventSender, snapshots: &[ProductStockSnapshot]) {
    for snapshot in snapshots.iter().filter(|s| s.entered_low_stock()) {
        events.publish(Event::ProductLowStock {
            product_id: snapshot.product_id.clone(),
            current_stock: snapshot.current_stock,
            status: snapshot.status,
        });
    }
}

#[derive(Clone, Debug)]
pub struct StockLedger {
    ctx: ServiceContext,
}

impl StockLedger {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self))]
    pub async fn recompute(&self, product_id: &str) -> Result<ProductStockSnapshot, ServiceError> {
        let product_id = product_id.to_string();
        let snapshot = self
            .ctx
            .transaction(move |txn| {
                Box::pin(async move { recompute_product_stock(txn, &product_id).await })
            })
            .await?;
        notify_low_stock(&self.ctx.events, std::slice::from_ref(&snapshot));
        Ok(snapshot)
    }
}
