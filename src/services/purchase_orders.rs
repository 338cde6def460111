use crate::entities::order::round_money;
use crate::entities::{
    purchase_order, purchase_order_item, raw_material, supplier, MaterialStatus, MovementType,
    PurchaseOrderStatus,
};
use crate::errors::ServiceError;
use crate::events::Event;
use crate::services::raw_materials::{
    apply_movement, next_material_status, notify_material_movement, AppliedMovement,
    MovementDraft,
};
use crate::services::sequence::{IdKind, SequenceService};
use crate::services::suppliers::updated_rating;
use crate::services::{ensure_non_negative, PageRequest, ServiceContext};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::sea_query::Condition;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Rating recorded for a delivery when the caller gives none.
pub const DEFAULT_DELIVERY_RATING: Decimal = dec!(5.0);
const MAX_DELIVERY_RATING: Decimal = dec!(5);

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreatePurchaseOrderRequest {
    pub supplier_id: Option<String>,
    pub supplier_name: Option<String>,
    #[validate(length(min = 1, message = "Purchase order must contain at least one item"))]
    pub items: Vec<CreatePurchaseOrderItemRequest>,
    pub expected_delivery: Option<DateTime<Utc>>,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
    /// `draft` (default) or `pending`.
    pub status: Option<PurchaseOrderStatus>,
}

/// A line names its material by id, or by name among the supplier's materials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePurchaseOrderItemRequest {
    pub raw_material_id: Option<String>,
    pub material_name: Option<String>,
    pub quantity: Decimal,
    pub unit_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePurchaseOrderStatusRequest {
    pub status: PurchaseOrderStatus,
    /// 0 to 5; only used on delivery.
    pub delivery_rating: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseOrderWithItems {
    #[serde(flatten)]
    pub purchase_order: purchase_order::Model,
    pub items: Vec<purchase_order_item::Model>,
}

fn validate_rating(rating: Decimal) -> Result<(), ServiceError> {
    if rating < Decimal::ZERO || rating > MAX_DELIVERY_RATING {
        return Err(ServiceError::ValidationError(
            "delivery_rating must be between 0 and 5".to_string(),
        ));
    }
    Ok(())
}

/// True when moving `from -> to` puts the ordered materials on the road.
fn enters_transit(from: PurchaseOrderStatus, to: PurchaseOrderStatus) -> bool {
    matches!(from, PurchaseOrderStatus::Draft | PurchaseOrderStatus::Pending)
        && matches!(to, PurchaseOrderStatus::Approved | PurchaseOrderStatus::Shipped)
}

async fn materials_of<C>(
    conn: &C,
    items: &[purchase_order_item::Model],
) -> Result<Vec<raw_material::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    let ids: Vec<String> = crate::services::dedup_ids(items.iter().map(|i| i.raw_material_id.clone()));
    raw_material::Entity::find()
        .filter(raw_material::Column::Id.is_in(ids))
        .lock_exclusive()
        .all(conn)
        .await
        .map_err(ServiceError::db_error)
}

async fn mark_in_transit<C>(conn: &C, items: &[purchase_order_item::Model]) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    for material in materials_of(conn, items).await? {
        if material.status == MaterialStatus::InTransit {
            continue;
        }
        let mut active: raw_material::ActiveModel = material.into();
        active.status = Set(MaterialStatus::InTransit);
        active.update(conn).await.map_err(ServiceError::db_error)?;
    }
    Ok(())
}

/// Drops the `in-transit` overlay, deriving the status from stock again.
async fn clear_in_transit<C>(conn: &C, items: &[purchase_order_item::Model]) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    for material in materials_of(conn, items).await? {
        if material.status != MaterialStatus::InTransit {
            continue;
        }
        let status = next_material_status(&material, material.current_stock, false);
        let mut active: raw_material::ActiveModel = material.into();
        active.status = Set(status);
        active.update(conn).await.map_err(ServiceError::db_error)?;
    }
    Ok(())
}

/// Receives every line and rates the supplier.
async fn receive_delivery<C>(
    conn: &C,
    purchase_order: &purchase_order::Model,
    items: Vec<purchase_order_item::Model>,
    movement_ids: Vec<String>,
    rating: Decimal,
) -> Result<Vec<AppliedMovement>, ServiceError>
where
    C: ConnectionTrait,
{
    let mut applied = Vec::with_capacity(items.len());
    for (item, movement_id) in items.into_iter().zip(movement_ids) {
        let material = raw_material::Entity::find_by_id(item.raw_material_id.clone())
            .lock_exclusive()
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Raw material {} not found", item.raw_material_id))
            })?;
        let draft = MovementDraft {
            unit_cost: Some(item.unit_price),
            reason: Some("Purchase order delivered".to_string()),
            preserve_in_transit: false,
            ..MovementDraft::new(MovementType::In, item.quantity)
                .reference("purchase_order", &purchase_order.id)
        };
        applied.push(apply_movement(conn, material, movement_id, draft).await?);
    }

    match supplier::Entity::find_by_id(purchase_order.supplier_id.clone())
        .lock_exclusive()
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
    {
        Some(found) => {
            let rating = updated_rating(found.rating, found.total_orders, rating);
            let total_orders = found.total_orders + 1;
            let mut active: supplier::ActiveModel = found.into();
            active.rating = Set(rating);
            active.total_orders = Set(total_orders);
            active.update(conn).await.map_err(ServiceError::db_error)?;
        }
        None => warn!(
            supplier_id = %purchase_order.supplier_id,
            "Supplier of delivered purchase order not found; rating unchanged"
        ),
    }
    Ok(applied)
}

#[derive(Clone, Debug)]
pub struct PurchaseOrderService {
    ctx: ServiceContext,
    sequence: SequenceService,
}

impl PurchaseOrderService {
    pub fn new(ctx: ServiceContext, sequence: SequenceService) -> Self {
        Self { ctx, sequence }
    }

    async fn resolve_supplier(
        &self,
        supplier_id: Option<&str>,
        supplier_name: Option<&str>,
    ) -> Result<supplier::Model, ServiceError> {
        let db = self.ctx.db.clone();
        let found = self
            .ctx
            .bounded(async {
                let query = match (supplier_id, supplier_name) {
                    (Some(id), _) => supplier::Entity::find_by_id(id.to_string()),
                    (None, Some(name)) => {
                        supplier::Entity::find().filter(supplier::Column::Name.eq(name))
                    }
                    (None, None) => {
                        return Err(ServiceError::ValidationError(
                            "supplier_id or supplier_name is required".to_string(),
                        ))
                    }
                };
                query.one(db.as_ref()).await.map_err(ServiceError::db_error)
            })
            .await?;

        found.ok_or_else(|| {
            ServiceError::ValidationError(format!(
                "unknown supplier {}",
                supplier_id.or(supplier_name).unwrap_or_default()
            ))
        })
    }

    /// Resolves a line to exactly one raw material.
    async fn resolve_material(
        &self,
        line: usize,
        request: &CreatePurchaseOrderItemRequest,
        supplier: &supplier::Model,
    ) -> Result<raw_material::Model, ServiceError> {
        let db = self.ctx.db.clone();
        if let Some(id) = request.raw_material_id.as_deref() {
            return self
                .ctx
                .bounded(async {
                    raw_material::Entity::find_by_id(id.to_string())
                        .one(db.as_ref())
                        .await
                        .map_err(ServiceError::db_error)
                })
                .await?
                .ok_or_else(|| {
                    ServiceError::ValidationError(format!(
                        "item {}: unknown raw material {}",
                        line, id
                    ))
                });
        }

        let name = request.material_name.as_deref().ok_or_else(|| {
            ServiceError::ValidationError(format!(
                "item {}: raw_material_id or material_name is required",
                line
            ))
        })?;
        let mut matches = self
            .ctx
            .bounded(async {
                raw_material::Entity::find()
                    .filter(raw_material::Column::Name.eq(name))
                    .filter(
                        Condition::any()
                            .add(raw_material::Column::SupplierId.eq(supplier.id.as_str()))
                            .add(raw_material::Column::SupplierName.eq(supplier.name.as_str())),
                    )
                    .all(db.as_ref())
                    .await
                    .map_err(ServiceError::db_error)
            })
            .await?;

        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(ServiceError::ValidationError(format!(
                "item {}: no raw material named {} from supplier {}",
                line, name, supplier.name
            ))),
            n => Err(ServiceError::ValidationError(format!(
                "item {}: {} raw materials named {} from supplier {}; use raw_material_id",
                line, n, name, supplier.name
            ))),
        }
    }

    #[instrument(skip(self, request))]
    pub async fn create_purchase_order(
        &self,
        request: CreatePurchaseOrderRequest,
    ) -> Result<PurchaseOrderWithItems, ServiceError> {
        request.validate()?;
        let status = request.status.unwrap_or(PurchaseOrderStatus::Draft);
        if !matches!(status, PurchaseOrderStatus::Draft | PurchaseOrderStatus::Pending) {
            return Err(ServiceError::ValidationError(
                "a purchase order starts as draft or pending".to_string(),
            ));
        }
        let supplier = self
            .resolve_supplier(
                request.supplier_id.as_deref(),
                request.supplier_name.as_deref(),
            )
            .await?;

        let id = self.sequence.next(IdKind::PurchaseOrder).await;
        let mut lines = Vec::with_capacity(request.items.len());
        for (index, item) in request.items.iter().enumerate() {
            let line = index + 1;
            if item.quantity <= Decimal::ZERO {
                return Err(ServiceError::ValidationError(format!(
                    "item {}: quantity must be greater than zero",
                    line
                )));
            }
            ensure_non_negative("unit_price", item.unit_price)?;
            let material = self.resolve_material(line, item, &supplier).await?;
            lines.push(purchase_order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                purchase_order_id: Set(id.clone()),
                raw_material_id: Set(material.id),
                material_name: Set(material.name),
                quantity: Set(item.quantity),
                unit_price: Set(item.unit_price),
                total_price: Set(round_money(item.quantity * item.unit_price)),
            });
        }
        let total_amount = round_money(
            request
                .items
                .iter()
                .map(|i| i.quantity * i.unit_price)
                .sum(),
        );

        let now = Utc::now();
        let header = purchase_order::ActiveModel {
            id: Set(id),
            supplier_id: Set(supplier.id.clone()),
            supplier_name: Set(supplier.name.clone()),
            status: Set(status),
            total_amount: Set(total_amount),
            expected_delivery: Set(request.expected_delivery),
            delivery_rating: Set(None),
            notes: Set(request.notes),
            approved_at: Set(None),
            shipped_at: Set(None),
            delivered_at: Set(None),
            cancelled_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let (purchase_order, items) = self
            .ctx
            .transaction(move |txn| {
                Box::pin(async move {
                    let purchase_order =
                        header.insert(txn).await.map_err(ServiceError::from_write)?;
                    let mut items = Vec::with_capacity(lines.len());
                    for line in lines {
                        items.push(line.insert(txn).await.map_err(ServiceError::from_write)?);
                    }
                    Ok((purchase_order, items))
                })
            })
            .await?;

        info!(
            purchase_order_id = %purchase_order.id,
            supplier = %purchase_order.supplier_name,
            total_amount = %purchase_order.total_amount,
            "Purchase order created"
        );
        Ok(PurchaseOrderWithItems {
            purchase_order,
            items,
        })
    }

    #[instrument(skip(self))]
    pub async fn get_purchase_order(&self, id: &str) -> Result<PurchaseOrderWithItems, ServiceError> {
        let db = self.ctx.db.clone();
        self.ctx
            .bounded(async {
                let purchase_order = purchase_order::Entity::find_by_id(id.to_string())
                    .one(db.as_ref())
                    .await
                    .map_err(ServiceError::db_error)?
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!("Purchase order {} not found", id))
                    })?;
                let items = purchase_order_item::Entity::find()
                    .filter(purchase_order_item::Column::PurchaseOrderId.eq(id))
                    .all(db.as_ref())
                    .await
                    .map_err(ServiceError::db_error)?;
                Ok(PurchaseOrderWithItems {
                    purchase_order,
                    items,
                })
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn list_purchase_orders(
        &self,
        status: Option<PurchaseOrderStatus>,
        page: PageRequest,
    ) -> Result<(Vec<purchase_order::Model>, u64), ServiceError> {
        let db = self.ctx.db.clone();
        self.ctx
            .bounded(async {
                let mut query = purchase_order::Entity::find();
                if let Some(status) = status {
                    query = query.filter(purchase_order::Column::Status.eq(status));
                }
                let paginator = query
                    .order_by_desc(purchase_order::Column::CreatedAt)
                    .paginate(db.as_ref(), page.per_page);
                let total = paginator.num_items().await.map_err(ServiceError::db_error)?;
                let orders = paginator
                    .fetch_page(page.index())
                    .await
                    .map_err(ServiceError::db_error)?;
                Ok((orders, total))
            })
            .await
    }

    /// Approve, ship, deliver or cancel. Delivery restocks every line, appends the
    /// stock movements and rates the supplier in one transaction.
    #[instrument(skip(self, request), fields(status = %request.status))]
    pub async fn update_status(
        &self,
        id: &str,
        request: UpdatePurchaseOrderStatusRequest,
    ) -> Result<PurchaseOrderWithItems, ServiceError> {
        let current = self.get_purchase_order(id).await?;
        let old_status = current.purchase_order.status;
        let new_status = request.status;
        if old_status == new_status {
            return Ok(current);
        }
        old_status
            .check_transition(new_status)
            .map_err(ServiceError::ValidationError)?;
        let rating = request.delivery_rating.unwrap_or(DEFAULT_DELIVERY_RATING);
        validate_rating(rating)?;

        let movement_ids = if new_status == PurchaseOrderStatus::Delivered {
            self.sequence
                .next_many(IdKind::StockMovement, current.items.len())
                .await
        } else {
            Vec::new()
        };

        let po_id = current.purchase_order.id.clone();
        let applied = self
            .ctx
            .transaction(move |txn| {
                Box::pin(async move {
                    let purchase_order = purchase_order::Entity::find_by_id(po_id.clone())
                        .lock_exclusive()
                        .one(txn)
                        .await
                        .map_err(ServiceError::db_error)?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!("Purchase order {} not found", po_id))
                        })?;
                    let from = purchase_order.status;
                    if from == new_status {
                        return Ok(Vec::new());
                    }
                    from.check_transition(new_status)
                        .map_err(ServiceError::ValidationError)?;

                    let items = purchase_order_item::Entity::find()
                        .filter(purchase_order_item::Column::PurchaseOrderId.eq(po_id.as_str()))
                        .all(txn)
                        .await
                        .map_err(ServiceError::db_error)?;

                    let mut applied = Vec::new();
                    if enters_transit(from, new_status) {
                        mark_in_transit(txn, &items).await?;
                    }
                    match new_status {
                        PurchaseOrderStatus::Delivered => {
                            applied = receive_delivery(
                                txn,
                                &purchase_order,
                                items,
                                movement_ids,
                                rating,
                            )
                            .await?;
                        }
                        PurchaseOrderStatus::Cancelled => clear_in_transit(txn, &items).await?,
                        _ => {}
                    }

                    let now = Utc::now();
                    let approved_at = purchase_order.approved_at;
                    let shipped_at = purchase_order.shipped_at;
                    let mut active: purchase_order::ActiveModel = purchase_order.into();
                    active.status = Set(new_status);
                    let past_approval = matches!(
                        new_status,
                        PurchaseOrderStatus::Approved
                            | PurchaseOrderStatus::Shipped
                            | PurchaseOrderStatus::Delivered
                    );
                    if past_approval && approved_at.is_none() {
                        active.approved_at = Set(Some(now));
                    }
                    if matches!(
                        new_status,
                        PurchaseOrderStatus::Shipped | PurchaseOrderStatus::Delivered
                    ) && shipped_at.is_none()
                    {
                        active.shipped_at = Set(Some(now));
                    }
                    match new_status {
                        PurchaseOrderStatus::Delivered => {
                            active.delivered_at = Set(Some(now));
                            active.delivery_rating = Set(Some(rating));
                        }
                        PurchaseOrderStatus::Cancelled => active.cancelled_at = Set(Some(now)),
                        _ => {}
                    }
                    active.updated_at = Set(now);
                    // Only the writer that still sees `from` may commit the transition.
                    purchase_order::Entity::update(active)
                        .filter(purchase_order::Column::Status.eq(from))
                        .exec(txn)
                        .await
                        .map_err(|e| match e {
                            DbErr::RecordNotUpdated => ServiceError::Conflict(format!(
                                "purchase order {} was modified concurrently",
                                po_id
                            )),
                            other => ServiceError::db_error(other),
                        })?;
                    Ok(applied)
                })
            })
            .await?;

        info!(
            purchase_order_id = %current.purchase_order.id,
            %old_status,
            %new_status,
            restocked = applied.len(),
            "Purchase order status updated"
        );
        for movement in &applied {
            self.ctx.events.publish(Event::MaterialRestocked {
                material_id: movement.material.id.clone(),
                purchase_order_id: current.purchase_order.id.clone(),
                quantity: movement.movement.quantity,
                new_stock: movement.material.current_stock,
                restocked_at: movement.movement.created_at,
            });
            notify_material_movement(&self.ctx.events, movement);
        }
        self.ctx.events.publish(Event::PurchaseOrderStatusChanged {
            purchase_order_id: current.purchase_order.id.clone(),
            old_status,
            new_status,
        });

        self.get_purchase_order(&current.purchase_order.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PurchaseOrderStatus::*;

    #[test]
    fn rating_range() {
        assert!(validate_rating(dec!(0)).is_ok());
        assert!(validate_rating(dec!(4.5)).is_ok());
        assert!(validate_rating(dec!(5)).is_ok());
        assert!(validate_rating(dec!(5.1)).is_err());
        assert!(validate_rating(dec!(-0.5)).is_err());
    }

    #[test]
    fn transit_starts_at_approval_or_direct_shipment() {
        assert!(enters_transit(Draft, Approved));
        assert!(enters_transit(Pending, Shipped));
        assert!(!enters_transit(Approved, Shipped));
        assert!(!enters_transit(Pending, Delivered));
        assert!(!enters_transit(Draft, Cancelled));
    }
}
