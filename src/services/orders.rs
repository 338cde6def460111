use crate::entities::order::round_money;
use crate::entities::{
    order, order_item, product, raw_material, OrderItemType, OrderStatus, SelectedUnit,
    SelectedUnits, UnitStatus, WorkflowStep,
};
use crate::errors::ServiceError;
use crate::events::Event;
use crate::services::sequence::{IdKind, SequenceService};
use crate::services::settlement::{enqueue_settlement, SettlementOutcome, SettlementService};
use crate::services::stock_ledger::{notify_low_stock, ProductStockSnapshot};
use crate::services::units::{
    load_units, lock_open_order, mark_units_sold, release_units, release_units_for_order,
    reserve_units, reserved_unit_ids,
};
use crate::services::{dedup_ids, ensure_non_negative, PageRequest, ServiceContext};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{error, info, instrument, warn};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, max = 64, message = "Customer id is required"))]
    pub customer_id: String,
    #[validate(length(min = 1, message = "Order must contain at least one item"))]
    pub items: Vec<CreateOrderItemRequest>,
    /// Percentage; the configured default applies when absent.
    pub gst_rate: Option<Decimal>,
    pub gst_included: Option<bool>,
    #[serde(default)]
    pub discount_amount: Decimal,
    #[serde(default)]
    pub paid_amount: Decimal,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

fn default_item_type() -> OrderItemType {
    OrderItemType::Product
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderItemRequest {
    #[serde(default = "default_item_type")]
    pub item_type: OrderItemType,
    pub product_id: Option<String>,
    pub raw_material_id: Option<String>,
    /// Defaults to the product or material name.
    pub item_name: Option<String>,
    pub quantity: i32,
    pub unit_price: Decimal,
    /// Overrides `quantity * unit_price`.
    pub total_price: Option<Decimal>,
    /// Units to reserve for this line right away.
    #[serde(default)]
    pub selected_unit_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateItemUnitsRequest {
    pub unit_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordPaymentRequest {
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderWithItems {
    #[serde(flatten)]
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemSelection {
    pub item: order_item::Model,
    pub products: Vec<ProductStockSnapshot>,
}

/// A validated order line with its catalogue references resolved.
#[derive(Debug, Clone)]
struct ResolvedItem {
    item_type: OrderItemType,
    product_id: Option<String>,
    raw_material_id: Option<String>,
    item_name: String,
    quantity: i32,
    unit_price: Decimal,
    total_price: Decimal,
    unit_ids: Vec<String>,
}

/// What a status transaction did, reported after commit.
#[derive(Debug, Default)]
struct TransitionEffects {
    products: Vec<ProductStockSnapshot>,
    released: Vec<String>,
    settlement_enqueued: bool,
}

fn reserved_selection(ids: &[String], now: DateTime<Utc>) -> SelectedUnits {
    SelectedUnits(
        ids.iter()
            .map(|id| SelectedUnit {
                individual_product_id: id.clone(),
                status: UnitStatus::Reserved,
                allocated_at: now,
            })
            .collect(),
    )
}

fn validate_gst_rate(rate: Decimal) -> Result<(), ServiceError> {
    if rate < Decimal::ZERO || rate > Decimal::ONE_HUNDRED {
        return Err(ServiceError::ValidationError(
            "gst_rate must be between 0 and 100".to_string(),
        ));
    }
    Ok(())
}

/// Marks every unit of the order sold: the selected units of each item (recorded on the
/// item) and any unit still reserved for the order.
async fn sell_order_units<C>(
    conn: &C,
    order_id: &str,
    items: Vec<order_item::Model>,
) -> Result<Vec<ProductStockSnapshot>, ServiceError>
where
    C: ConnectionTrait,
{
    let mut products = Vec::new();
    for item in items {
        if item.selected_individual_products.is_empty() {
            continue;
        }
        let ids = item.selected_individual_products.ids();
        products.extend(mark_units_sold(conn, &ids, order_id).await?);

        let sold = item
            .selected_individual_products
            .clone()
            .with_status(UnitStatus::Sold);
        if sold != item.selected_individual_products {
            let mut active: order_item::ActiveModel = item.into();
            active.selected_individual_products = Set(sold);
            active.update(conn).await.map_err(ServiceError::db_error)?;
        }
    }

    // Units reserved for the order without being listed on a line go out with it too.
    let held = reserved_unit_ids(conn, order_id).await?;
    products.extend(mark_units_sold(conn, &held, order_id).await?);
    Ok(products)
}

#[derive(Clone, Debug)]
pub struct OrderService {
    ctx: ServiceContext,
    sequence: SequenceService,
    settlement: SettlementService,
    default_gst_rate: Decimal,
}

impl OrderService {
    pub fn new(
        ctx: ServiceContext,
        sequence: SequenceService,
        settlement: SettlementService,
        default_gst_rate: Decimal,
    ) -> Self {
        Self {
            ctx,
            sequence,
            settlement,
            default_gst_rate,
        }
    }

    /// Validates the lines and resolves product and material references.
    async fn resolve_items(
        &self,
        requests: Vec<CreateOrderItemRequest>,
    ) -> Result<Vec<ResolvedItem>, ServiceError> {
        let db = self.ctx.db.clone();
        let mut seen_units = HashSet::new();
        let mut resolved = Vec::with_capacity(requests.len());

        for (index, request) in requests.into_iter().enumerate() {
            let line = index + 1;
            if request.quantity < 1 {
                return Err(ServiceError::ValidationError(format!(
                    "item {}: quantity must be at least 1",
                    line
                )));
            }
            ensure_non_negative("unit_price", request.unit_price)?;
            if let Some(total) = request.total_price {
                ensure_non_negative("total_price", total)?;
            }
            let unit_ids = dedup_ids(request.selected_unit_ids);

            let (product_id, raw_material_id, item_name) = match request.item_type {
                OrderItemType::Product => {
                    let product_id = request.product_id.ok_or_else(|| {
                        ServiceError::ValidationError(format!(
                            "item {}: product_id is required for product items",
                            line
                        ))
                    })?;
                    let found = self
                        .ctx
                        .bounded(async {
                            product::Entity::find_by_id(product_id.clone())
                                .one(db.as_ref())
                                .await
                                .map_err(ServiceError::db_error)
                        })
                        .await?
                        .ok_or_else(|| {
                            ServiceError::ValidationError(format!(
                                "item {}: unknown product {}",
                                line, product_id
                            ))
                        })?;
                    (
                        Some(found.id),
                        None,
                        request.item_name.unwrap_or(found.name),
                    )
                }
                OrderItemType::RawMaterial => {
                    if !unit_ids.is_empty() {
                        return Err(ServiceError::ValidationError(format!(
                            "item {}: raw material items cannot select units",
                            line
                        )));
                    }
                    match request.raw_material_id {
                        Some(material_id) => {
                            let found = self
                                .ctx
                                .bounded(async {
                                    raw_material::Entity::find_by_id(material_id.clone())
                                        .one(db.as_ref())
                                        .await
                                        .map_err(ServiceError::db_error)
                                })
                                .await?
                                .ok_or_else(|| {
                                    ServiceError::ValidationError(format!(
                                        "item {}: unknown raw material {}",
                                        line, material_id
                                    ))
                                })?;
                            (
                                None,
                                Some(found.id),
                                request.item_name.unwrap_or(found.name),
                            )
                        }
                        None => {
                            let name = request
                                .item_name
                                .filter(|n| !n.trim().is_empty())
                                .ok_or_else(|| {
                                    ServiceError::ValidationError(format!(
                                        "item {}: raw_material_id or item_name is required",
                                        line
                                    ))
                                })?;
                            (None, None, name)
                        }
                    }
                }
            };

            if unit_ids.len() > request.quantity as usize {
                return Err(ServiceError::ValidationError(format!(
                    "item {}: {} units selected for a quantity of {}",
                    line,
                    unit_ids.len(),
                    request.quantity
                )));
            }
            for id in &unit_ids {
                if !seen_units.insert(id.clone()) {
                    return Err(ServiceError::ValidationError(format!(
                        "unit {} is selected on more than one item",
                        id
                    )));
                }
            }
            if let Some(product_id) = product_id.as_deref() {
                self.ensure_units_of_product(product_id, &unit_ids).await?;
            }

            let total_price = request
                .total_price
                .unwrap_or_else(|| Decimal::from(request.quantity) * request.unit_price);
            resolved.push(ResolvedItem {
                item_type: request.item_type,
                product_id,
                raw_material_id,
                item_name,
                quantity: request.quantity,
                unit_price: request.unit_price,
                total_price: round_money(total_price),
                unit_ids,
            });
        }
        Ok(resolved)
    }

    async fn ensure_units_of_product(
        &self,
        product_id: &str,
        unit_ids: &[String],
    ) -> Result<(), ServiceError> {
        if unit_ids.is_empty() {
            return Ok(());
        }
        let db = self.ctx.db.clone();
        let units = self
            .ctx
            .bounded(async { load_units(db.as_ref(), unit_ids).await })
            .await?;
        let foreign: Vec<&str> = units
            .iter()
            .filter(|u| u.product_id != product_id)
            .map(|u| u.id.as_str())
            .collect();
        if !foreign.is_empty() {
            return Err(ServiceError::ValidationError(format!(
                "units {} do not belong to product {}",
                foreign.join(", "),
                product_id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, request), fields(customer_id = %request.customer_id))]
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
    ) -> Result<OrderWithItems, ServiceError> {
        request.validate()?;
        let gst_rate = request.gst_rate.unwrap_or(self.default_gst_rate);
        validate_gst_rate(gst_rate)?;
        ensure_non_negative("discount_amount", request.discount_amount)?;
        ensure_non_negative("paid_amount", request.paid_amount)?;

        let items = self.resolve_items(request.items).await?;
        let subtotal = round_money(items.iter().map(|i| i.total_price).sum());

        let order_id = self.sequence.next(IdKind::Order).await;
        let item_ids = self.sequence.next_many(IdKind::OrderItem, items.len()).await;
        let now = Utc::now();

        let order_row = order::ActiveModel {
            id: Set(order_id.clone()),
            order_number: Set(order_id.clone()),
            customer_id: Set(request.customer_id),
            status: Set(OrderStatus::Pending),
            workflow_step: Set(WorkflowStep::Accept),
            subtotal: Set(subtotal),
            gst_rate: Set(gst_rate),
            gst_included: Set(request.gst_included.unwrap_or(true)),
            gst_amount: Set(Decimal::ZERO),
            discount_amount: Set(request.discount_amount),
            total_amount: Set(Decimal::ZERO),
            paid_amount: Set(request.paid_amount),
            outstanding_amount: Set(Decimal::ZERO),
            notes: Set(request.notes),
            accepted_at: Set(None),
            dispatched_at: Set(None),
            delivered_at: Set(None),
            cancelled_at: Set(None),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let selected: Vec<String> = items.iter().flat_map(|i| i.unit_ids.clone()).collect();
        let item_rows: Vec<order_item::ActiveModel> = items
            .into_iter()
            .zip(item_ids)
            .map(|(item, id)| order_item::ActiveModel {
                id: Set(id),
                order_id: Set(order_id.clone()),
                item_type: Set(item.item_type),
                product_id: Set(item.product_id),
                raw_material_id: Set(item.raw_material_id),
                item_name: Set(item.item_name),
                quantity: Set(item.quantity),
                unit_price: Set(item.unit_price),
                total_price: Set(item.total_price),
                selected_individual_products: Set(reserved_selection(&item.unit_ids, now)),
                created_at: Set(now),
                updated_at: Set(now),
            })
            .collect();

        let txn_order_id = order_id.clone();
        let txn_selected = selected.clone();
        let (order, items, products) = self
            .ctx
            .transaction(move |txn| {
                Box::pin(async move {
                    let order = order_row.insert(txn).await.map_err(ServiceError::from_write)?;
                    let mut items = Vec::with_capacity(item_rows.len());
                    for row in item_rows {
                        items.push(row.insert(txn).await.map_err(ServiceError::from_write)?);
                    }
                    let products = reserve_units(txn, &txn_selected, &txn_order_id).await?;
                    Ok((order, items, products))
                })
            })
            .await?;

        info!(
            order_id = %order.id,
            items = items.len(),
            total_amount = %order.total_amount,
            "Order created"
        );
        self.ctx.events.publish(Event::OrderCreated(order.id.clone()));
        if !selected.is_empty() {
            self.ctx.events.publish(Event::UnitsReserved {
                order_id: order.id.clone(),
                unit_ids: selected,
            });
        }
        notify_low_stock(&self.ctx.events, &products);

        Ok(OrderWithItems { order, items })
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, id: &str) -> Result<OrderWithItems, ServiceError> {
        let db = self.ctx.db.clone();
        let order = self
            .ctx
            .bounded(async {
                order::Entity::find_by_id(id.to_string())
                    .one(db.as_ref())
                    .await
                    .map_err(ServiceError::db_error)
            })
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))?;
        let items = self.items_of(&order.id).await?;
        Ok(OrderWithItems { order, items })
    }

    pub async fn get_order_items(&self, order_id: &str) -> Result<Vec<order_item::Model>, ServiceError> {
        Ok(self.get_order(order_id).await?.items)
    }

    async fn items_of(&self, order_id: &str) -> Result<Vec<order_item::Model>, ServiceError> {
        let db = self.ctx.db.clone();
        self.ctx
            .bounded(async {
                order_item::Entity::find()
                    .filter(order_item::Column::OrderId.eq(order_id))
                    .order_by_asc(order_item::Column::CreatedAt)
                    .order_by_asc(order_item::Column::Id)
                    .all(db.as_ref())
                    .await
                    .map_err(ServiceError::db_error)
            })
            .await
    }

    /// Newest first.
    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        status: Option<OrderStatus>,
        page: PageRequest,
    ) -> Result<(Vec<order::Model>, u64), ServiceError> {
        let db = self.ctx.db.clone();
        self.ctx
            .bounded(async {
                let mut query = order::Entity::find();
                if let Some(status) = status {
                    query = query.filter(order::Column::Status.eq(status));
                }
                let paginator = query
                    .order_by_desc(order::Column::CreatedAt)
                    .order_by_desc(order::Column::Id)
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

    /// Moves an order forward (or cancels it) and applies the unit side effects in the
    /// same transaction. Stock deductions run after commit through the settlement outbox.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        order_id: &str,
        new_status: OrderStatus,
    ) -> Result<OrderWithItems, ServiceError> {
        let current = self.get_order(order_id).await?;
        let old_status = current.order.status;
        if old_status == new_status {
            return Ok(current);
        }
        old_status
            .check_transition(new_status)
            .map_err(ServiceError::ValidationError)?;

        let id = current.order.id.clone();
        let effects = self
            .ctx
            .transaction(move |txn| {
                Box::pin(async move { apply_transition(txn, &id, new_status).await })
            })
            .await?;

        info!(
            order_id = %current.order.id,
            %old_status,
            %new_status,
            sold_or_released = effects.products.len(),
            "Order status updated"
        );

        if matches!(new_status, OrderStatus::Dispatched | OrderStatus::Delivered) {
            match self.settlement.settle_order(&current.order.id).await {
                Ok(SettlementOutcome::Settled | SettlementOutcome::Skipped) => {}
                Ok(outcome) => {
                    warn!(order_id = %current.order.id, ?outcome, "Settlement deferred to worker")
                }
                Err(e) => {
                    error!(order_id = %current.order.id, error = %e, "Inline settlement failed")
                }
            }
        }

        if !effects.released.is_empty() {
            self.ctx.events.publish(Event::UnitsReleased {
                unit_ids: effects.released.clone(),
            });
        }
        notify_low_stock(&self.ctx.events, &effects.products);
        self.ctx.events.publish(Event::OrderStatusChanged {
            order_id: current.order.id.clone(),
            old_status,
            new_status,
        });
        if effects.settlement_enqueued {
            info!(order_id = %current.order.id, "Settlement task enqueued");
        }

        self.get_order(&current.order.id).await
    }

    /// Replaces the unit selection of one product line.
    #[instrument(skip(self))]
    pub async fn update_order_item_units(
        &self,
        item_id: &str,
        unit_ids: Vec<String>,
    ) -> Result<ItemSelection, ServiceError> {
        let db = self.ctx.db.clone();
        let item = self
            .ctx
            .bounded(async {
                order_item::Entity::find_by_id(item_id.to_string())
                    .one(db.as_ref())
                    .await
                    .map_err(ServiceError::db_error)
            })
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order item {} not found", item_id)))?;

        let product_id = match (item.item_type, item.product_id.as_deref()) {
            (OrderItemType::Product, Some(product_id)) => product_id.to_string(),
            _ => {
                return Err(ServiceError::ValidationError(format!(
                    "order item {} is not a product line",
                    item.id
                )))
            }
        };
        let order = self.get_order(&item.order_id).await?.order;

        let ids = dedup_ids(unit_ids);
        if ids.len() > item.quantity as usize {
            return Err(ServiceError::ValidationError(format!(
                "{} units selected for a quantity of {}",
                ids.len(),
                item.quantity
            )));
        }
        self.ensure_units_of_product(&product_id, &ids).await?;

        let current = item.selected_individual_products.ids();
        let dropped: Vec<String> = current.iter().filter(|id| !ids.contains(id)).cloned().collect();
        let added: Vec<String> = ids.iter().filter(|id| !current.contains(id)).cloned().collect();

        let kept_since: HashMap<String, DateTime<Utc>> = item
            .selected_individual_products
            .0
            .iter()
            .map(|s| (s.individual_product_id.clone(), s.allocated_at))
            .collect();
        let now = Utc::now();
        let selection = SelectedUnits(
            ids.iter()
                .map(|id| SelectedUnit {
                    individual_product_id: id.clone(),
                    status: UnitStatus::Reserved,
                    allocated_at: kept_since.get(id).copied().unwrap_or(now),
                })
                .collect(),
        );

        let order_id = order.id.clone();
        let txn_item_id = item.id.clone();
        let txn_added = added.clone();
        let txn_dropped = dropped.clone();
        let (item, products) = self
            .ctx
            .transaction(move |txn| {
                Box::pin(async move {
                    lock_open_order(txn, &order_id).await?;
                    let mut products = release_units(txn, &txn_dropped).await?.products;
                    products.extend(reserve_units(txn, &txn_added, &order_id).await?);

                    // Release may already have rewritten the row.
                    let fresh = order_item::Entity::find_by_id(txn_item_id.clone())
                        .one(txn)
                        .await
                        .map_err(ServiceError::db_error)?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!("Order item {} not found", txn_item_id))
                        })?;
                    let mut active: order_item::ActiveModel = fresh.into();
                    active.selected_individual_products = Set(selection);
                    let item = active.update(txn).await.map_err(ServiceError::db_error)?;
                    Ok((item, products))
                })
            })
            .await?;

        info!(
            item_id = %item.id,
            added = added.len(),
            dropped = dropped.len(),
            "Order item selection updated"
        );
        if !added.is_empty() {
            self.ctx.events.publish(Event::UnitsReserved {
                order_id: order.id.clone(),
                unit_ids: added,
            });
        }
        if !dropped.is_empty() {
            self.ctx
                .events
                .publish(Event::UnitsReleased { unit_ids: dropped });
        }
        notify_low_stock(&self.ctx.events, &products);

        Ok(ItemSelection { item, products })
    }

    #[instrument(skip(self))]
    pub async fn record_payment(
        &self,
        order_id: &str,
        amount: Decimal,
    ) -> Result<order::Model, ServiceError> {
        if amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "payment amount must be greater than zero".to_string(),
            ));
        }

        let id = order_id.to_string();
        let order = self
            .ctx
            .transaction(move |txn| {
                Box::pin(async move {
                    let order = order::Entity::find_by_id(id.clone())
                        .lock_exclusive()
                        .one(txn)
                        .await
                        .map_err(ServiceError::db_error)?
                        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))?;
                    if order.status == OrderStatus::Cancelled {
                        return Err(ServiceError::ValidationError(format!(
                            "order {} is cancelled",
                            id
                        )));
                    }
                    let paid = order.paid_amount + amount;
                    let mut active: order::ActiveModel = order.into();
                    active.paid_amount = Set(round_money(paid));
                    active.update(txn).await.map_err(ServiceError::db_error)
                })
            })
            .await?;

        info!(order_id = %order.id, %amount, outstanding = %order.outstanding_amount, "Payment recorded");
        self.ctx.events.publish(Event::PaymentRecorded {
            order_id: order.id.clone(),
            amount,
            outstanding_amount: order.outstanding_amount,
        });
        Ok(order)
    }
}

/// Status write plus unit side effects. Re-checks the transition against the row
/// read inside the transaction and bumps `version` with an optimistic guard.
async fn apply_transition<C>(
    conn: &C,
    order_id: &str,
    new_status: OrderStatus,
) -> Result<TransitionEffects, ServiceError>
where
    C: ConnectionTrait,
{
    let order = order::Entity::find_by_id(order_id.to_string())
        .lock_exclusive()
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
    if order.status == new_status {
        return Ok(TransitionEffects::default());
    }
    order
        .status
        .check_transition(new_status)
        .map_err(ServiceError::ValidationError)?;

    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    let mut effects = TransitionEffects::default();
    match new_status {
        OrderStatus::Ready => {
            for item in items.iter().filter(|i| i.item_type == OrderItemType::Product) {
                let selected = item.selected_individual_products.len();
                if selected < item.quantity as usize {
                    warn!(
                        order_id,
                        item_id = %item.id,
                        selected,
                        quantity = item.quantity,
                        "Order ready with fewer selected units than ordered"
                    );
                }
            }
        }
        OrderStatus::Dispatched | OrderStatus::Delivered => {
            effects.products = sell_order_units(conn, order_id, items).await?;
            effects.settlement_enqueued = enqueue_settlement(conn, order_id).await?;
        }
        OrderStatus::Cancelled => {
            let released = release_units_for_order(conn, order_id).await?;
            effects.released = released.unit_ids;
            effects.products = released.products;

            // Anything still listed is stale once the order is cancelled.
            let leftovers = order_item::Entity::find()
                .filter(order_item::Column::OrderId.eq(order_id))
                .all(conn)
                .await
                .map_err(ServiceError::db_error)?;
            for item in leftovers
                .into_iter()
                .filter(|i| !i.selected_individual_products.is_empty())
            {
                let mut active: order_item::ActiveModel = item.into();
                active.selected_individual_products = Set(SelectedUnits::default());
                active.update(conn).await.map_err(ServiceError::db_error)?;
            }
        }
        OrderStatus::Pending | OrderStatus::Accepted | OrderStatus::InProduction => {}
    }

    let now = Utc::now();
    let version = order.version;
    let reached_acceptance = new_status != OrderStatus::Cancelled;
    let needs_accepted_at = reached_acceptance && order.accepted_at.is_none();
    let needs_dispatched_at = matches!(new_status, OrderStatus::Dispatched | OrderStatus::Delivered)
        && order.dispatched_at.is_none();
    let workflow_step = new_status.workflow_step();

    let mut active: order::ActiveModel = order.into();
    active.status = Set(new_status);
    if let Some(step) = workflow_step {
        active.workflow_step = Set(step);
    }
    if needs_accepted_at {
        active.accepted_at = Set(Some(now));
    }
    if needs_dispatched_at {
        active.dispatched_at = Set(Some(now));
    }
    match new_status {
        OrderStatus::Delivered => active.delivered_at = Set(Some(now)),
        OrderStatus::Cancelled => active.cancelled_at = Set(Some(now)),
        _ => {}
    }
    active.version = Set(version + 1);
    active.updated_at = Set(now);

    order::Entity::update(active)
        .filter(order::Column::Version.eq(version))
        .exec(conn)
        .await
        .map_err(|e| match e {
            DbErr::RecordNotUpdated => ServiceError::Conflict(format!(
                "order {} was modified concurrently",
                order_id
            )),
            other => ServiceError::db_error(other),
        })?;

    Ok(effects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn gst_rate_bounds() {
        assert!(validate_gst_rate(dec!(0)).is_ok());
        assert!(validate_gst_rate(dec!(18)).is_ok());
        assert!(validate_gst_rate(dec!(100)).is_ok());
        assert!(validate_gst_rate(dec!(-1)).is_err());
        assert!(validate_gst_rate(dec!(100.5)).is_err());
    }

    #[test]
    fn reserved_selection_marks_every_unit() {
        let now = Utc::now();
        let ids = vec!["QR-240101-001".to_string(), "QR-240101-002".to_string()];
        let selection = reserved_selection(&ids, now);
        assert_eq!(selection.ids(), ids);
        assert!(selection.0.iter().all(|s| s.status == UnitStatus::Reserved));
        assert!(selection.0.iter().all(|s| s.allocated_at == now));
    }

    #[test]
    fn item_type_defaults_to_product() {
        let item: CreateOrderItemRequest = serde_json::from_value(serde_json::json!({
            "product_id": "PRO-240101-001",
            "quantity": 2,
            "unit_price": "150.00"
        }))
        .unwrap();
        assert_eq!(item.item_type, OrderItemType::Product);
        assert!(item.selected_unit_ids.is_empty());
        assert!(item.total_price.is_none());
    }
}
