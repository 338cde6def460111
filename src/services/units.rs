use crate::entities::{individual_product, order, order_item, product, SelectedUnits, UnitStatus};
use crate::errors::ServiceError;
use crate::events::Event;
use crate::services::sequence::{IdKind, SequenceService};
use crate::services::stock_ledger::{
    notify_low_stock, recompute_product_stock, recompute_products, ProductStockSnapshot,
};
use crate::services::{dedup_ids, ServiceContext};
use chrono::Utc;
use metrics::counter;
use sea_orm::sea_query::Condition;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, instrument};

/// Upper bound for one production batch.
pub const MAX_PRODUCTION_BATCH: u32 = 500;

/// Outcome of a unit transition: which units moved and the refreshed product counters.
#[derive(Debug, Clone, Serialize)]
pub struct UnitTransition {
    pub unit_ids: Vec<String>,
    pub products: Vec<ProductStockSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductionBatch {
    pub units: Vec<individual_product::Model>,
    pub stock: ProductStockSnapshot,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProductionRequest {
    pub quantity: u32,
    pub notes: Option<String>,
}

/// Loads every id or fails with `NotFound` naming the missing ones.
pub(crate) async fn load_units<C>(
    conn: &C,
    ids: &[String],
) -> Result<Vec<individual_product::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    let units = individual_product::Entity::find()
        .filter(individual_product::Column::Id.is_in(ids.to_vec()))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if units.len() != ids.len() {
        let missing: Vec<&str> = ids
            .iter()
            .filter(|id| !units.iter().any(|u| &u.id == *id))
            .map(String::as_str)
            .collect();
        return Err(ServiceError::NotFound(format!(
            "Units not found: {}",
            missing.join(", ")
        )));
    }
    Ok(units)
}

/// Reads the order row under lock and refuses orders whose units are settled.
/// Status transitions take the same lock, so a dispatch cannot slip in before commit.
pub(crate) async fn lock_open_order<C>(conn: &C, order_id: &str) -> Result<order::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let order = order::Entity::find_by_id(order_id.to_string())
        .lock_exclusive()
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
    if order.status.is_past_dispatch() {
        return Err(ServiceError::ValidationError(format!(
            "order {} is {} and its units can no longer change",
            order.id, order.status
        )));
    }
    Ok(order)
}

/// Ids of the units currently reserved by `order_id`, oldest unit first.
pub(crate) async fn reserved_unit_ids<C>(conn: &C, order_id: &str) -> Result<Vec<String>, ServiceError>
where
    C: ConnectionTrait,
{
    Ok(individual_product::Entity::find()
        .filter(individual_product::Column::OrderId.eq(order_id))
        .filter(individual_product::Column::Status.eq(UnitStatus::Reserved))
        .order_by_asc(individual_product::Column::ProductionDate)
        .order_by_asc(individual_product::Column::Id)
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?
        .into_iter()
        .map(|u| u.id)
        .collect())
}

fn product_ids(units: &[individual_product::Model]) -> Vec<String> {
    units.iter().map(|u| u.product_id.clone()).collect()
}

/// `available -> reserved` for every id, or nothing at all.
pub(crate) async fn reserve_units<C>(
    conn: &C,
    ids: &[String],
    order_id: &str,
) -> Result<Vec<ProductStockSnapshot>, ServiceError>
where
    C: ConnectionTrait,
{
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let units = load_units(conn, ids).await?;
    let now = Utc::now();

    let result = individual_product::Entity::update_many()
        .set(individual_product::ActiveModel {
            status: Set(UnitStatus::Reserved),
            order_id: Set(Some(order_id.to_string())),
            reserved_at: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        })
        .filter(individual_product::Column::Id.is_in(ids.to_vec()))
        .filter(individual_product::Column::Status.eq(UnitStatus::Available))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if result.rows_affected != ids.len() as u64 {
        counter!("carpet_inventory.units.reservation_conflicts", 1);
        let taken: Vec<&str> = units
            .iter()
            .filter(|u| u.status != UnitStatus::Available)
            .map(|u| u.id.as_str())
            .collect();
        return Err(ServiceError::Conflict(if taken.is_empty() {
            "one or more units are already allocated elsewhere".to_string()
        } else {
            format!("units already allocated elsewhere: {}", taken.join(", "))
        }));
    }

    recompute_products(conn, product_ids(&units)).await
}

/// `reserved (for this order) | available -> sold`. Units already sold to this order
/// are left alone; anything else is a conflict.
pub(crate) async fn mark_units_sold<C>(
    conn: &C,
    ids: &[String],
    order_id: &str,
) -> Result<Vec<ProductStockSnapshot>, ServiceError>
where
    C: ConnectionTrait,
{
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let units = load_units(conn, ids).await?;

    let mut to_sell = Vec::new();
    for unit in &units {
        let owned_here = unit.order_id.as_deref() == Some(order_id);
        match unit.status {
            UnitStatus::Available => to_sell.push(unit.id.clone()),
            UnitStatus::Reserved if owned_here => to_sell.push(unit.id.clone()),
            UnitStatus::Sold if owned_here => {}
            status => {
                return Err(ServiceError::Conflict(format!(
                    "unit {} is {} for {} and cannot be sold to order {}",
                    unit.id,
                    status,
                    unit.order_id.as_deref().unwrap_or("no order"),
                    order_id
                )))
            }
        }
    }
    if to_sell.is_empty() {
        return Ok(Vec::new());
    }

    let now = Utc::now();
    let result = individual_product::Entity::update_many()
        .set(individual_product::ActiveModel {
            status: Set(UnitStatus::Sold),
            order_id: Set(Some(order_id.to_string())),
            sold_date: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        })
        .filter(individual_product::Column::Id.is_in(to_sell.clone()))
        .filter(
            Condition::any()
                .add(individual_product::Column::Status.eq(UnitStatus::Available))
                .add(
                    Condition::all()
                        .add(individual_product::Column::Status.eq(UnitStatus::Reserved))
                        .add(individual_product::Column::OrderId.eq(order_id)),
                ),
        )
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if result.rows_affected != to_sell.len() as u64 {
        return Err(ServiceError::Conflict(
            "units changed state while being sold".to_string(),
        ));
    }

    recompute_products(conn, product_ids(&units)).await
}

/// Drops released units from the selections of the orders that held them.
async fn detach_from_order_items<C>(
    conn: &C,
    released: &[individual_product::Model],
) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    let mut by_order: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for unit in released {
        if let Some(order_id) = unit.order_id.as_deref() {
            by_order.entry(order_id).or_default().push(unit.id.as_str());
        }
    }

    for (order_id, unit_ids) in by_order {
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        for item in items {
            let kept: Vec<_> = item
                .selected_individual_products
                .0
                .iter()
                .filter(|s| !unit_ids.contains(&s.individual_product_id.as_str()))
                .cloned()
                .collect();
            if kept.len() == item.selected_individual_products.len() {
                continue;
            }
            let mut active: order_item::ActiveModel = item.into();
            active.selected_individual_products = Set(SelectedUnits(kept));
            active.update(conn).await.map_err(ServiceError::db_error)?;
        }
    }
    Ok(())
}

/// `reserved -> available`. Units in any other state are untouched.
pub(crate) async fn release_units<C>(
    conn: &C,
    ids: &[String],
) -> Result<UnitTransition, ServiceError>
where
    C: ConnectionTrait,
{
    if ids.is_empty() {
        return Ok(UnitTransition {
            unit_ids: Vec::new(),
            products: Vec::new(),
        });
    }
    let units = load_units(conn, ids).await?;
    let reserved: Vec<individual_product::Model> = units
        .into_iter()
        .filter(|u| u.status == UnitStatus::Reserved)
        .collect();
    let reserved_ids: Vec<String> = reserved.iter().map(|u| u.id.clone()).collect();
    if reserved_ids.is_empty() {
        return Ok(UnitTransition {
            unit_ids: Vec::new(),
            products: Vec::new(),
        });
    }

    individual_product::Entity::update_many()
        .set(individual_product::ActiveModel {
            status: Set(UnitStatus::Available),
            order_id: Set(None),
            reserved_at: Set(None),
            updated_at: Set(Utc::now()),
            ..Default::default()
        })
        .filter(individual_product::Column::Id.is_in(reserved_ids.clone()))
        .filter(individual_product::Column::Status.eq(UnitStatus::Reserved))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    detach_from_order_items(conn, &reserved).await?;
    let products = recompute_products(conn, product_ids(&reserved)).await?;

    Ok(UnitTransition {
        unit_ids: reserved_ids,
        products,
    })
}

/// Releases every unit currently reserved by `order_id`.
pub(crate) async fn release_units_for_order<C>(
    conn: &C,
    order_id: &str,
) -> Result<UnitTransition, ServiceError>
where
    C: ConnectionTrait,
{
    let ids = reserved_unit_ids(conn, order_id).await?;
    release_units(conn, &ids).await
}

/// `available -> used | damaged`, all or nothing.
pub(crate) async fn retire_units<C>(
    conn: &C,
    ids: &[String],
    target: UnitStatus,
) -> Result<Vec<ProductStockSnapshot>, ServiceError>
where
    C: ConnectionTrait,
{
    if !matches!(target, UnitStatus::Used | UnitStatus::Damaged) {
        return Err(ServiceError::InternalError(format!(
            "{} is not a retirement state",
            target
        )));
    }
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let units = load_units(conn, ids).await?;
    let blocked: Vec<String> = units
        .iter()
        .filter(|u| u.status != UnitStatus::Available)
        .map(|u| format!("{} ({})", u.id, u.status))
        .collect();
    if !blocked.is_empty() {
        return Err(ServiceError::Conflict(format!(
            "only available units can be marked {}: {}",
            target,
            blocked.join(", ")
        )));
    }

    let result = individual_product::Entity::update_many()
        .set(individual_product::ActiveModel {
            status: Set(target),
            updated_at: Set(Utc::now()),
            ..Default::default()
        })
        .filter(individual_product::Column::Id.is_in(ids.to_vec()))
        .filter(individual_product::Column::Status.eq(UnitStatus::Available))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;
    if result.rows_affected != ids.len() as u64 {
        return Err(ServiceError::Conflict(format!(
            "units changed state while being marked {}",
            target
        )));
    }

    recompute_products(conn, product_ids(&units)).await
}

fn require_ids(unit_ids: Vec<String>) -> Result<Vec<String>, ServiceError> {
    let ids = dedup_ids(unit_ids);
    if ids.is_empty() {
        return Err(ServiceError::ValidationError(
            "at least one unit id is required".to_string(),
        ));
    }
    Ok(ids)
}

/// Transitions of individually tracked units.
#[derive(Clone, Debug)]
pub struct UnitService {
    ctx: ServiceContext,
    sequence: SequenceService,
}

impl UnitService {
    pub fn new(ctx: ServiceContext, sequence: SequenceService) -> Self {
        Self { ctx, sequence }
    }

    async fn find_order(&self, order_id: &str) -> Result<order::Model, ServiceError> {
        let db = self.ctx.db.clone();
        self.ctx
            .bounded(async {
                order::Entity::find_by_id(order_id.to_string())
                    .one(db.as_ref())
                    .await
                    .map_err(ServiceError::db_error)
            })
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    #[instrument(skip(self))]
    pub async fn reserve(
        &self,
        unit_ids: Vec<String>,
        order_id: &str,
    ) -> Result<UnitTransition, ServiceError> {
        let ids = require_ids(unit_ids)?;
        let order = self.find_order(order_id).await?;

        let order_id = order.id.clone();
        let txn_ids = ids.clone();
        let products = self
            .ctx
            .transaction(move |txn| {
                Box::pin(async move {
                    lock_open_order(txn, &order_id).await?;
                    reserve_units(txn, &txn_ids, &order_id).await
                })
            })
            .await?;

        info!(order_id = %order.id, units = ids.len(), "Units reserved");
        self.ctx.events.publish(Event::UnitsReserved {
            order_id: order.id,
            unit_ids: ids.clone(),
        });
        notify_low_stock(&self.ctx.events, &products);

        Ok(UnitTransition {
            unit_ids: ids,
            products,
        })
    }

    #[instrument(skip(self))]
    pub async fn mark_sold(
        &self,
        unit_ids: Vec<String>,
        order_id: &str,
    ) -> Result<UnitTransition, ServiceError> {
        let ids = require_ids(unit_ids)?;
        let order = self.find_order(order_id).await?;

        let txn_ids = ids.clone();
        let products = self
            .ctx
            .transaction(move |txn| {
                Box::pin(async move { mark_units_sold(txn, &txn_ids, &order.id).await })
            })
            .await?;
        notify_low_stock(&self.ctx.events, &products);

        Ok(UnitTransition {
            unit_ids: ids,
            products,
        })
    }

    #[instrument(skip(self))]
    pub async fn release(&self, unit_ids: Vec<String>) -> Result<UnitTransition, ServiceError> {
        let ids = require_ids(unit_ids)?;
        let transition = self
            .ctx
            .transaction(move |txn| Box::pin(async move { release_units(txn, &ids).await }))
            .await?;

        if !transition.unit_ids.is_empty() {
            self.ctx.events.publish(Event::UnitsReleased {
                unit_ids: transition.unit_ids.clone(),
            });
        }
        Ok(transition)
    }

    #[instrument(skip(self))]
    pub async fn release_for_order(&self, order_id: &str) -> Result<UnitTransition, ServiceError> {
        let order = self.find_order(order_id).await?;
        let transition = self
            .ctx
            .transaction(move |txn| {
                Box::pin(async move { release_units_for_order(txn, &order.id).await })
            })
            .await?;

        if !transition.unit_ids.is_empty() {
            self.ctx.events.publish(Event::UnitsReleased {
                unit_ids: transition.unit_ids.clone(),
            });
        }
        Ok(transition)
    }

    #[instrument(skip(self))]
    pub async fn mark_damaged(&self, unit_ids: Vec<String>) -> Result<UnitTransition, ServiceError> {
        self.retire(unit_ids, UnitStatus::Damaged).await
    }

    #[instrument(skip(self))]
    pub async fn mark_used(&self, unit_ids: Vec<String>) -> Result<UnitTransition, ServiceError> {
        self.retire(unit_ids, UnitStatus::Used).await
    }

    async fn retire(
        &self,
        unit_ids: Vec<String>,
        target: UnitStatus,
    ) -> Result<UnitTransition, ServiceError> {
        let ids = require_ids(unit_ids)?;
        let txn_ids = ids.clone();
        let products = self
            .ctx
            .transaction(move |txn| {
                Box::pin(async move { retire_units(txn, &txn_ids, target).await })
            })
            .await?;

        info!(units = ids.len(), %target, "Units retired");
        notify_low_stock(&self.ctx.events, &products);
        Ok(UnitTransition {
            unit_ids: ids,
            products,
        })
    }

    /// Registers `quantity` freshly produced units as `available`.
    #[instrument(skip(self, notes))]
    pub async fn complete_production(
        &self,
        product_id: &str,
        quantity: u32,
        notes: Option<String>,
    ) -> Result<ProductionBatch, ServiceError> {
        if quantity == 0 || quantity > MAX_PRODUCTION_BATCH {
            return Err(ServiceError::ValidationError(format!(
                "quantity must be between 1 and {}",
                MAX_PRODUCTION_BATCH
            )));
        }

        let db = self.ctx.db.clone();
        let product = self
            .ctx
            .bounded(async {
                product::Entity::find_by_id(product_id.to_string())
                    .one(db.as_ref())
                    .await
                    .map_err(ServiceError::db_error)
            })
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;
        if !product.individual_stock_tracking {
            return Err(ServiceError::ValidationError(format!(
                "product {} is not individually tracked",
                product.id
            )));
        }

        // Ids come from the pool, so they must exist before the write transaction opens.
        let ids = self.sequence.next_many(IdKind::Unit, quantity as usize).await;
        let now = Utc::now();
        let rows: Vec<individual_product::ActiveModel> = ids
            .iter()
            .map(|id| individual_product::ActiveModel {
                id: Set(id.clone()),
                product_id: Set(product.id.clone()),
                status: Set(UnitStatus::Available),
                order_id: Set(None),
                reserved_at: Set(None),
                sold_date: Set(None),
                production_date: Set(now),
                notes: Set(notes.clone()),
                created_at: Set(now),
                updated_at: Set(now),
            })
            .collect();

        let product_id = product.id.clone();
        let txn_ids = ids.clone();
        let (units, stock) = self
            .ctx
            .transaction(move |txn| {
                Box::pin(async move {
                    individual_product::Entity::insert_many(rows)
                        .exec_without_returning(txn)
                        .await
                        .map_err(ServiceError::from_write)?;
                    let mut units = individual_product::Entity::find()
                        .filter(individual_product::Column::Id.is_in(txn_ids.clone()))
                        .all(txn)
                        .await
                        .map_err(ServiceError::db_error)?;
                    // Allocation order; ids past 999 do not sort as text.
                    units.sort_by_key(|u| txn_ids.iter().position(|id| *id == u.id));
                    let stock = recompute_product_stock(txn, &product_id).await?;
                    Ok((units, stock))
                })
            })
            .await?;

        info!(product_id = %product.id, quantity, "Production completed");
        self.ctx.events.publish(Event::ProductionCompleted {
            product_id: product.id,
            unit_ids: ids,
        });
        notify_low_stock(&self.ctx.events, std::slice::from_ref(&stock));

        Ok(ProductionBatch { units, stock })
    }

    /// Units of one product, optionally filtered by status.
    #[instrument(skip(self))]
    pub async fn list_units(
        &self,
        product_id: &str,
        status: Option<UnitStatus>,
    ) -> Result<Vec<individual_product::Model>, ServiceError> {
        let db = self.ctx.db.clone();
        self.ctx
            .bounded(async {
                let mut query = individual_product::Entity::find()
                    .filter(individual_product::Column::ProductId.eq(product_id));
                if let Some(status) = status {
                    query = query.filter(individual_product::Column::Status.eq(status));
                }
                query
                    .order_by_asc(individual_product::Column::ProductionDate)
                    .order_by_asc(individual_product::Column::Id)
                    .all(db.as_ref())
                    .await
                    .map_err(ServiceError::db_error)
            })
            .await
    }
}
