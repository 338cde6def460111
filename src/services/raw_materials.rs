use crate::entities::order::round_money;
use crate::entities::{raw_material, stock_movement, supplier, MaterialStatus, MovementType};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::sequence::{IdKind, SequenceService};
use crate::services::stock_ledger::recompute_material_status;
use crate::services::{ensure_non_negative, PageRequest, ServiceContext};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateRawMaterialRequest {
    #[validate(length(min = 1, max = 255, message = "Material name is required"))]
    pub name: String,
    pub supplier_id: Option<String>,
    pub supplier_name: Option<String>,
    #[validate(length(min = 1, max = 16, message = "Unit is required"))]
    pub unit: String,
    #[serde(default)]
    pub current_stock: Decimal,
    #[serde(default)]
    pub min_threshold: Decimal,
    pub max_capacity: Decimal,
    pub reorder_point: Option<Decimal>,
    #[serde(default)]
    pub cost_per_unit: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AdjustStockRequest {
    pub movement_type: MovementType,
    /// Amount moved; for `adjustment` the absolute new level.
    pub quantity: Decimal,
    #[validate(length(max = 500))]
    pub reason: Option<String>,
    pub reference_id: Option<String>,
    pub reference_type: Option<String>,
    /// Purchase cost of incoming stock; becomes the material's cost per unit.
    pub unit_cost: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StockAdjustment {
    pub material: raw_material::Model,
    pub movement: stock_movement::Model,
}

/// Inputs of one stock movement applied inside a caller's transaction.
#[derive(Debug, Clone)]
pub(crate) struct MovementDraft {
    pub movement_type: MovementType,
    pub quantity: Decimal,
    pub unit_cost: Option<Decimal>,
    pub reason: Option<String>,
    pub reference_id: Option<String>,
    pub reference_type: Option<String>,
    /// Deduct what is there instead of rejecting an outgoing movement larger than stock.
    pub clamp_at_zero: bool,
    /// Keep an `in-transit` status instead of deriving it from the new level.
    pub preserve_in_transit: bool,
}

impl MovementDraft {
    pub fn new(movement_type: MovementType, quantity: Decimal) -> Self {
        Self {
            movement_type,
            quantity,
            unit_cost: None,
            reason: None,
            reference_id: None,
            reference_type: None,
            clamp_at_zero: false,
            preserve_in_transit: true,
        }
    }

    pub fn reference(mut self, reference_type: &str, reference_id: &str) -> Self {
        self.reference_type = Some(reference_type.to_string());
        self.reference_id = Some(reference_id.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct AppliedMovement {
    pub material: raw_material::Model,
    pub movement: stock_movement::Model,
    pub previous_status: MaterialStatus,
}

impl AppliedMovement {
    fn entered_low_stock(&self) -> bool {
        self.material.status != self.previous_status && self.material.status.needs_restock()
    }
}

/// Status a material should carry at `current_stock`, keeping `in-transit` when asked to.
pub(crate) fn next_material_status(
    material: &raw_material::Model,
    current_stock: Decimal,
    preserve_in_transit: bool,
) -> MaterialStatus {
    if preserve_in_transit && material.status == MaterialStatus::InTransit {
        return MaterialStatus::InTransit;
    }
    recompute_material_status(current_stock, material.min_threshold, material.max_capacity)
}

/// Applies a movement to `material` and appends the matching stock movement row.
/// `material` must have been read with `lock_exclusive` in the same transaction.
pub(crate) async fn apply_movement<C>(
    conn: &C,
    material: raw_material::Model,
    movement_id: String,
    draft: MovementDraft,
) -> Result<AppliedMovement, ServiceError>
where
    C: ConnectionTrait,
{
    let previous_stock = material.current_stock;
    let quantity = draft.quantity;

    match draft.movement_type {
        MovementType::Adjustment => ensure_non_negative("quantity", quantity)?,
        _ if quantity <= Decimal::ZERO => {
            return Err(ServiceError::ValidationError(
                "quantity must be greater than zero".to_string(),
            ))
        }
        _ => {}
    }

    let new_stock = match draft.movement_type {
        MovementType::In => previous_stock + quantity,
        MovementType::Adjustment => quantity,
        MovementType::Out | MovementType::Transfer => {
            if quantity > previous_stock {
                if !draft.clamp_at_zero {
                    return Err(ServiceError::ValidationError(format!(
                        "insufficient stock for {}: {} available, {} requested",
                        material.name, previous_stock, quantity
                    )));
                }
                warn!(
                    material_id = %material.id,
                    %previous_stock,
                    %quantity,
                    "Deduction exceeds stock; clamping at zero"
                );
                Decimal::ZERO
            } else {
                previous_stock - quantity
            }
        }
    };

    let cost_per_unit = match (draft.movement_type, draft.unit_cost) {
        (MovementType::In, Some(cost)) => cost,
        _ => material.cost_per_unit,
    };
    let unit_cost = draft.unit_cost.unwrap_or(material.cost_per_unit);
    let status = next_material_status(&material, new_stock, draft.preserve_in_transit);
    let previous_status = material.status;
    let now = Utc::now();

    let movement = stock_movement::ActiveModel {
        id: Set(movement_id),
        raw_material_id: Set(material.id.clone()),
        material_name: Set(material.name.clone()),
        movement_type: Set(draft.movement_type),
        quantity: Set(quantity),
        previous_stock: Set(previous_stock),
        new_stock: Set(new_stock),
        unit_cost: Set(Some(unit_cost)),
        total_cost: Set(Some(round_money(unit_cost * quantity))),
        reason: Set(draft.reason),
        reference_id: Set(draft.reference_id),
        reference_type: Set(draft.reference_type),
        created_at: Set(now),
    };

    let restocked = draft.movement_type == MovementType::In;
    let mut active: raw_material::ActiveModel = material.into();
    active.current_stock = Set(new_stock);
    active.cost_per_unit = Set(cost_per_unit);
    active.total_value = Set(round_money(new_stock * cost_per_unit));
    active.status = Set(status);
    if restocked {
        active.last_restocked = Set(Some(now));
    }

    let material = active.update(conn).await.map_err(ServiceError::db_error)?;
    let movement = movement.insert(conn).await.map_err(ServiceError::db_error)?;

    Ok(AppliedMovement {
        material,
        movement,
        previous_status,
    })
}

/// Looks a material up by id, falling back to an exact name match. The row is locked
/// for the rest of the caller's transaction.
pub(crate) async fn find_material<C>(
    conn: &C,
    id: Option<&str>,
    name: &str,
) -> Result<Option<raw_material::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    if let Some(id) = id {
        let found = raw_material::Entity::find_by_id(id.to_string())
            .lock_exclusive()
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?;
        if found.is_some() {
            return Ok(found);
        }
    }

    raw_material::Entity::find()
        .filter(raw_material::Column::Name.eq(name))
        .order_by_asc(raw_material::Column::CreatedAt)
        .lock_exclusive()
        .one(conn)
        .await
        .map_err(ServiceError::db_error)
}

pub(crate) fn notify_material_movement(events: &EventSender, applied: &AppliedMovement) {
    if applied.entered_low_stock() {
        events.publish(Event::MaterialLowStock {
            material_id: applied.material.id.clone(),
            name: applied.material.name.clone(),
            current_stock: applied.material.current_stock,
            status: applied.material.status,
        });
    }
}

#[derive(Clone, Debug)]
pub struct RawMaterialService {
    ctx: ServiceContext,
    sequence: SequenceService,
}

impl RawMaterialService {
    pub fn new(ctx: ServiceContext, sequence: SequenceService) -> Self {
        Self { ctx, sequence }
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_material(
        &self,
        request: CreateRawMaterialRequest,
    ) -> Result<raw_material::Model, ServiceError> {
        request.validate()?;
        ensure_non_negative("current_stock", request.current_stock)?;
        ensure_non_negative("min_threshold", request.min_threshold)?;
        ensure_non_negative("cost_per_unit", request.cost_per_unit)?;
        if request.max_capacity < request.min_threshold {
            return Err(ServiceError::ValidationError(
                "max_capacity must not be below min_threshold".to_string(),
            ));
        }

        let db = self.ctx.db.clone();
        let supplier = match request.supplier_id.as_deref() {
            Some(supplier_id) => {
                let found = self
                    .ctx
                    .bounded(async {
                        supplier::Entity::find_by_id(supplier_id.to_string())
                            .one(db.as_ref())
                            .await
                            .map_err(ServiceError::db_error)
                    })
                    .await?;
                Some(found.ok_or_else(|| {
                    ServiceError::ValidationError(format!("Unknown supplier {}", supplier_id))
                })?)
            }
            None => None,
        };
        let supplier_name = supplier
            .as_ref()
            .map(|s| s.name.clone())
            .or(request.supplier_name);

        let id = self.sequence.next(IdKind::RawMaterial).await;
        let now = Utc::now();
        let status = recompute_material_status(
            request.current_stock,
            request.min_threshold,
            request.max_capacity,
        );

        let material = raw_material::ActiveModel {
            id: Set(id),
            name: Set(request.name),
            supplier_id: Set(supplier.map(|s| s.id)),
            supplier_name: Set(supplier_name),
            unit: Set(request.unit),
            current_stock: Set(request.current_stock),
            min_threshold: Set(request.min_threshold),
            max_capacity: Set(request.max_capacity),
            reorder_point: Set(request.reorder_point.unwrap_or(request.min_threshold)),
            cost_per_unit: Set(request.cost_per_unit),
            total_value: Set(round_money(request.current_stock * request.cost_per_unit)),
            status: Set(status),
            last_restocked: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let created = self
            .ctx
            .write(async {
                material
                    .insert(db.as_ref())
                    .await
                    .map_err(ServiceError::from_write)
            })
            .await?;

        info!(material_id = %created.id, "Raw material created");
        Ok(created)
    }

    #[instrument(skip(self))]
    pub async fn get_material(&self, id: &str) -> Result<raw_material::Model, ServiceError> {
        let db = self.ctx.db.clone();
        self.ctx
            .bounded(async {
                raw_material::Entity::find_by_id(id.to_string())
                    .one(db.as_ref())
                    .await
                    .map_err(ServiceError::db_error)
            })
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Raw material {} not found", id)))
    }

    #[instrument(skip(self))]
    pub async fn list_materials(
        &self,
        status: Option<MaterialStatus>,
        page: PageRequest,
    ) -> Result<(Vec<raw_material::Model>, u64), ServiceError> {
        let db = self.ctx.db.clone();
        self.ctx
            .bounded(async {
                let mut query = raw_material::Entity::find();
                if let Some(status) = status {
                    query = query.filter(raw_material::Column::Status.eq(status));
                }
                let paginator = query
                    .order_by_asc(raw_material::Column::Name)
                    .paginate(db.as_ref(), page.per_page);
                let total = paginator.num_items().await.map_err(ServiceError::db_error)?;
                let items = paginator
                    .fetch_page(page.index())
                    .await
                    .map_err(ServiceError::db_error)?;
                Ok((items, total))
            })
            .await
    }

    /// `in` adds, `out`/`transfer` subtract without going below zero, `adjustment`
    /// sets an absolute level. Every call appends one stock movement.
    #[instrument(skip(self, request), fields(movement_type = %request.movement_type))]
    pub async fn adjust_stock(
        &self,
        id: &str,
        request: AdjustStockRequest,
    ) -> Result<StockAdjustment, ServiceError> {
        request.validate()?;
        if let Some(cost) = request.unit_cost {
            ensure_non_negative("unit_cost", cost)?;
        }
        // Surface NotFound before burning a movement id.
        self.get_material(id).await?;

        let movement_id = self.sequence.next(IdKind::StockMovement).await;
        let material_id = id.to_string();
        let draft = MovementDraft {
            unit_cost: request.unit_cost,
            reason: request.reason,
            reference_id: request.reference_id,
            reference_type: request.reference_type,
            ..MovementDraft::new(request.movement_type, request.quantity)
        };

        let applied = self
            .ctx
            .transaction(move |txn| {
                Box::pin(async move {
                    let material = raw_material::Entity::find_by_id(material_id.clone())
                        .lock_exclusive()
                        .one(txn)
                        .await
                        .map_err(ServiceError::db_error)?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!(
                                "Raw material {} not found",
                                material_id
                            ))
                        })?;
                    apply_movement(txn, material, movement_id, draft).await
                })
            })
            .await?;

        notify_material_movement(&self.ctx.events, &applied);
        info!(
            material_id = %applied.material.id,
            previous_stock = %applied.movement.previous_stock,
            new_stock = %applied.movement.new_stock,
            "Raw material stock adjusted"
        );

        Ok(StockAdjustment {
            material: applied.material,
            movement: applied.movement,
        })
    }

    /// Movements of one material, newest first.
    #[instrument(skip(self))]
    pub async fn list_movements(
        &self,
        material_id: &str,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        self.get_material(material_id).await?;
        let db = self.ctx.db.clone();
        self.ctx
            .bounded(async {
                stock_movement::Entity::find()
                    .filter(stock_movement::Column::RawMaterialId.eq(material_id))
                    .order_by_desc(stock_movement::Column::CreatedAt)
                    .order_by_desc(stock_movement::Column::Id)
                    .all(db.as_ref())
                    .await
                    .map_err(ServiceError::db_error)
            })
            .await
    }
}
