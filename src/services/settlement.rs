//! Durable stock deductions for dispatched orders.
//!
//! Dispatch enqueues one `settlement_tasks` row per order in the same transaction as
//! the status change. A task is claimed `pending -> completed` inside the transaction
//! that applies the deductions, so an order is settled at most once.

use crate::entities::{
    order_item, product, settlement_task, MovementType, OrderItemType, SettlementStatus,
};
use crate::errors::ServiceError;
use crate::events::Event;
use crate::services::raw_materials::{
    apply_movement, find_material, notify_material_movement, AppliedMovement, MovementDraft,
};
use crate::services::sequence::{IdKind, SequenceService};
use crate::services::stock_ledger::{
    notify_low_stock, recompute_product_stock, ProductStockSnapshot,
};
use crate::services::ServiceContext;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const BASE_BACKOFF_SECS: i64 = 2;
const MAX_BACKOFF_SECS: i64 = 300;

/// Inserts a pending task for `order_id` unless one already exists. Returns whether a
/// new task was created.
pub(crate) async fn enqueue_settlement<C>(conn: &C, order_id: &str) -> Result<bool, ServiceError>
where
    C: ConnectionTrait,
{
    let now = Utc::now();
    let task = settlement_task::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id.to_string()),
        status: Set(SettlementStatus::Pending),
        attempts: Set(0),
        last_error: Set(None),
        available_at: Set(now),
        completed_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    };

    let inserted = settlement_task::Entity::insert(task)
        .on_conflict(
            OnConflict::column(settlement_task::Column::OrderId)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await
        .map_err(ServiceError::db_error)?;

    Ok(inserted > 0)
}

/// Delay before retry number `attempts`: `2^attempts` seconds capped at five minutes,
/// plus up to one second of jitter.
pub fn retry_delay(attempts: i32) -> ChronoDuration {
    let exponent = attempts.clamp(0, 16) as u32;
    let secs = BASE_BACKOFF_SECS.saturating_pow(exponent).min(MAX_BACKOFF_SECS);
    let jitter_ms: i64 = rand::thread_rng().gen_range(0..1000);
    ChronoDuration::seconds(secs) + ChronoDuration::milliseconds(jitter_ms)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Settled,
    /// Another run already completed (or gave up on) the task.
    Skipped,
    Retrying {
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
    },
    Failed {
        attempts: i32,
    },
}

/// Tally of one worker pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SettlementRun {
    pub settled: usize,
    pub skipped: usize,
    pub retrying: usize,
    pub failed: usize,
}

impl SettlementRun {
    fn record(&mut self, outcome: &SettlementOutcome) {
        match outcome {
            SettlementOutcome::Settled => self.settled += 1,
            SettlementOutcome::Skipped => self.skipped += 1,
            SettlementOutcome::Retrying { .. } => self.retrying += 1,
            SettlementOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone)]
struct BulkDeduction {
    product_id: String,
    quantity: i32,
}

#[derive(Debug, Clone)]
struct MaterialDeduction {
    raw_material_id: Option<String>,
    name: String,
    quantity: i32,
    movement_id: String,
}

#[derive(Debug, Default)]
struct Applied {
    products: Vec<ProductStockSnapshot>,
    materials: Vec<AppliedMovement>,
}

#[derive(Clone, Debug)]
pub struct SettlementService {
    ctx: ServiceContext,
    sequence: SequenceService,
    max_attempts: i32,
}

impl SettlementService {
    pub fn new(ctx: ServiceContext, sequence: SequenceService, max_attempts: i32) -> Self {
        Self {
            ctx,
            sequence,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Settlement task of one order, if it was ever dispatched.
    pub async fn find_task(
        &self,
        order_id: &str,
    ) -> Result<Option<settlement_task::Model>, ServiceError> {
        let db = self.ctx.db.clone();
        self.ctx
            .bounded(async {
                settlement_task::Entity::find()
                    .filter(settlement_task::Column::OrderId.eq(order_id))
                    .one(db.as_ref())
                    .await
                    .map_err(ServiceError::db_error)
            })
            .await
    }

    /// Settles one order now, ignoring back-off.
    #[instrument(skip(self))]
    pub async fn settle_order(&self, order_id: &str) -> Result<SettlementOutcome, ServiceError> {
        let task = self.find_task(order_id).await?.ok_or_else(|| {
            ServiceError::NotFound(format!("No settlement task for order {}", order_id))
        })?;
        if task.status != SettlementStatus::Pending {
            return Ok(SettlementOutcome::Skipped);
        }
        self.run_task(task).await
    }

    /// Runs every pending task whose back-off has expired, oldest first.
    #[instrument(skip(self))]
    pub async fn process_pending(&self, batch_size: u64) -> Result<SettlementRun, ServiceError> {
        let db = self.ctx.db.clone();
        let tasks = self
            .ctx
            .bounded(async {
                settlement_task::Entity::find()
                    .filter(settlement_task::Column::Status.eq(SettlementStatus::Pending))
                    .filter(settlement_task::Column::AvailableAt.lte(Utc::now()))
                    .order_by_asc(settlement_task::Column::AvailableAt)
                    .limit(batch_size)
                    .all(db.as_ref())
                    .await
                    .map_err(ServiceError::db_error)
            })
            .await?;

        let mut run = SettlementRun::default();
        for task in tasks {
            let order_id = task.order_id.clone();
            match self.run_task(task).await {
                Ok(outcome) => run.record(&outcome),
                Err(e) => {
                    warn!(%order_id, error = %e, "Could not record settlement outcome");
                    run.retrying += 1;
                }
            }
        }
        if run != SettlementRun::default() {
            debug!(?run, "Settlement pass finished");
        }
        Ok(run)
    }

    /// Polls for due tasks until the runtime shuts down.
    pub fn start_worker(self, poll_interval: Duration, batch_size: u64) -> JoinHandle<()> {
        info!(?poll_interval, batch_size, "Starting settlement worker");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.process_pending(batch_size).await {
                    error!(error = %e, "Settlement worker pass failed");
                }
            }
        })
    }

    async fn run_task(
        &self,
        task: settlement_task::Model,
    ) -> Result<SettlementOutcome, ServiceError> {
        match self.apply(&task).await {
            Ok(Some(applied)) => {
                counter!("carpet_inventory.settlement.completed", 1);
                info!(
                    order_id = %task.order_id,
                    products = applied.products.len(),
                    materials = applied.materials.len(),
                    "Order settled"
                );
                notify_low_stock(&self.ctx.events, &applied.products);
                for movement in &applied.materials {
                    notify_material_movement(&self.ctx.events, movement);
                }
                self.ctx
                    .events
                    .publish(Event::OrderSettled(task.order_id.clone()));
                Ok(SettlementOutcome::Settled)
            }
            Ok(None) => Ok(SettlementOutcome::Skipped),
            Err(e) => self.record_failure(task, e).await,
        }
    }

    /// Deductions plus the task claim, in one transaction. `None` when the task was
    /// no longer pending.
    async fn apply(&self, task: &settlement_task::Model) -> Result<Option<Applied>, ServiceError> {
        let db = self.ctx.db.clone();
        let order_id = task.order_id.clone();
        let items = self
            .ctx
            .bounded(async {
                order_item::Entity::find()
                    .filter(order_item::Column::OrderId.eq(order_id.as_str()))
                    .order_by_asc(order_item::Column::Id)
                    .all(db.as_ref())
                    .await
                    .map_err(ServiceError::db_error)
            })
            .await?;

        let bulk: Vec<BulkDeduction> = items
            .iter()
            .filter(|i| i.item_type == OrderItemType::Product)
            .filter(|i| i.selected_individual_products.is_empty())
            .filter_map(|i| {
                i.product_id.clone().map(|product_id| BulkDeduction {
                    product_id,
                    quantity: i.quantity,
                })
            })
            .collect();

        let material_items: Vec<&order_item::Model> = items
            .iter()
            .filter(|i| i.item_type == OrderItemType::RawMaterial)
            .collect();
        let movement_ids = self
            .sequence
            .next_many(IdKind::StockMovement, material_items.len())
            .await;
        let materials: Vec<MaterialDeduction> = material_items
            .into_iter()
            .zip(movement_ids)
            .map(|(item, movement_id)| MaterialDeduction {
                raw_material_id: item.raw_material_id.clone(),
                name: item.item_name.clone(),
                quantity: item.quantity,
                movement_id,
            })
            .collect();

        let task_id = task.id;
        self.ctx
            .transaction(move |txn| {
                Box::pin(async move {
                    let now = Utc::now();
                    let claimed = settlement_task::Entity::update_many()
                        .set(settlement_task::ActiveModel {
                            status: Set(SettlementStatus::Completed),
                            completed_at: Set(Some(now)),
                            last_error: Set(None),
                            updated_at: Set(now),
                            ..Default::default()
                        })
                        .filter(settlement_task::Column::Id.eq(task_id))
                        .filter(settlement_task::Column::Status.eq(SettlementStatus::Pending))
                        .exec(txn)
                        .await
                        .map_err(ServiceError::db_error)?;
                    if claimed.rows_affected == 0 {
                        return Ok(None);
                    }

                    let mut applied = Applied::default();
                    for deduction in bulk {
                        if let Some(snapshot) = deduct_base_quantity(txn, &deduction).await? {
                            applied.products.push(snapshot);
                        }
                    }
                    for deduction in materials {
                        let Some(material) = find_material(
                            txn,
                            deduction.raw_material_id.as_deref(),
                            &deduction.name,
                        )
                        .await?
                        else {
                            warn!(
                                %order_id,
                                material = %deduction.name,
                                "Raw material on order not found; skipping deduction"
                            );
                            continue;
                        };
                        let draft = MovementDraft {
                            reason: Some("Order dispatched".to_string()),
                            clamp_at_zero: true,
                            ..MovementDraft::new(
                                MovementType::Out,
                                Decimal::from(deduction.quantity),
                            )
                            .reference("order", &order_id)
                        };
                        applied.materials.push(
                            apply_movement(txn, material, deduction.movement_id, draft).await?,
                        );
                    }
                    Ok(Some(applied))
                })
            })
            .await
    }

    async fn record_failure(
        &self,
        task: settlement_task::Model,
        cause: ServiceError,
    ) -> Result<SettlementOutcome, ServiceError> {
        let attempts = task.attempts + 1;
        let order_id = task.order_id.clone();
        let message = cause.to_string();
        let now = Utc::now();
        let gave_up = attempts >= self.max_attempts;

        let mut active: settlement_task::ActiveModel = task.into();
        active.attempts = Set(attempts);
        active.last_error = Set(Some(message.clone()));
        active.updated_at = Set(now);
        let outcome = if gave_up {
            active.status = Set(SettlementStatus::Failed);
            SettlementOutcome::Failed { attempts }
        } else {
            let next_attempt_at = now + retry_delay(attempts);
            active.available_at = Set(next_attempt_at);
            SettlementOutcome::Retrying {
                attempts,
                next_attempt_at,
            }
        };

        let db = self.ctx.db.clone();
        self.ctx
            .write(async {
                active
                    .update(db.as_ref())
                    .await
                    .map_err(ServiceError::db_error)
            })
            .await?;

        if gave_up {
            counter!("carpet_inventory.settlement.failed", 1);
            error!(%order_id, attempts, error = %message, "Settlement abandoned");
            self.ctx.events.publish(Event::SettlementFailed {
                order_id,
                attempts,
                error: message,
            });
        } else {
            counter!("carpet_inventory.settlement.retries", 1);
            warn!(%order_id, attempts, error = %message, "Settlement failed; will retry");
        }
        Ok(outcome)
    }
}

/// `base_quantity -= quantity`, never below zero, then recompute.
async fn deduct_base_quantity<C>(
    conn: &C,
    deduction: &BulkDeduction,
) -> Result<Option<ProductStockSnapshot>, ServiceError>
where
    C: ConnectionTrait,
{
    let Some(product) = product::Entity::find_by_id(deduction.product_id.clone())
        .lock_exclusive()
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
    else {
        warn!(product_id = %deduction.product_id, "Product on order not found; skipping deduction");
        return Ok(None);
    };

    let remaining = product.base_quantity - deduction.quantity;
    if remaining < 0 {
        warn!(
            product_id = %product.id,
            base_quantity = product.base_quantity,
            quantity = deduction.quantity,
            "Deduction exceeds base quantity; clamping at zero"
        );
    }
    let mut active: product::ActiveModel = product.into();
    active.base_quantity = Set(remaining.max(0));
    active.update(conn).await.map_err(ServiceError::db_error)?;

    recompute_product_stock(conn, &deduction.product_id)
        .await
        .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_and_caps() {
        let first = retry_delay(1);
        assert!(first >= ChronoDuration::seconds(2) && first < ChronoDuration::seconds(3));

        let third = retry_delay(3);
        assert!(third >= ChronoDuration::seconds(8) && third < ChronoDuration::seconds(9));

        let capped = retry_delay(20);
        assert!(capped >= ChronoDuration::seconds(300) && capped < ChronoDuration::seconds(301));
    }

    #[test]
    fn run_tally() {
        let mut run = SettlementRun::default();
        run.record(&SettlementOutcome::Settled);
        run.record(&SettlementOutcome::Skipped);
        run.record(&SettlementOutcome::Failed { attempts: 5 });
        assert_eq!(
            run,
            SettlementRun {
                settled: 1,
                skipped: 1,
                retrying: 0,
                failed: 1
            }
        );
    }
}
