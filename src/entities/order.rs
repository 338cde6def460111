use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::entity::prelude::*;
use sea_orm::ActiveValue::{self, Set};
use serde::{Deserialize, Serialize};

/// Enum representing the possible statuses of an order.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "accepted")]
    Accepted,
    #[sea_orm(string_value = "in_production")]
    InProduction,
    #[sea_orm(string_value = "ready")]
    Ready,
    #[sea_orm(string_value = "dispatched")]
    Dispatched,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl OrderStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Accepted => 1,
            Self::InProduction => 2,
            Self::Ready => 3,
            Self::Dispatched => 4,
            Self::Delivered => 5,
            Self::Cancelled => u8::MAX,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled)
    }

    /// Once dispatched, units are sold and the order can no longer change its selection.
    pub fn is_past_dispatch(self) -> bool {
        matches!(self, Self::Dispatched | Self::Delivered | Self::Cancelled)
    }

    /// Checks `self -> next`. Forward jumps are allowed; cancellation is only
    /// possible before dispatch. Same-status is handled by the caller as a no-op.
    pub fn check_transition(self, next: OrderStatus) -> Result<(), String> {
        if self.is_terminal() {
            return Err(format!("order is already {} and cannot move to {}", self, next));
        }
        if next == Self::Cancelled {
            if matches!(self, Self::Dispatched) {
                return Err("a dispatched order cannot be cancelled".to_string());
            }
            return Ok(());
        }
        if next.rank() <= self.rank() {
            return Err(format!("cannot move order from {} back to {}", self, next));
        }
        Ok(())
    }

    /// Workflow step shown for an order in this status. `None` keeps the current step.
    pub fn workflow_step(self) -> Option<WorkflowStep> {
        match self {
            Self::Pending => Some(WorkflowStep::Accept),
            Self::Accepted | Self::InProduction | Self::Ready => Some(WorkflowStep::Dispatch),
            Self::Dispatched | Self::Delivered => Some(WorkflowStep::Delivered),
            Self::Cancelled => None,
        }
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WorkflowStep {
    #[sea_orm(string_value = "accept")]
    Accept,
    #[sea_orm(string_value = "dispatch")]
    Dispatch,
    #[sea_orm(string_value = "delivered")]
    Delivered,
}

/// Derived monetary fields of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderTotals {
    pub gst_amount: Decimal,
    pub total_amount: Decimal,
    pub outstanding_amount: Decimal,
}

/// Two decimal places, halves away from zero.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Pure and idempotent; amounts are rounded to two decimal places.
pub fn compute_totals(
    subtotal: Decimal,
    gst_rate: Decimal,
    gst_included: bool,
    discount_amount: Decimal,
    paid_amount: Decimal,
) -> OrderTotals {
    let gst_amount = if gst_included {
        round_money(subtotal * gst_rate / Decimal::ONE_HUNDRED)
    } else {
        Decimal::ZERO
    };
    let total_amount = round_money(subtotal + gst_amount - discount_amount);
    let outstanding_amount = round_money(total_amount - paid_amount);

    OrderTotals {
        gst_amount,
        total_amount,
        outstanding_amount,
    }
}

/// The `orders` table.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
    pub order_number: String,
    pub customer_id: String,
    pub status: OrderStatus,
    pub workflow_step: WorkflowStep,
    pub subtotal: Decimal,
    pub gst_rate: Decimal,
    pub gst_included: bool,
    pub gst_amount: Decimal,
    pub discount_amount: Decimal,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub outstanding_amount: Decimal,
    pub notes: Option<String>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn totals(&self) -> OrderTotals {
        compute_totals(
            self.subtotal,
            self.gst_rate,
            self.gst_included,
            self.discount_amount,
            self.paid_amount,
        )
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItem,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
    }
}

fn current<V>(value: &ActiveValue<V>) -> Option<V>
where
    V: Into<sea_orm::Value> + Clone,
{
    match value {
        ActiveValue::Set(v) | ActiveValue::Unchanged(v) => Some(v.clone()),
        ActiveValue::NotSet => None,
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    /// Keeps `gst_amount`, `total_amount` and `outstanding_amount` consistent with
    /// their inputs on every save.
    async fn before_save<C>(mut self, _db: &C, _insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        if let (Some(subtotal), Some(rate), Some(included), Some(discount), Some(paid)) = (
            current(&self.subtotal),
            current(&self.gst_rate),
            current(&self.gst_included),
            current(&self.discount_amount),
            current(&self.paid_amount),
        ) {
            let totals = compute_totals(subtotal, rate, included, discount, paid);
            self.gst_amount = Set(totals.gst_amount);
            self.total_amount = Set(totals.total_amount);
            self.outstanding_amount = Set(totals.outstanding_amount);
        }
        self.updated_at = Set(Utc::now());
        Ok(self)
    }
}
