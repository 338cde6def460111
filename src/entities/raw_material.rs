use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::ActiveValue::Set;
use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Clone,
    Copy,
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
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum MaterialStatus {
    #[sea_orm(string_value = "out-of-stock")]
    OutOfStock,
    #[sea_orm(string_value = "low-stock")]
    LowStock,
    #[sea_orm(string_value = "in-stock")]
    InStock,
    #[sea_orm(string_value = "overstock")]
    Overstock,
    /// Overlay set while an approved purchase order is on its way.
    #[sea_orm(string_value = "in-transit")]
    InTransit,
}

impl MaterialStatus {
    pub fn needs_restock(self) -> bool {
        matches!(self, Self::OutOfStock | Self::LowStock)
    }
}

/// The `raw_materials` table.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "raw_materials")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    pub supplier_id: Option<String>,
    pub supplier_name: Option<String>,
    pub unit: String,
    pub current_stock: Decimal,
    pub min_threshold: Decimal,
    pub max_capacity: Decimal,
    pub reorder_point: Decimal,
    pub cost_per_unit: Decimal,
    pub total_value: Decimal,
    pub status: MaterialStatus,
    pub last_restocked: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::stock_movement::Entity")]
    StockMovement,
}

impl Related<super::stock_movement::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StockMovement.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(mut self, _db: &C, _insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        self.updated_at = Set(Utc::now());
        Ok(self)
    }
}
