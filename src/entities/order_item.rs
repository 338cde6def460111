use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::ActiveValue::Set;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};

use super::individual_product::UnitStatus;

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
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderItemType {
    #[sea_orm(string_value = "product")]
    Product,
    #[sea_orm(string_value = "raw_material")]
    RawMaterial,
}

/// One unit attached to an order item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedUnit {
    pub individual_product_id: String,
    pub status: UnitStatus,
    pub allocated_at: DateTime<Utc>,
}

/// JSON list stored in `order_items.selected_individual_products`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct SelectedUnits(pub Vec<SelectedUnit>);

impl SelectedUnits {
    pub fn ids(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|u| u.individual_product_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Rewrites the recorded status of every selection.
    pub fn with_status(self, status: UnitStatus) -> Self {
        Self(
            self.0
                .into_iter()
                .map(|u| SelectedUnit { status, ..u })
                .collect(),
        )
    }
}

/// The `order_items` table.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "order_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub order_id: String,
    pub item_type: OrderItemType,
    pub product_id: Option<String>,
    pub raw_material_id: Option<String>,
    pub item_name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_price: Decimal,
    #[sea_orm(column_type = "Json")]
    pub selected_individual_products: SelectedUnits,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
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
