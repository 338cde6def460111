use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::ActiveValue::Set;
use serde::{Deserialize, Serialize};

/// Stock band of a product, derived by the stock ledger.
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
pub enum ProductStatus {
    #[sea_orm(string_value = "out-of-stock")]
    OutOfStock,
    #[sea_orm(string_value = "low-stock")]
    LowStock,
    #[sea_orm(string_value = "in-stock")]
    InStock,
}

impl ProductStatus {
    /// `out-of-stock` at zero, `low-stock` at or below the minimum level.
    pub fn from_levels(current_stock: i32, min_stock_level: i32) -> Self {
        if current_stock <= 0 {
            Self::OutOfStock
        } else if current_stock <= min_stock_level {
            Self::LowStock
        } else {
            Self::InStock
        }
    }
}

/// The `products` table.
///
/// `current_stock` and `individual_products_count` are derived counters and are only
/// written by `services::stock_ledger`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    pub length: Option<Decimal>,
    pub width: Option<Decimal>,
    pub dimension_unit: Option<String>,
    pub weight: Option<Decimal>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub unit_price: Decimal,
    /// Bulk quantity for products that are not individually tracked.
    pub base_quantity: i32,
    pub current_stock: i32,
    pub individual_products_count: i32,
    pub individual_stock_tracking: bool,
    pub min_stock_level: i32,
    pub status: ProductStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::individual_product::Entity")]
    IndividualProduct,
}

impl Related<super::individual_product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::IndividualProduct.def()
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_bands() {
        assert_eq!(ProductStatus::from_levels(0, 2), ProductStatus::OutOfStock);
        assert_eq!(ProductStatus::from_levels(2, 2), ProductStatus::LowStock);
        assert_eq!(ProductStatus::from_levels(3, 2), ProductStatus::InStock);
    }

    #[test]
    fn status_text_round_trips_through_strum() {
        assert_eq!(ProductStatus::LowStock.to_string(), "low-stock");
        assert_eq!(
            ProductStatus::from_str("out-of-stock").unwrap(),
            ProductStatus::OutOfStock
        );
    }
}
