use crate::entities::{product, ProductStatus};
use crate::errors::ServiceError;
use crate::services::sequence::{IdKind, SequenceService};
use crate::services::stock_ledger::{ProductStockSnapshot, StockLedger};
use crate::services::{ensure_non_negative, PageRequest, ServiceContext};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use validator::Validate;

fn default_tracking() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateProductRequest {
    #[validate(length(min = 1, max = 255, message = "Product name is required"))]
    pub name: String,
    pub length: Option<Decimal>,
    pub width: Option<Decimal>,
    #[validate(length(max = 16))]
    pub dimension_unit: Option<String>,
    pub weight: Option<Decimal>,
    #[validate(length(max = 100))]
    pub category: Option<String>,
    #[validate(length(max = 100))]
    pub subcategory: Option<String>,
    #[serde(default)]
    pub unit_price: Decimal,
    /// Opening bulk quantity; only meaningful without individual tracking.
    #[serde(default)]
    #[validate(range(min = 0))]
    pub base_quantity: i32,
    #[serde(default = "default_tracking")]
    pub individual_stock_tracking: bool,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub min_stock_level: i32,
}

/// Product catalogue. Stock counters are owned by the stock ledger.
#[derive(Clone, Debug)]
pub struct ProductService {
    ctx: ServiceContext,
    sequence: SequenceService,
    ledger: StockLedger,
}

impl ProductService {
    pub fn new(ctx: ServiceContext, sequence: SequenceService) -> Self {
        let ledger = StockLedger::new(ctx.clone());
        Self {
            ctx,
            sequence,
            ledger,
        }
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_product(
        &self,
        request: CreateProductRequest,
    ) -> Result<product::Model, ServiceError> {
        request.validate()?;
        ensure_non_negative("unit_price", request.unit_price)?;
        for (field, value) in [
            ("length", request.length),
            ("width", request.width),
            ("weight", request.weight),
        ] {
            if let Some(value) = value {
                ensure_non_negative(field, value)?;
            }
        }

        // Tracked products start empty; units arrive through production.
        let current_stock = if request.individual_stock_tracking {
            0
        } else {
            request.base_quantity
        };
        let status = ProductStatus::from_levels(current_stock, request.min_stock_level);

        let id = self.sequence.next(IdKind::Product).await;
        let now = Utc::now();
        let row = product::ActiveModel {
            id: Set(id),
            name: Set(request.name),
            length: Set(request.length),
            width: Set(request.width),
            dimension_unit: Set(request.dimension_unit),
            weight: Set(request.weight),
            category: Set(request.category),
            subcategory: Set(request.subcategory),
            unit_price: Set(request.unit_price),
            base_quantity: Set(request.base_quantity),
            current_stock: Set(current_stock),
            individual_products_count: Set(0),
            individual_stock_tracking: Set(request.individual_stock_tracking),
            min_stock_level: Set(request.min_stock_level),
            status: Set(status),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let db = self.ctx.db.clone();
        let created = self
            .ctx
            .write(async { row.insert(db.as_ref()).await.map_err(ServiceError::from_write) })
            .await?;
        info!(product_id = %created.id, tracked = created.individual_stock_tracking, "Product created");
        Ok(created)
    }

    #[instrument(skip(self))]
    pub async fn get_product(&self, id: &str) -> Result<product::Model, ServiceError> {
        let db = self.ctx.db.clone();
        self.ctx
            .bounded(async {
                product::Entity::find_by_id(id.to_string())
                    .one(db.as_ref())
                    .await
                    .map_err(ServiceError::db_error)
            })
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", id)))
    }

    #[instrument(skip(self))]
    pub async fn list_products(
        &self,
        status: Option<ProductStatus>,
        page: PageRequest,
    ) -> Result<(Vec<product::Model>, u64), ServiceError> {
        let db = self.ctx.db.clone();
        self.ctx
            .bounded(async {
                let mut query = product::Entity::find();
                if let Some(status) = status {
                    query = query.filter(product::Column::Status.eq(status));
                }
                let paginator = query
                    .order_by_asc(product::Column::Name)
                    .paginate(db.as_ref(), page.per_page);
                let total = paginator.num_items().await.map_err(ServiceError::db_error)?;
                let products = paginator
                    .fetch_page(page.index())
                    .await
                    .map_err(ServiceError::db_error)?;
                Ok((products, total))
            })
            .await
    }

    /// Rebuilds the derived counters of one product from its units.
    pub async fn recompute_stock(&self, id: &str) -> Result<ProductStockSnapshot, ServiceError> {
        self.ledger.recompute(id).await
    }
}
