use crate::entities::supplier;
use crate::errors::ServiceError;
use crate::services::sequence::{IdKind, SequenceService};
use crate::services::{PageRequest, ServiceContext};
use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateSupplierRequest {
    #[validate(length(min = 1, max = 255, message = "Supplier name is required"))]
    pub name: String,
    #[validate(email)]
    pub contact_email: Option<String>,
    #[validate(length(max = 32))]
    pub phone: Option<String>,
}

/// Weighted running average of delivery ratings, one decimal place.
pub fn updated_rating(current: Decimal, total_orders: i32, order_rating: Decimal) -> Decimal {
    let orders = Decimal::from(total_orders.max(0));
    ((current * orders + order_rating) / (orders + Decimal::ONE))
        .round_dp_with_strategy(1, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Clone, Debug)]
pub struct SupplierService {
    ctx: ServiceContext,
    sequence: SequenceService,
}

impl SupplierService {
    pub fn new(ctx: ServiceContext, sequence: SequenceService) -> Self {
        Self { ctx, sequence }
    }

    /// New suppliers start unrated with no orders.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_supplier(
        &self,
        request: CreateSupplierRequest,
    ) -> Result<supplier::Model, ServiceError> {
        request.validate()?;
        let name = request.name.trim().to_string();
        if self.find_by_name(&name).await?.is_some() {
            return Err(ServiceError::Conflict(format!(
                "supplier {} already exists",
                name
            )));
        }

        let id = self.sequence.next(IdKind::Supplier).await;
        let now = Utc::now();
        let row = supplier::ActiveModel {
            id: Set(id),
            name: Set(name),
            contact_email: Set(request.contact_email),
            phone: Set(request.phone),
            rating: Set(Decimal::ZERO),
            total_orders: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let db = self.ctx.db.clone();
        let created = self
            .ctx
            .write(async { row.insert(db.as_ref()).await.map_err(ServiceError::from_write) })
            .await?;
        info!(supplier_id = %created.id, "Supplier created");
        Ok(created)
    }

    pub async fn get_supplier(&self, id: &str) -> Result<supplier::Model, ServiceError> {
        let db = self.ctx.db.clone();
        self.ctx
            .bounded(async {
                supplier::Entity::find_by_id(id.to_string())
                    .one(db.as_ref())
                    .await
                    .map_err(ServiceError::db_error)
            })
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Supplier {} not found", id)))
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<supplier::Model>, ServiceError> {
        let db = self.ctx.db.clone();
        self.ctx
            .bounded(async {
                supplier::Entity::find()
                    .filter(supplier::Column::Name.eq(name))
                    .one(db.as_ref())
                    .await
                    .map_err(ServiceError::db_error)
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn list_suppliers(
        &self,
        page: PageRequest,
    ) -> Result<(Vec<supplier::Model>, u64), ServiceError> {
        let db = self.ctx.db.clone();
        self.ctx
            .bounded(async {
                let paginator = supplier::Entity::find()
                    .order_by_asc(supplier::Column::Name)
                    .paginate(db.as_ref(), page.per_page);
                let total = paginator.num_items().await.map_err(ServiceError::db_error)?;
                let suppliers = paginator
                    .fetch_page(page.index())
                    .await
                    .map_err(ServiceError::db_error)?;
                Ok((suppliers, total))
            })
            .await
    }
}
