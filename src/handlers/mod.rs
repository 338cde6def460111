pub mod common;
pub mod orders;
pub mod products;
pub mod purchase_orders;
pub mod raw_materials;
pub mod suppliers;
pub mod units;

use crate::config::AppConfig;
use crate::services::{
    orders::OrderService, products::ProductService, purchase_orders::PurchaseOrderService,
    raw_materials::RawMaterialService, sequence::SequenceService,
    settlement::SettlementService, suppliers::SupplierService, units::UnitService,
    ServiceContext,
};
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone, Debug)]
pub struct AppServices {
    pub sequence: Arc<SequenceService>,
    pub products: Arc<ProductService>,
    pub units: Arc<UnitService>,
    pub orders: Arc<OrderService>,
    pub settlement: Arc<SettlementService>,
    pub raw_materials: Arc<RawMaterialService>,
    pub suppliers: Arc<SupplierService>,
    pub purchase_orders: Arc<PurchaseOrderService>,
}

impl AppServices {
    /// Wires every service onto one shared context.
    pub fn new(ctx: ServiceContext, config: &AppConfig) -> Self {
        let sequence = SequenceService::new(ctx.clone());
        let settlement = SettlementService::new(
            ctx.clone(),
            sequence.clone(),
            config.settlement_max_attempts,
        );

        Self {
            products: Arc::new(ProductService::new(ctx.clone(), sequence.clone())),
            units: Arc::new(UnitService::new(ctx.clone(), sequence.clone())),
            orders: Arc::new(OrderService::new(
                ctx.clone(),
                sequence.clone(),
                settlement.clone(),
                config.default_gst_rate,
            )),
            raw_materials: Arc::new(RawMaterialService::new(ctx.clone(), sequence.clone())),
            suppliers: Arc::new(SupplierService::new(ctx.clone(), sequence.clone())),
            purchase_orders: Arc::new(PurchaseOrderService::new(ctx, sequence.clone())),
            settlement: Arc::new(settlement),
            sequence: Arc::new(sequence),
        }
    }
}
