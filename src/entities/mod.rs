pub mod id_sequence;
pub mod individual_product;
pub mod order;
pub mod order_item;
pub mod product;
pub mod purchase_order;
pub mod purchase_order_item;
pub mod raw_material;
pub mod settlement_task;
pub mod stock_movement;
pub mod supplier;

pub use individual_product::UnitStatus;
pub use order::{OrderStatus, WorkflowStep};
pub use order_item::{OrderItemType, SelectedUnit, SelectedUnits};
pub use product::ProductStatus;
pub use purchase_order::PurchaseOrderStatus;
pub use raw_material::MaterialStatus;
pub use settlement_task::SettlementStatus;
pub use stock_movement::MovementType;
