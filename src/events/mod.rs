use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::entities::{MaterialStatus, OrderStatus, ProductStatus, PurchaseOrderStatus};

/// Notifications published by the services. Delivery is fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Production and units
    ProductionCompleted {
        product_id: String,
        unit_ids: Vec<String>,
    },
    UnitsReserved {
        order_id: String,
        unit_ids: Vec<String>,
    },
    UnitsReleased {
        unit_ids: Vec<String>,
    },
    ProductLowStock {
        product_id: String,
        current_stock: i32,
        status: ProductStatus,
    },

    // Orders
    OrderCreated(String),
    OrderStatusChanged {
        order_id: String,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    PaymentRecorded {
        order_id: String,
        amount: Decimal,
        outstanding_amount: Decimal,
    },
    OrderSettled(String),
    SettlementFailed {
        order_id: String,
        attempts: i32,
        error: String,
    },

    // Raw materials and procurement
    MaterialLowStock {
        material_id: String,
        name: String,
        current_stock: Decimal,
        status: MaterialStatus,
    },
    MaterialRestocked {
        material_id: String,
        purchase_order_id: String,
        quantity: Decimal,
        new_stock: Decimal,
        restocked_at: DateTime<Utc>,
    },
    PurchaseOrderStatusChanged {
        purchase_order_id: String,
        old_status: PurchaseOrderStatus,
        new_status: PurchaseOrderStatus,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a bounded channel and wraps its sending half.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously, waiting for channel capacity.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Publishes without waiting. A full or closed channel drops the event with a warning.
    pub fn publish(&self, event: Event) {
        if let Err(e) = self.sender.try_send(event) {
            counter!("carpet_inventory.events.dropped", 1);
            warn!(error = %e, "Dropping notification event");
        }
    }
}

/// Consumes events until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        counter!("carpet_inventory.events.processed", 1);
        match event {
            Event::ProductionCompleted {
                product_id,
                unit_ids,
            } => {
                info!(%product_id, units = unit_ids.len(), "Production completed");
            }
            Event::UnitsReserved { order_id, unit_ids } => {
                info!(%order_id, ?unit_ids, "Units reserved");
            }
            Event::UnitsReleased { unit_ids } => {
                info!(?unit_ids, "Units released");
            }
            Event::ProductLowStock {
                product_id,
                current_stock,
                status,
            } => {
                warn!(%product_id, current_stock, %status, "Product stock is low");
            }
            Event::OrderCreated(order_id) => {
                info!(%order_id, "Order created");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(%order_id, %old_status, %new_status, "Order status changed");
            }
            Event::PaymentRecorded {
                order_id,
                amount,
                outstanding_amount,
            } => {
                info!(%order_id, %amount, %outstanding_amount, "Payment recorded");
            }
            Event::OrderSettled(order_id) => {
                info!(%order_id, "Order stock deductions settled");
            }
            Event::SettlementFailed {
                order_id,
                attempts,
                error,
            } => {
                error!(%order_id, attempts, %error, "Order settlement failed");
            }
            Event::MaterialLowStock {
                material_id,
                name,
                current_stock,
                status,
            } => {
                warn!(%material_id, %name, %current_stock, %status, "Raw material stock is low");
            }
            Event::MaterialRestocked {
                material_id,
                purchase_order_id,
                quantity,
                new_stock,
                restocked_at,
            } => {
                info!(
                    %material_id,
                    %purchase_order_id,
                    %quantity,
                    %new_stock,
                    %restocked_at,
                    "Raw material restocked"
                );
            }
            Event::PurchaseOrderStatusChanged {
                purchase_order_id,
                old_status,
                new_status,
            } => {
                info!(%purchase_order_id, %old_status, %new_status, "Purchase order status changed");
            }
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn processor_drains_and_stops_when_senders_drop() {
        let (sender, rx) = EventSender::channel(8);
        let handle = tokio::spawn(process_events(rx));

        sender.publish(Event::OrderCreated("ORD-240101-001".into()));
        sender
            .send(Event::UnitsReleased {
                unit_ids: vec!["QR-240101-001".into()],
            })
            .await
            .unwrap();
        drop(sender);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn publish_on_full_channel_is_dropped_silently() {
        let (sender, mut rx) = EventSender::channel(1);
        sender.publish(Event::OrderSettled("ORD-1".into()));
        sender.publish(Event::OrderSettled("ORD-2".into()));

        assert!(matches!(rx.recv().await, Some(Event::OrderSettled(id)) if id == "ORD-1"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_on_closed_channel_does_not_fail() {
        let (sender, rx) = EventSender::channel(1);
        drop(rx);
        sender.publish(Event::OrderCreated("ORD-1".into()));
        assert!(sender.send(Event::OrderCreated("ORD-2".into())).await.is_err());
    }
}
