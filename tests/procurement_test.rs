mod common;

use assert_matches::assert_matches;
use carpet_inventory::{
    entities::{stock_movement, MaterialStatus, MovementType, PurchaseOrderStatus},
    errors::ServiceError,
    services::{
        purchase_orders::{
            CreatePurchaseOrderItemRequest, CreatePurchaseOrderRequest,
            UpdatePurchaseOrderStatusRequest,
        },
        raw_materials::AdjustStockRequest,
    },
};
use common::TestApp;
use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, Set};

fn purchase_request(
    supplier_id: &str,
    material_id: &str,
    quantity: Decimal,
    unit_price: Decimal,
) -> CreatePurchaseOrderRequest {
    CreatePurchaseOrderRequest {
        supplier_id: Some(supplier_id.to_string()),
        supplier_name: None,
        items: vec![CreatePurchaseOrderItemRequest {
            raw_material_id: Some(material_id.to_string()),
            material_name: None,
            quantity,
            unit_price,
        }],
        expected_delivery: None,
        notes: None,
        status: None,
    }
}

fn status(status: PurchaseOrderStatus, rating: Option<Decimal>) -> UpdatePurchaseOrderStatusRequest {
    UpdatePurchaseOrderStatusRequest {
        status,
        delivery_rating: rating,
    }
}

#[tokio::test]
async fn delivery_restocks_materials_and_rates_the_supplier() {
    let app = TestApp::new().await;
    let supplier = app.create_supplier("Anatolia Wool").await;
    let material = app
        .create_material("Merino yarn", Some(supplier.id.clone()), dec!(50))
        .await;
    let service = &app.state.services.purchase_orders;

    let created = service
        .create_purchase_order(purchase_request(&supplier.id, &material.id, dec!(12.5), dec!(4)))
        .await
        .unwrap();
    assert!(created.purchase_order.id.starts_with("PO-"));
    assert_eq!(created.purchase_order.status, PurchaseOrderStatus::Draft);
    assert_eq!(created.purchase_order.supplier_name, "Anatolia Wool");
    assert_eq!(created.purchase_order.total_amount.round_dp(2), dec!(50));
    let po_id = created.purchase_order.id.clone();

    service
        .update_status(&po_id, status(PurchaseOrderStatus::Approved, None))
        .await
        .unwrap();
    let in_transit = app
        .state
        .services
        .raw_materials
        .get_material(&material.id)
        .await
        .unwrap();
    assert_eq!(in_transit.status, MaterialStatus::InTransit);
    assert_eq!(in_transit.current_stock.round_dp(2), dec!(50));

    let delivered = service
        .update_status(&po_id, status(PurchaseOrderStatus::Delivered, Some(dec!(4))))
        .await
        .unwrap();
    assert_eq!(delivered.purchase_order.status, PurchaseOrderStatus::Delivered);
    assert!(delivered.purchase_order.delivered_at.is_some());
    assert!(delivered.purchase_order.shipped_at.is_some());

    let restocked = app
        .state
        .services
        .raw_materials
        .get_material(&material.id)
        .await
        .unwrap();
    assert_eq!(restocked.current_stock.round_dp(2), dec!(62.5));
    assert_eq!(restocked.cost_per_unit.round_dp(2), dec!(4));
    assert_eq!(restocked.status, MaterialStatus::InStock);
    assert!(restocked.last_restocked.is_some());

    let movements = app
        .state
        .services
        .raw_materials
        .list_movements(&material.id)
        .await
        .unwrap();
    let receipt = movements
        .iter()
        .find(|m| m.reference_id.as_deref() == Some(po_id.as_str()))
        .expect("receipt movement");
    assert_eq!(receipt.movement_type, MovementType::In);
    assert_eq!(receipt.reference_type.as_deref(), Some("purchase_order"));
    assert_eq!(receipt.previous_stock.round_dp(2), dec!(50));
    assert_eq!(receipt.new_stock.round_dp(2), dec!(62.5));

    let rated = app.state.services.suppliers.get_supplier(&supplier.id).await.unwrap();
    assert_eq!(rated.total_orders, 1);
    assert_eq!(rated.rating.round_dp(1), dec!(4.0));

    let second = service
        .create_purchase_order(purchase_request(&supplier.id, &material.id, dec!(1), dec!(4)))
        .await
        .unwrap();
    service
        .update_status(
            &second.purchase_order.id,
            status(PurchaseOrderStatus::Delivered, Some(dec!(3))),
        )
        .await
        .unwrap();
    let rated = app.state.services.suppliers.get_supplier(&supplier.id).await.unwrap();
    assert_eq!(rated.total_orders, 2);
    assert_eq!(rated.rating.round_dp(1), dec!(3.5));
}

#[tokio::test]
async fn delivered_purchase_orders_are_final() {
    let app = TestApp::new().await;
    let supplier = app.create_supplier("Jaipur Fibres").await;
    let material = app.create_material("Jute", Some(supplier.id.clone()), dec!(20)).await;
    let service = &app.state.services.purchase_orders;

    let created = service
        .create_purchase_order(purchase_request(&supplier.id, &material.id, dec!(5), dec!(1)))
        .await
        .unwrap();
    let po_id = created.purchase_order.id.clone();
    service
        .update_status(&po_id, status(PurchaseOrderStatus::Delivered, None))
        .await
        .unwrap();

    assert_matches!(
        service
            .update_status(&po_id, status(PurchaseOrderStatus::Cancelled, None))
            .await,
        Err(ServiceError::ValidationError(_))
    );
    let rated = app.state.services.suppliers.get_supplier(&supplier.id).await.unwrap();
    assert_eq!(rated.rating.round_dp(1), dec!(5.0));
}

#[tokio::test]
async fn cancelling_an_approved_order_clears_in_transit() {
    let app = TestApp::new().await;
    let supplier = app.create_supplier("Kerman Dyes").await;
    let material = app.create_material("Indigo", Some(supplier.id.clone()), dec!(5)).await;
    assert_eq!(material.status, MaterialStatus::LowStock);
    let service = &app.state.services.purchase_orders;

    let created = service
        .create_purchase_order(purchase_request(&supplier.id, &material.id, dec!(30), dec!(2)))
        .await
        .unwrap();
    let po_id = created.purchase_order.id.clone();
    service
        .update_status(&po_id, status(PurchaseOrderStatus::Shipped, None))
        .await
        .unwrap();
    let cancelled = service
        .update_status(&po_id, status(PurchaseOrderStatus::Cancelled, None))
        .await
        .unwrap();
    assert!(cancelled.purchase_order.cancelled_at.is_some());

    let material = app
        .state
        .services
        .raw_materials
        .get_material(&material.id)
        .await
        .unwrap();
    assert_eq!(material.status, MaterialStatus::LowStock);
    assert_eq!(material.current_stock.round_dp(2), dec!(5));
}

#[tokio::test]
async fn purchase_order_validation() {
    let app = TestApp::new().await;
    let supplier = app.create_supplier("Tabriz Mills").await;
    let material = app.create_material("Silk", Some(supplier.id.clone()), dec!(10)).await;
    let service = &app.state.services.purchase_orders;

    assert_matches!(
        service
            .create_purchase_order(purchase_request("SUP-global-999", &material.id, dec!(1), dec!(1)))
            .await,
        Err(ServiceError::ValidationError(_))
    );
    assert_matches!(
        service
            .create_purchase_order(purchase_request(&supplier.id, &material.id, dec!(0), dec!(1)))
            .await,
        Err(ServiceError::ValidationError(_))
    );

    let mut approved = purchase_request(&supplier.id, &material.id, dec!(1), dec!(1));
    approved.status = Some(PurchaseOrderStatus::Approved);
    assert_matches!(
        service.create_purchase_order(approved).await,
        Err(ServiceError::ValidationError(_))
    );

    let created = service
        .create_purchase_order(purchase_request(&supplier.id, &material.id, dec!(1), dec!(1)))
        .await
        .unwrap();
    assert_matches!(
        service
            .update_status(
                &created.purchase_order.id,
                status(PurchaseOrderStatus::Delivered, Some(dec!(7)))
            )
            .await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn manual_adjustments_append_movements_that_cannot_be_edited() {
    let app = TestApp::new().await;
    let material = app.create_material("Cotton warp", None, dec!(40)).await;
    let service = &app.state.services.raw_materials;

    let adjustment = service
        .adjust_stock(
            &material.id,
            AdjustStockRequest {
                movement_type: MovementType::Out,
                quantity: dec!(15),
                reason: Some("Loom 3".to_string()),
                reference_id: None,
                reference_type: None,
                unit_cost: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(adjustment.material.current_stock.round_dp(2), dec!(25));
    assert!(adjustment.movement.id.starts_with("MOV-"));

    assert_matches!(
        service
            .adjust_stock(
                &material.id,
                AdjustStockRequest {
                    movement_type: MovementType::Out,
                    quantity: dec!(100),
                    reason: None,
                    reference_id: None,
                    reference_type: None,
                    unit_cost: None,
                },
            )
            .await,
        Err(ServiceError::ValidationError(_))
    );

    let mut edited: stock_movement::ActiveModel = adjustment.movement.into();
    edited.reason = Set(Some("rewritten".to_string()));
    let result = edited.update(app.state.db.as_ref()).await;
    assert!(result.is_err(), "stock movements must be append-only");

    let movements = service.list_movements(&material.id).await.unwrap();
    assert_eq!(movements.len(), 1);
    assert_eq!(movements[0].reason.as_deref(), Some("Loom 3"));
}

#[tokio::test]
async fn concurrent_deliveries_restock_once() {
    let app = TestApp::on_disk(4).await;
    let supplier = app.create_supplier("Herat Spinners").await;
    let material = app
        .create_material("Carded wool", Some(supplier.id.clone()), dec!(50))
        .await;
    let service = app.state.services.purchase_orders.clone();

    let created = service
        .create_purchase_order(purchase_request(&supplier.id, &material.id, dec!(12.5), dec!(4)))
        .await
        .unwrap();
    let po_id = created.purchase_order.id.clone();
    service
        .update_status(&po_id, status(PurchaseOrderStatus::Approved, None))
        .await
        .unwrap();

    let deliveries = (0..2).map(|_| {
        let service = service.clone();
        let po_id = po_id.clone();
        tokio::spawn(async move {
            service
                .update_status(&po_id, status(PurchaseOrderStatus::Delivered, Some(dec!(4))))
                .await
        })
    });
    for outcome in join_all(deliveries).await {
        let delivered = outcome.expect("task panicked").unwrap();
        assert_eq!(delivered.purchase_order.status, PurchaseOrderStatus::Delivered);
    }

    let materials = &app.state.services.raw_materials;
    let restocked = materials.get_material(&material.id).await.unwrap();
    assert_eq!(restocked.current_stock.round_dp(2), dec!(62.5));
    let receipts: Vec<_> = materials
        .list_movements(&material.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.reference_id.as_deref() == Some(po_id.as_str()))
        .collect();
    assert_eq!(receipts.len(), 1);

    let rated = app.state.services.suppliers.get_supplier(&supplier.id).await.unwrap();
    assert_eq!(rated.total_orders, 1);
}

#[tokio::test]
async fn concurrent_adjustments_do_not_lose_updates() {
    let app = TestApp::on_disk(4).await;
    let material = app.create_material("Hemp twine", None, dec!(100)).await;
    let service = app.state.services.raw_materials.clone();

    let adjustments = (0..8).map(|_| {
        let service = service.clone();
        let material_id = material.id.clone();
        tokio::spawn(async move {
            service
                .adjust_stock(
                    &material_id,
                    AdjustStockRequest {
                        movement_type: MovementType::Out,
                        quantity: dec!(5),
                        reason: Some("Loom draw".to_string()),
                        reference_id: None,
                        reference_type: None,
                        unit_cost: None,
                    },
                )
                .await
        })
    });
    for outcome in join_all(adjustments).await {
        outcome.expect("task panicked").unwrap();
    }

    let drawn = service.get_material(&material.id).await.unwrap();
    assert_eq!(drawn.current_stock.round_dp(2), dec!(60));

    let mut movements = service.list_movements(&material.id).await.unwrap();
    assert_eq!(movements.len(), 8);
    movements.sort_by(|a, b| b.previous_stock.cmp(&a.previous_stock));
    for (step, movement) in movements.iter().enumerate() {
        let expected_before = dec!(100) - Decimal::from(5 * step as i64);
        assert_eq!(movement.previous_stock.round_dp(2), expected_before);
        assert_eq!(movement.new_stock.round_dp(2), expected_before - dec!(5));
    }
}
