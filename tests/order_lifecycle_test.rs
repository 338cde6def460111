mod common;

use assert_matches::assert_matches;
use carpet_inventory::{
    entities::{OrderStatus, SettlementStatus, UnitStatus, WorkflowStep},
    errors::ServiceError,
    services::{
        orders::{CreateOrderItemRequest, CreateOrderRequest},
        settlement::SettlementOutcome,
    },
};
use common::{material_line, product_line, TestApp};
use rust_decimal_macros::dec;

#[tokio::test]
async fn new_order_reserves_selected_units_and_prices_lines() {
    let app = TestApp::new().await;
    let (product, units) = app.product_with_units("Persian 8x10", 3).await;

    let created = app
        .create_order(vec![product_line(&product.id, 2, &[&units[0].id, &units[1].id])])
        .await;

    let order = &created.order;
    assert!(order.id.starts_with("ORD-"));
    assert_eq!(order.order_number, order.id);
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.workflow_step, WorkflowStep::Accept);
    assert_eq!(order.subtotal.round_dp(2), dec!(200));
    assert_eq!(order.gst_rate.round_dp(2), dec!(18));
    assert_eq!(order.gst_amount.round_dp(2), dec!(36));
    assert_eq!(order.total_amount.round_dp(2), dec!(236));
    assert_eq!(order.outstanding_amount.round_dp(2), dec!(236));

    assert_eq!(created.items.len(), 1);
    let selection = &created.items[0].selected_individual_products;
    assert_eq!(selection.ids(), vec![units[0].id.clone(), units[1].id.clone()]);

    let reserved = app
        .state
        .services
        .units
        .list_units(&product.id, Some(UnitStatus::Reserved))
        .await
        .unwrap();
    assert_eq!(reserved.len(), 2);
    assert!(reserved.iter().all(|u| u.order_id.as_deref() == Some(order.id.as_str())));

    let refreshed = app.state.services.products.get_product(&product.id).await.unwrap();
    assert_eq!(refreshed.current_stock, 1);
}

#[tokio::test]
async fn invalid_orders_are_rejected_without_side_effects() {
    let app = TestApp::new().await;
    let (product, units) = app.product_with_units("Kashan", 2).await;
    let (_, other_units) = app.product_with_units("Nain", 1).await;
    let orders = &app.state.services.orders;

    let duplicate = order_request(vec![
        product_line(&product.id, 1, &[&units[0].id]),
        product_line(&product.id, 1, &[&units[0].id]),
    ]);
    assert_matches!(orders.create_order(duplicate).await, Err(ServiceError::ValidationError(_)));

    let foreign = order_request(vec![product_line(&product.id, 1, &[&other_units[0].id])]);
    assert_matches!(orders.create_order(foreign).await, Err(ServiceError::ValidationError(_)));

    let too_many = order_request(vec![product_line(&product.id, 1, &[&units[0].id, &units[1].id])]);
    assert_matches!(orders.create_order(too_many).await, Err(ServiceError::ValidationError(_)));

    assert_matches!(
        orders.create_order(order_request(Vec::new())).await,
        Err(ServiceError::ValidationError(_))
    );

    let available = app
        .state
        .services
        .units
        .list_units(&product.id, Some(UnitStatus::Available))
        .await
        .unwrap();
    assert_eq!(available.len(), 2);
}

fn order_request(items: Vec<CreateOrderItemRequest>) -> CreateOrderRequest {
    CreateOrderRequest {
        customer_id: "CUST-2".to_string(),
        items,
        gst_rate: None,
        gst_included: None,
        discount_amount: dec!(0),
        paid_amount: dec!(0),
        notes: None,
    }
}

#[tokio::test]
async fn dispatch_sells_selected_units_and_settles_once() {
    let app = TestApp::new().await;
    let (product, units) = app.product_with_units("Bokhara", 3).await;
    let created = app
        .create_order(vec![product_line(&product.id, 2, &[&units[0].id, &units[1].id])])
        .await;
    let order_id = created.order.id.clone();
    let orders = &app.state.services.orders;

    let accepted = orders.update_status(&order_id, OrderStatus::Accepted).await.unwrap();
    assert!(accepted.order.accepted_at.is_some());
    assert_eq!(accepted.order.workflow_step, WorkflowStep::Dispatch);

    let dispatched = orders.update_status(&order_id, OrderStatus::Dispatched).await.unwrap();
    assert_eq!(dispatched.order.status, OrderStatus::Dispatched);
    assert!(dispatched.order.dispatched_at.is_some());
    assert_eq!(dispatched.order.version, created.order.version + 2);

    let sold = app
        .state
        .services
        .units
        .list_units(&product.id, Some(UnitStatus::Sold))
        .await
        .unwrap();
    assert_eq!(sold.len(), 2);
    assert!(sold.iter().all(|u| u.sold_date.is_some()));
    let item = &dispatched.items[0];
    assert!(item
        .selected_individual_products
        .0
        .iter()
        .all(|s| s.status == UnitStatus::Sold));

    let refreshed = app.state.services.products.get_product(&product.id).await.unwrap();
    assert_eq!(refreshed.current_stock, 1);
    assert_eq!(refreshed.individual_products_count, 3);

    let task = app
        .state
        .services
        .settlement
        .find_task(&order_id)
        .await
        .unwrap()
        .expect("settlement task");
    assert_eq!(task.status, SettlementStatus::Completed);

    let delivered = orders.update_status(&order_id, OrderStatus::Delivered).await.unwrap();
    assert!(delivered.order.delivered_at.is_some());
    assert_eq!(delivered.order.workflow_step, WorkflowStep::Delivered);
    assert_matches!(
        app.state.services.settlement.settle_order(&order_id).await,
        Ok(SettlementOutcome::Skipped)
    );
}

#[tokio::test]
async fn bulk_and_material_lines_are_deducted_exactly_once() {
    let app = TestApp::new().await;
    let bulk = app.create_product("Jute runner", false, 10).await;
    let material = app.create_material("Wool yarn", None, dec!(100)).await;

    let created = app
        .create_order(vec![product_line(&bulk.id, 3, &[]), material_line(&material.id, 5)])
        .await;
    let order_id = created.order.id.clone();
    let orders = &app.state.services.orders;

    orders.update_status(&order_id, OrderStatus::Dispatched).await.unwrap();
    orders.update_status(&order_id, OrderStatus::Delivered).await.unwrap();
    let run = app.state.services.settlement.process_pending(10).await.unwrap();
    assert_eq!(run.settled, 0);

    let product = app.state.services.products.get_product(&bulk.id).await.unwrap();
    assert_eq!(product.base_quantity, 7);
    assert_eq!(product.current_stock, 7);

    let material = app
        .state
        .services
        .raw_materials
        .get_material(&material.id)
        .await
        .unwrap();
    assert_eq!(material.current_stock.round_dp(2), dec!(95));

    let movements = app
        .state
        .services
        .raw_materials
        .list_movements(&material.id)
        .await
        .unwrap();
    let dispatch_moves: Vec<_> = movements
        .iter()
        .filter(|m| m.reference_id.as_deref() == Some(order_id.as_str()))
        .collect();
    assert_eq!(dispatch_moves.len(), 1);
    assert_eq!(dispatch_moves[0].reference_type.as_deref(), Some("order"));
    assert_eq!(dispatch_moves[0].quantity.round_dp(2), dec!(5));
    assert_eq!(dispatch_moves[0].new_stock.round_dp(2), dec!(95));
}

#[tokio::test]
async fn oversized_bulk_dispatch_clamps_at_zero() {
    let app = TestApp::new().await;
    let bulk = app.create_product("Sisal mat", false, 2).await;
    let created = app.create_order(vec![product_line(&bulk.id, 5, &[])]).await;

    app.state
        .services
        .orders
        .update_status(&created.order.id, OrderStatus::Dispatched)
        .await
        .unwrap();

    let product = app.state.services.products.get_product(&bulk.id).await.unwrap();
    assert_eq!(product.base_quantity, 0);
    assert_eq!(product.current_stock, 0);
}

#[tokio::test]
async fn cancel_releases_reserved_units() {
    let app = TestApp::new().await;
    let (product, units) = app.product_with_units("Isfahan", 2).await;
    let created = app
        .create_order(vec![product_line(&product.id, 2, &[&units[0].id, &units[1].id])])
        .await;

    let cancelled = app
        .state
        .services
        .orders
        .update_status(&created.order.id, OrderStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(cancelled.order.status, OrderStatus::Cancelled);
    assert!(cancelled.order.cancelled_at.is_some());
    assert!(cancelled.items[0].selected_individual_products.is_empty());

    let available = app
        .state
        .services
        .units
        .list_units(&product.id, Some(UnitStatus::Available))
        .await
        .unwrap();
    assert_eq!(available.len(), 2);
    assert!(available.iter().all(|u| u.order_id.is_none()));

    let refreshed = app.state.services.products.get_product(&product.id).await.unwrap();
    assert_eq!(refreshed.current_stock, 2);
    assert!(app
        .state
        .services
        .settlement
        .find_task(&created.order.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn illegal_transitions_are_rejected() {
    let app = TestApp::new().await;
    let (product, units) = app.product_with_units("Sarouk", 1).await;
    let created = app
        .create_order(vec![product_line(&product.id, 1, &[&units[0].id])])
        .await;
    let order_id = created.order.id.clone();
    let orders = &app.state.services.orders;

    orders.update_status(&order_id, OrderStatus::Ready).await.unwrap();
    assert_matches!(
        orders.update_status(&order_id, OrderStatus::Accepted).await,
        Err(ServiceError::ValidationError(_))
    );

    orders.update_status(&order_id, OrderStatus::Dispatched).await.unwrap();
    assert_matches!(
        orders.update_status(&order_id, OrderStatus::Cancelled).await,
        Err(ServiceError::ValidationError(_))
    );

    let unchanged = orders.update_status(&order_id, OrderStatus::Dispatched).await.unwrap();
    assert_eq!(unchanged.order.status, OrderStatus::Dispatched);

    assert_matches!(
        orders.update_status("ORD-000000-404", OrderStatus::Accepted).await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn item_selection_can_be_replaced_before_dispatch() {
    let app = TestApp::new().await;
    let (product, units) = app.product_with_units("Agra", 3).await;
    let created = app
        .create_order(vec![product_line(&product.id, 2, &[&units[0].id])])
        .await;
    let item_id = created.items[0].id.clone();
    let orders = &app.state.services.orders;

    let selection = orders
        .update_order_item_units(&item_id, vec![units[1].id.clone(), units[2].id.clone()])
        .await
        .unwrap();
    assert_eq!(
        selection.item.selected_individual_products.ids(),
        vec![units[1].id.clone(), units[2].id.clone()]
    );

    let units_now = app.state.services.units.list_units(&product.id, None).await.unwrap();
    let status_of = |id: &str| units_now.iter().find(|u| u.id == id).map(|u| u.status);
    assert_eq!(status_of(&units[0].id), Some(UnitStatus::Available));
    assert_eq!(status_of(&units[1].id), Some(UnitStatus::Reserved));
    assert_eq!(status_of(&units[2].id), Some(UnitStatus::Reserved));

    orders
        .update_status(&created.order.id, OrderStatus::Dispatched)
        .await
        .unwrap();
    assert_matches!(
        orders.update_order_item_units(&item_id, vec![units[0].id.clone()]).await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn payments_reduce_the_outstanding_amount() {
    let app = TestApp::new().await;
    let (product, _) = app.product_with_units("Ziegler", 1).await;
    let created = app.create_order(vec![product_line(&product.id, 1, &[])]).await;
    let orders = &app.state.services.orders;

    let paid = orders.record_payment(&created.order.id, dec!(50)).await.unwrap();
    assert_eq!(paid.paid_amount.round_dp(2), dec!(50));
    assert_eq!(paid.outstanding_amount.round_dp(2), dec!(68));

    let overpaid = orders.record_payment(&created.order.id, dec!(100)).await.unwrap();
    assert_eq!(overpaid.outstanding_amount.round_dp(2), dec!(-32));

    assert_matches!(
        orders.record_payment(&created.order.id, dec!(0)).await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn dispatch_sells_units_reserved_outside_the_item_selection() {
    let app = TestApp::new().await;
    let (product, units) = app.product_with_units("Malayer", 3).await;
    let created = app.create_order(vec![product_line(&product.id, 2, &[])]).await;
    let order_id = created.order.id.clone();

    app.state
        .services
        .units
        .reserve(vec![units[0].id.clone(), units[1].id.clone()], &order_id)
        .await
        .unwrap();

    let orders = &app.state.services.orders;
    orders.update_status(&order_id, OrderStatus::Accepted).await.unwrap();
    orders.update_status(&order_id, OrderStatus::Dispatched).await.unwrap();
    orders.update_status(&order_id, OrderStatus::Delivered).await.unwrap();

    let unit_service = &app.state.services.units;
    let reserved = unit_service
        .list_units(&product.id, Some(UnitStatus::Reserved))
        .await
        .unwrap();
    assert!(reserved.is_empty());
    let sold = unit_service
        .list_units(&product.id, Some(UnitStatus::Sold))
        .await
        .unwrap();
    assert_eq!(sold.len(), 2);
    assert!(sold.iter().all(|u| u.order_id.as_deref() == Some(order_id.as_str())));
    assert!(sold.iter().all(|u| u.sold_date.is_some()));

    let refreshed = app.state.services.products.get_product(&product.id).await.unwrap();
    assert_eq!(refreshed.current_stock, 1);
}

#[tokio::test]
async fn material_lines_without_an_id_settle_by_name() {
    let app = TestApp::new().await;
    let material = app.create_material("Silk weft", None, dec!(40)).await;

    let mut line = material_line(&material.id, 6);
    line.raw_material_id = None;
    line.item_name = Some("Silk weft".to_string());
    let created = app.create_order(vec![line]).await;
    assert!(created.items[0].raw_material_id.is_none());

    app.state
        .services
        .orders
        .update_status(&created.order.id, OrderStatus::Dispatched)
        .await
        .unwrap();

    let materials = &app.state.services.raw_materials;
    let refreshed = materials.get_material(&material.id).await.unwrap();
    assert_eq!(refreshed.current_stock.round_dp(2), dec!(34));
    let movements = materials.list_movements(&material.id).await.unwrap();
    assert_eq!(movements.len(), 1);
    assert_eq!(movements[0].reference_id.as_deref(), Some(created.order.id.as_str()));
}

#[tokio::test]
async fn replacing_a_selection_after_dispatch_leaves_units_alone() {
    let app = TestApp::new().await;
    let (product, units) = app.product_with_units("Senneh", 2).await;
    let created = app.create_order(vec![product_line(&product.id, 2, &[])]).await;
    let orders = &app.state.services.orders;
    orders
        .update_status(&created.order.id, OrderStatus::Dispatched)
        .await
        .unwrap();

    assert_matches!(
        orders
            .update_order_item_units(&created.items[0].id, vec![units[0].id.clone()])
            .await,
        Err(ServiceError::ValidationError(_))
    );
    let available = app
        .state
        .services
        .units
        .list_units(&product.id, Some(UnitStatus::Available))
        .await
        .unwrap();
    assert_eq!(available.len(), 2);
}
