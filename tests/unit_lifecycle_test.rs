mod common;

use assert_matches::assert_matches;
use carpet_inventory::{
    entities::{OrderStatus, ProductStatus, UnitStatus},
    errors::ServiceError,
    services::units::MAX_PRODUCTION_BATCH,
};
use common::{product_line, TestApp};
use rstest::rstest;

#[tokio::test]
async fn production_registers_available_units_and_stock() {
    let app = TestApp::new().await;
    let (product, units) = app.product_with_units("Persian 6x9", 3).await;

    assert_eq!(units.len(), 3);
    assert!(units.iter().all(|u| u.status == UnitStatus::Available));
    assert!(units.iter().all(|u| u.id.starts_with("QR-")));
    let suffixes: Vec<&str> = units.iter().filter_map(|u| u.id.rsplit('-').next()).collect();
    assert_eq!(suffixes, vec!["001", "002", "003"]);

    let listed = app.state.services.units.list_units(&product.id, None).await.unwrap();
    let listed_ids: Vec<&str> = listed.iter().map(|u| u.id.as_str()).collect();
    let produced_ids: Vec<&str> = units.iter().map(|u| u.id.as_str()).collect();
    assert_eq!(listed_ids, produced_ids);

    let refreshed = app.state.services.products.get_product(&product.id).await.unwrap();
    assert_eq!(refreshed.current_stock, 3);
    assert_eq!(refreshed.individual_products_count, 3);
    assert_eq!(refreshed.status, ProductStatus::InStock);
}

#[rstest]
#[case(0)]
#[case(MAX_PRODUCTION_BATCH + 1)]
#[tokio::test]
async fn production_quantity_out_of_range_is_rejected(#[case] quantity: u32) {
    let app = TestApp::new().await;
    let product = app.create_product("Kilim", true, 0).await;

    let result = app
        .state
        .services
        .units
        .complete_production(&product.id, quantity, None)
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn production_requires_a_tracked_product() {
    let app = TestApp::new().await;
    let bulk = app.create_product("Runner roll", false, 40).await;
    assert_eq!(bulk.current_stock, 40);

    let units = &app.state.services.units;
    assert_matches!(
        units.complete_production(&bulk.id, 2, None).await,
        Err(ServiceError::ValidationError(_))
    );
    assert_matches!(
        units.complete_production("PRO-000000-999", 2, None).await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn concurrent_reservations_of_one_unit_admit_a_single_winner() {
    let app = TestApp::on_disk(4).await;
    let (product, units) = app.product_with_units("Gabbeh", 1).await;
    let unit_id = units[0].id.clone();

    let first = app.create_order(vec![product_line(&product.id, 1, &[])]).await;
    let second = app.create_order(vec![product_line(&product.id, 1, &[])]).await;

    let tasks: Vec<_> = [first.order.id.clone(), second.order.id.clone()]
        .into_iter()
        .map(|order_id| {
            let service = app.state.services.units.clone();
            let unit_id = unit_id.clone();
            tokio::spawn(async move { service.reserve(vec![unit_id], &order_id).await })
        })
        .collect();

    let mut successes = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.expect("task panicked") {
            Ok(_) => successes += 1,
            Err(ServiceError::Conflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((successes, conflicts), (1, 1));

    let reserved = app
        .state
        .services
        .units
        .list_units(&product.id, Some(UnitStatus::Reserved))
        .await
        .unwrap();
    assert_eq!(reserved.len(), 1);
    let owner = reserved[0].order_id.clone().expect("reserved unit has an order");
    assert!(owner == first.order.id || owner == second.order.id);

    let refreshed = app.state.services.products.get_product(&product.id).await.unwrap();
    assert_eq!(refreshed.current_stock, 0);
    assert_eq!(refreshed.status, ProductStatus::OutOfStock);
}

#[tokio::test]
async fn reservation_is_all_or_nothing() {
    let app = TestApp::new().await;
    let (product, units) = app.product_with_units("Dhurrie", 2).await;
    app.create_order(vec![product_line(&product.id, 1, &[units[0].id.as_str()])])
        .await;
    let other = app.create_order(vec![product_line(&product.id, 2, &[])]).await;

    let result = app
        .state
        .services
        .units
        .reserve(vec![units[1].id.clone(), units[0].id.clone()], &other.order.id)
        .await;
    assert_matches!(result, Err(ServiceError::Conflict(_)));

    let available = app
        .state
        .services
        .units
        .list_units(&product.id, Some(UnitStatus::Available))
        .await
        .unwrap();
    assert_eq!(available.len(), 1);
    assert_eq!(available[0].id, units[1].id);
}

#[tokio::test]
async fn release_returns_units_to_stock_and_clears_selection() {
    let app = TestApp::new().await;
    let (product, units) = app.product_with_units("Oushak", 2).await;
    let order = app
        .create_order(vec![product_line(&product.id, 2, &[units[0].id.as_str(), units[1].id.as_str()])])
        .await;

    let transition = app
        .state
        .services
        .units
        .release(vec![units[0].id.clone()])
        .await
        .unwrap();
    assert_eq!(transition.unit_ids, vec![units[0].id.clone()]);
    assert_eq!(transition.products[0].current_stock, 1);

    let items = app
        .state
        .services
        .orders
        .get_order_items(&order.order.id)
        .await
        .unwrap();
    assert_eq!(items[0].selected_individual_products.ids(), vec![units[1].id.clone()]);

    let released = app
        .state
        .services
        .units
        .list_units(&product.id, Some(UnitStatus::Available))
        .await
        .unwrap();
    assert_eq!(released.len(), 1);
    assert!(released[0].order_id.is_none());
    assert!(released[0].reserved_at.is_none());
}

#[tokio::test]
async fn retiring_units_only_applies_to_available_units() {
    let app = TestApp::new().await;
    let (product, units) = app.product_with_units("Tabriz", 3).await;
    app.create_order(vec![product_line(&product.id, 1, &[units[2].id.as_str()])])
        .await;

    let service = &app.state.services.units;
    let damaged = service.mark_damaged(vec![units[0].id.clone()]).await.unwrap();
    assert_eq!(damaged.products[0].current_stock, 1);
    assert_eq!(damaged.products[0].individual_products_count, 3);
    assert_eq!(damaged.products[0].counts.damaged, 1);

    service.mark_used(vec![units[1].id.clone()]).await.unwrap();
    assert_matches!(
        service.mark_damaged(vec![units[2].id.clone()]).await,
        Err(ServiceError::Conflict(_))
    );
    assert_matches!(
        service.mark_used(vec![units[0].id.clone()]).await,
        Err(ServiceError::Conflict(_))
    );
    assert_matches!(service.mark_used(Vec::new()).await, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn unknown_units_are_reported_as_not_found() {
    let app = TestApp::new().await;
    let result = app
        .state
        .services
        .units
        .release(vec!["QR-000000-404".to_string()])
        .await;
    assert_matches!(result, Err(ServiceError::NotFound(message)) if message.contains("QR-000000-404"));
}

#[tokio::test]
async fn recompute_is_idempotent() {
    let app = TestApp::new().await;
    let (product, units) = app.product_with_units("Heriz", 4).await;
    app.state
        .services
        .units
        .mark_damaged(vec![units[0].id.clone()])
        .await
        .unwrap();

    let products = &app.state.services.products;
    let first = products.recompute_stock(&product.id).await.unwrap();
    let second = products.recompute_stock(&product.id).await.unwrap();

    assert_eq!(first.current_stock, 3);
    assert_eq!(first.current_stock, second.current_stock);
    assert_eq!(first.individual_products_count, second.individual_products_count);
    assert_eq!(first.counts, second.counts);
    assert_eq!(first.status, second.status);
    assert_eq!(second.status, second.previous_status);
}

#[tokio::test]
async fn mark_sold_accepts_own_reservations_and_is_idempotent() {
    let app = TestApp::new().await;
    let (product, units) = app.product_with_units("Kashan", 3).await;
    let order = app
        .create_order(vec![product_line(&product.id, 2, &[units[0].id.as_str()])])
        .await;
    let other = app
        .create_order(vec![product_line(&product.id, 1, &[units[2].id.as_str()])])
        .await;
    let service = &app.state.services.units;

    let ids = vec![units[0].id.clone(), units[1].id.clone()];
    let sold = service.mark_sold(ids.clone(), &order.order.id).await.unwrap();
    assert_eq!(sold.products[0].current_stock, 0);
    assert_eq!(sold.products[0].counts.sold, 2);

    // Selling the same units to the same order again changes nothing.
    service.mark_sold(ids, &order.order.id).await.unwrap();
    let listed = service.list_units(&product.id, Some(UnitStatus::Sold)).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|u| u.order_id.as_deref() == Some(order.order.id.as_str())));

    assert_matches!(
        service.mark_sold(vec![units[2].id.clone()], &order.order.id).await,
        Err(ServiceError::Conflict(_))
    );
    assert_matches!(
        service.mark_sold(vec![units[0].id.clone()], &other.order.id).await,
        Err(ServiceError::Conflict(_))
    );
}

#[tokio::test]
async fn release_for_order_frees_every_unit_the_order_holds() {
    let app = TestApp::new().await;
    let (product, units) = app.product_with_units("Nain", 3).await;
    let order = app
        .create_order(vec![product_line(
            &product.id,
            2,
            &[units[0].id.as_str(), units[1].id.as_str()],
        )])
        .await;
    let service = &app.state.services.units;

    let transition = service.release_for_order(&order.order.id).await.unwrap();
    assert_eq!(transition.unit_ids.len(), 2);
    assert_eq!(transition.products.last().map(|p| p.current_stock), Some(3));

    let items = app
        .state
        .services
        .orders
        .get_order_items(&order.order.id)
        .await
        .unwrap();
    assert!(items[0].selected_individual_products.is_empty());

    let again = service.release_for_order(&order.order.id).await.unwrap();
    assert!(again.unit_ids.is_empty());
    assert_matches!(
        service.release_for_order("ORD-000000-404").await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn dispatched_orders_take_no_new_reservations() {
    let app = TestApp::new().await;
    let (product, units) = app.product_with_units("Qum", 2).await;
    let order = app.create_order(vec![product_line(&product.id, 1, &[])]).await;
    app.state
        .services
        .orders
        .update_status(&order.order.id, OrderStatus::Dispatched)
        .await
        .unwrap();

    assert_matches!(
        app.state
            .services
            .units
            .reserve(vec![units[0].id.clone()], &order.order.id)
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
