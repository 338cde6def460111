use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240101_000001_create_id_sequences_table::Migration),
            Box::new(m20240101_000002_create_products_table::Migration),
            Box::new(m20240101_000003_create_individual_products_table::Migration),
            Box::new(m20240101_000004_create_orders_table::Migration),
            Box::new(m20240101_000005_create_order_items_table::Migration),
            Box::new(m20240101_000006_create_suppliers_table::Migration),
            Box::new(m20240101_000007_create_raw_materials_table::Migration),
            Box::new(m20240101_000008_create_stock_movements_table::Migration),
            Box::new(m20240101_000009_create_purchase_orders_tables::Migration),
            Box::new(m20240101_000010_create_settlement_tasks_table::Migration),
        ]
    }
}

// Migration implementations

mod m20240101_000001_create_id_sequences_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000001_create_id_sequences_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            // (prefix, scope) is the conflict target of the allocator upsert
            manager
                .create_table(
                    Table::create()
                        .table(IdSequences::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(IdSequences::Prefix).string_len(16).not_null())
                        .col(ColumnDef::new(IdSequences::Scope).string_len(16).not_null())
                        .col(
                            ColumnDef::new(IdSequences::LastSequence)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(IdSequences::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .primary_key(
                            Index::create()
                                .col(IdSequences::Prefix)
                                .col(IdSequences::Scope),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(IdSequences::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum IdSequences {
        Table,
        Prefix,
        Scope,
        LastSequence,
        UpdatedAt,
    }
}

mod m20240101_000002_create_products_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000002_create_products_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Products::Id)
                                .string_len(64)
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Products::Name).string().not_null())
                        .col(ColumnDef::new(Products::Length).decimal_len(12, 2).null())
                        .col(ColumnDef::new(Products::Width).decimal_len(12, 2).null())
                        .col(ColumnDef::new(Products::DimensionUnit).string_len(16).null())
                        .col(ColumnDef::new(Products::Weight).decimal_len(12, 2).null())
                        .col(ColumnDef::new(Products::Category).string().null())
                        .col(ColumnDef::new(Products::Subcategory).string().null())
                        .col(
                            ColumnDef::new(Products::UnitPrice)
                                .decimal_len(16, 2)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::BaseQuantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::CurrentStock)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::IndividualProductsCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::IndividualStockTracking)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Products::MinStockLevel)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Products::Status).string_len(32).not_null())
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_products_status")
                        .table(Products::Table)
                        .col(Products::Status)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Products {
        Table,
        Id,
        Name,
        Length,
        Width,
        DimensionUnit,
        Weight,
        Category,
        Subcategory,
        UnitPrice,
        BaseQuantity,
        CurrentStock,
        IndividualProductsCount,
        IndividualStockTracking,
        MinStockLevel,
        Status,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240101_000003_create_individual_products_table {
    use super::m20240101_000002_create_products_table::Products;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000003_create_individual_products_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(IndividualProducts::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(IndividualProducts::Id)
                                .string_len(64)
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(IndividualProducts::ProductId)
                                .string_len(64)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(IndividualProducts::Status)
                                .string_len(32)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(IndividualProducts::OrderId)
                                .string_len(64)
                                .null(),
                        )
                        .col(
                            ColumnDef::new(IndividualProducts::ReservedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(IndividualProducts::SoldDate)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(IndividualProducts::ProductionDate)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(IndividualProducts::Notes).text().null())
                        .col(
                            ColumnDef::new(IndividualProducts::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(IndividualProducts::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_individual_products_product")
                                .from(IndividualProducts::Table, IndividualProducts::ProductId)
                                .to(Products::Table, Products::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_individual_products_product_status")
                        .table(IndividualProducts::Table)
                        .col(IndividualProducts::ProductId)
                        .col(IndividualProducts::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_individual_products_order_id")
                        .table(IndividualProducts::Table)
                        .col(IndividualProducts::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(IndividualProducts::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum IndividualProducts {
        Table,
        Id,
        ProductId,
        Status,
        OrderId,
        ReservedAt,
        SoldDate,
        ProductionDate,
        Notes,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240101_000004_create_orders_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000004_create_orders_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            let money = |col: Orders| {
                ColumnDef::new(col)
                    .decimal_len(16, 2)
                    .not_null()
                    .default(0)
                    .to_owned()
            };

            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Orders::Id)
                                .string_len(64)
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::OrderNumber)
                                .string_len(64)
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Orders::CustomerId).string_len(64).not_null())
                        .col(ColumnDef::new(Orders::Status).string_len(32).not_null())
                        .col(ColumnDef::new(Orders::WorkflowStep).string_len(16).not_null())
                        .col(&mut money(Orders::Subtotal))
                        .col(&mut money(Orders::GstRate))
                        .col(
                            ColumnDef::new(Orders::GstIncluded)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(&mut money(Orders::GstAmount))
                        .col(&mut money(Orders::DiscountAmount))
                        .col(&mut money(Orders::TotalAmount))
                        .col(&mut money(Orders::PaidAmount))
                        .col(&mut money(Orders::OutstandingAmount))
                        .col(ColumnDef::new(Orders::Notes).text().null())
                        .col(
                            ColumnDef::new(Orders::AcceptedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Orders::DispatchedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Orders::DeliveredAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Orders::CancelledAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Orders::Version)
                                .integer()
                                .not_null()
                                .default(1),
                        )
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_status")
                        .table(Orders::Table)
                        .col(Orders::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_created_at")
                        .table(Orders::Table)
                        .col(Orders::CreatedAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden, Clone, Copy)]
    pub(super) enum Orders {
        Table,
        Id,
        OrderNumber,
        CustomerId,
        Status,
        WorkflowStep,
        Subtotal,
        GstRate,
        GstIncluded,
        GstAmount,
        DiscountAmount,
        TotalAmount,
        PaidAmount,
        OutstandingAmount,
        Notes,
        AcceptedAt,
        DispatchedAt,
        DeliveredAt,
        CancelledAt,
        Version,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240101_000005_create_order_items_table {
    use super::m20240101_000004_create_orders_table::Orders;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000005_create_order_items_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(OrderItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OrderItems::Id)
                                .string_len(64)
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderItems::OrderId).string_len(64).not_null())
                        .col(ColumnDef::new(OrderItems::ItemType).string_len(16).not_null())
                        .col(ColumnDef::new(OrderItems::ProductId).string_len(64).null())
                        .col(
                            ColumnDef::new(OrderItems::RawMaterialId)
                                .string_len(64)
                                .null(),
                        )
                        .col(ColumnDef::new(OrderItems::ItemName).string().not_null())
                        .col(ColumnDef::new(OrderItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(OrderItems::UnitPrice)
                                .decimal_len(16, 2)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItems::TotalPrice)
                                .decimal_len(16, 2)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItems::SelectedIndividualProducts)
                                .json()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItems::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_items_order")
                                .from(OrderItems::Table, OrderItems::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_items_order_id")
                        .table(OrderItems::Table)
                        .col(OrderItems::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderItems::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum OrderItems {
        Table,
        Id,
        OrderId,
        ItemType,
        ProductId,
        RawMaterialId,
        ItemName,
        Quantity,
        UnitPrice,
        TotalPrice,
        SelectedIndividualProducts,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240101_000006_create_suppliers_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000006_create_suppliers_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Suppliers::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Suppliers::Id)
                                .string_len(64)
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Suppliers::Name)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Suppliers::ContactEmail).string().null())
                        .col(ColumnDef::new(Suppliers::Phone).string_len(32).null())
                        .col(
                            ColumnDef::new(Suppliers::Rating)
                                .decimal_len(3, 1)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Suppliers::TotalOrders)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Suppliers::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Suppliers::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Suppliers::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Suppliers {
        Table,
        Id,
        Name,
        ContactEmail,
        Phone,
        Rating,
        TotalOrders,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240101_000007_create_raw_materials_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000007_create_raw_materials_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            let quantity = |col: RawMaterials| {
                ColumnDef::new(col)
                    .decimal_len(16, 3)
                    .not_null()
                    .default(0)
                    .to_owned()
            };

            manager
                .create_table(
                    Table::create()
                        .table(RawMaterials::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(RawMaterials::Id)
                                .string_len(64)
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(RawMaterials::Name).string().not_null())
                        .col(ColumnDef::new(RawMaterials::SupplierId).string_len(64).null())
                        .col(ColumnDef::new(RawMaterials::SupplierName).string().null())
                        .col(ColumnDef::new(RawMaterials::Unit).string_len(16).not_null())
                        .col(&mut quantity(RawMaterials::CurrentStock))
                        .col(&mut quantity(RawMaterials::MinThreshold))
                        .col(&mut quantity(RawMaterials::MaxCapacity))
                        .col(&mut quantity(RawMaterials::ReorderPoint))
                        .col(
                            ColumnDef::new(RawMaterials::CostPerUnit)
                                .decimal_len(16, 2)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(RawMaterials::TotalValue)
                                .decimal_len(16, 2)
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(RawMaterials::Status).string_len(32).not_null())
                        .col(
                            ColumnDef::new(RawMaterials::LastRestocked)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(RawMaterials::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(RawMaterials::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_raw_materials_name")
                        .table(RawMaterials::Table)
                        .col(RawMaterials::Name)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(RawMaterials::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden, Clone, Copy)]
    pub(super) enum RawMaterials {
        Table,
        Id,
        Name,
        SupplierId,
        SupplierName,
        Unit,
        CurrentStock,
        MinThreshold,
        MaxCapacity,
        ReorderPoint,
        CostPerUnit,
        TotalValue,
        Status,
        LastRestocked,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240101_000008_create_stock_movements_table {
    use super::m20240101_000007_create_raw_materials_table::RawMaterials;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000008_create_stock_movements_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(StockMovements::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(StockMovements::Id)
                                .string_len(64)
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::RawMaterialId)
                                .string_len(64)
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockMovements::MaterialName).string().not_null())
                        .col(
                            ColumnDef::new(StockMovements::MovementType)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::Quantity)
                                .decimal_len(16, 3)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::PreviousStock)
                                .decimal_len(16, 3)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::NewStock)
                                .decimal_len(16, 3)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::UnitCost)
                                .decimal_len(16, 2)
                                .null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::TotalCost)
                                .decimal_len(16, 2)
                                .null(),
                        )
                        .col(ColumnDef::new(StockMovements::Reason).text().null())
                        .col(ColumnDef::new(StockMovements::ReferenceId).string_len(64).null())
                        .col(
                            ColumnDef::new(StockMovements::ReferenceType)
                                .string_len(32)
                                .null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_stock_movements_raw_material")
                                .from(StockMovements::Table, StockMovements::RawMaterialId)
                                .to(RawMaterials::Table, RawMaterials::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stock_movements_material_created")
                        .table(StockMovements::Table)
                        .col(StockMovements::RawMaterialId)
                        .col(StockMovements::CreatedAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(StockMovements::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum StockMovements {
        Table,
        Id,
        RawMaterialId,
        MaterialName,
        MovementType,
        Quantity,
        PreviousStock,
        NewStock,
        UnitCost,
        TotalCost,
        Reason,
        ReferenceId,
        ReferenceType,
        CreatedAt,
    }
}

mod m20240101_000009_create_purchase_orders_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000009_create_purchase_orders_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PurchaseOrders::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PurchaseOrders::Id)
                                .string_len(64)
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PurchaseOrders::SupplierId)
                                .string_len(64)
                                .not_null(),
                        )
                        .col(ColumnDef::new(PurchaseOrders::SupplierName).string().not_null())
                        .col(ColumnDef::new(PurchaseOrders::Status).string_len(32).not_null())
                        .col(
                            ColumnDef::new(PurchaseOrders::TotalAmount)
                                .decimal_len(16, 2)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(PurchaseOrders::ExpectedDelivery)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PurchaseOrders::DeliveryRating)
                                .decimal_len(3, 1)
                                .null(),
                        )
                        .col(ColumnDef::new(PurchaseOrders::Notes).text().null())
                        .col(
                            ColumnDef::new(PurchaseOrders::ApprovedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PurchaseOrders::ShippedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PurchaseOrders::DeliveredAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PurchaseOrders::CancelledAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PurchaseOrders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PurchaseOrders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(PurchaseOrderItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PurchaseOrderItems::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PurchaseOrderItems::PurchaseOrderId)
                                .string_len(64)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PurchaseOrderItems::RawMaterialId)
                                .string_len(64)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PurchaseOrderItems::MaterialName)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PurchaseOrderItems::Quantity)
                                .decimal_len(16, 3)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PurchaseOrderItems::UnitPrice)
                                .decimal_len(16, 2)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PurchaseOrderItems::TotalPrice)
                                .decimal_len(16, 2)
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_purchase_order_items_purchase_order")
                                .from(
                                    PurchaseOrderItems::Table,
                                    PurchaseOrderItems::PurchaseOrderId,
                                )
                                .to(PurchaseOrders::Table, PurchaseOrders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_purchase_order_items_po")
                        .table(PurchaseOrderItems::Table)
                        .col(PurchaseOrderItems::PurchaseOrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PurchaseOrderItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(PurchaseOrders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum PurchaseOrders {
        Table,
        Id,
        SupplierId,
        SupplierName,
        Status,
        TotalAmount,
        ExpectedDelivery,
        DeliveryRating,
        Notes,
        ApprovedAt,
        ShippedAt,
        DeliveredAt,
        CancelledAt,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum PurchaseOrderItems {
        Table,
        Id,
        PurchaseOrderId,
        RawMaterialId,
        MaterialName,
        Quantity,
        UnitPrice,
        TotalPrice,
    }
}

mod m20240101_000010_create_settlement_tasks_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000010_create_settlement_tasks_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(SettlementTasks::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(SettlementTasks::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SettlementTasks::OrderId)
                                .string_len(64)
                                .not_null()
                                .unique_key(),
                        )
                        .col(
                            ColumnDef::new(SettlementTasks::Status)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SettlementTasks::Attempts)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(SettlementTasks::LastError).text().null())
                        .col(
                            ColumnDef::new(SettlementTasks::AvailableAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SettlementTasks::CompletedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(SettlementTasks::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SettlementTasks::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_settlement_tasks_status_available")
                        .table(SettlementTasks::Table)
                        .col(SettlementTasks::Status)
                        .col(SettlementTasks::AvailableAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(SettlementTasks::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum SettlementTasks {
        Table,
        Id,
        OrderId,
        Status,
        Attempts,
        LastError,
        AvailableAt,
        CompletedAt,
        CreatedAt,
        UpdatedAt,
    }
}
