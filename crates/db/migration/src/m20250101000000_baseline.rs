use sea_orm_migration::{prelude::*, sea_orm::DatabaseBackend};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .if_not_exists()
                    .table(IntegratedTables::Table)
                    .col(pk_id_col(manager, IntegratedTables::Id))
                    .col(
                        ColumnDef::new(IntegratedTables::TableName)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IntegratedTables::Active)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(timestamp_col(IntegratedTables::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_integrated_tables_name")
                    .table(IntegratedTables::Table)
                    .col(IntegratedTables::TableName)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .if_not_exists()
                    .table(SyncEvents::Table)
                    .col(pk_id_col(manager, SyncEvents::Id))
                    .col(
                        ColumnDef::new(SyncEvents::EventId)
                            .string_len(36)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncEvents::TableName)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncEvents::Operation)
                            .string_len(1)
                            .not_null(),
                    )
                    .col(ColumnDef::new(SyncEvents::Pk).json().not_null())
                    .col(ColumnDef::new(SyncEvents::Payload).json())
                    .col(ColumnDef::new(SyncEvents::Origin).string_len(64).not_null())
                    .col(
                        ColumnDef::new(SyncEvents::Status)
                            .string_len(32)
                            .not_null()
                            .default(Expr::val("pending")),
                    )
                    .col(
                        ColumnDef::new(SyncEvents::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(timestamp_col(SyncEvents::CreatedAt))
                    .col(ColumnDef::new(SyncEvents::LastSentAt).timestamp())
                    .col(ColumnDef::new(SyncEvents::LastError).text())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sync_events_event_id")
                    .table(SyncEvents::Table)
                    .col(SyncEvents::EventId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sync_events_status")
                    .table(SyncEvents::Table)
                    .col(SyncEvents::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .if_not_exists()
                    .table(SyncDestinations::Table)
                    .col(pk_id_col(manager, SyncDestinations::Id))
                    .col(
                        ColumnDef::new(SyncDestinations::EventId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncDestinations::NodeId)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncDestinations::Status)
                            .string_len(32)
                            .not_null()
                            .default(Expr::val("pending")),
                    )
                    .col(
                        ColumnDef::new(SyncDestinations::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(SyncDestinations::LastError).text())
                    .col(ColumnDef::new(SyncDestinations::LastAttemptAt).timestamp())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sync_destinations_event")
                            .from(SyncDestinations::Table, SyncDestinations::EventId)
                            .to(SyncEvents::Table, SyncEvents::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sync_destinations_event_node")
                    .table(SyncDestinations::Table)
                    .col(SyncDestinations::EventId)
                    .col(SyncDestinations::NodeId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sync_destinations_status")
                    .table(SyncDestinations::Table)
                    .col(SyncDestinations::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .if_not_exists()
                    .table(SyncNodes::Table)
                    .col(pk_id_col(manager, SyncNodes::Id))
                    .col(ColumnDef::new(SyncNodes::NodeId).string_len(64).not_null())
                    .col(ColumnDef::new(SyncNodes::RemoteUrl).text())
                    .col(timestamp_col(SyncNodes::LastSeen))
                    .col(
                        ColumnDef::new(SyncNodes::Active)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sync_nodes_node_id")
                    .table(SyncNodes::Table)
                    .col(SyncNodes::NodeId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // One-row flag the apply transaction raises so capture triggers stay
        // silent while remote changes are written.
        manager
            .create_table(
                Table::create()
                    .if_not_exists()
                    .table(SyncApplyGuard::Table)
                    .col(
                        ColumnDef::new(SyncApplyGuard::Id)
                            .integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(SyncApplyGuard::Suppressed)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .exec_stmt(
                Query::insert()
                    .into_table(SyncApplyGuard::Table)
                    .columns([SyncApplyGuard::Id, SyncApplyGuard::Suppressed])
                    .values_panic([1.into(), 0.into()])
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncApplyGuard::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(SyncDestinations::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(SyncEvents::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(SyncNodes::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(IntegratedTables::Table).to_owned())
            .await?;
        Ok(())
    }
}

fn pk_id_col<T: Iden + 'static>(manager: &SchemaManager, col: T) -> ColumnDef {
    let mut col = ColumnDef::new(col);
    match manager.get_database_backend() {
        DatabaseBackend::Sqlite => {
            col.integer();
        }
        _ => {
            col.big_integer();
        }
    }
    col.not_null().auto_increment().primary_key().to_owned()
}

fn timestamp_col<T: Iden + 'static>(col: T) -> ColumnDef {
    ColumnDef::new(col)
        .timestamp()
        .not_null()
        .default(Expr::current_timestamp())
        .to_owned()
}

#[derive(Iden)]
enum IntegratedTables {
    Table,
    Id,
    TableName,
    Active,
    CreatedAt,
}

#[derive(Iden)]
enum SyncEvents {
    Table,
    Id,
    EventId,
    TableName,
    Operation,
    Pk,
    Payload,
    Origin,
    Status,
    Attempts,
    CreatedAt,
    LastSentAt,
    LastError,
}

#[derive(Iden)]
enum SyncDestinations {
    Table,
    Id,
    EventId,
    NodeId,
    Status,
    Attempts,
    LastError,
    LastAttemptAt,
}

#[derive(Iden)]
enum SyncNodes {
    Table,
    Id,
    NodeId,
    RemoteUrl,
    LastSeen,
    Active,
}

#[derive(Iden)]
enum SyncApplyGuard {
    Table,
    Id,
    Suppressed,
}
