use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder,
    Set,
};

use crate::entities::integrated_table;

/// Registry of tables authorized for replication. Names are stored
/// upper-case to match the wire envelope.
pub struct IntegratedTable;

impl IntegratedTable {
    pub async fn register<C: ConnectionTrait>(
        db: &C,
        table_name: &str,
    ) -> Result<integrated_table::Model, DbErr> {
        let name = table_name.to_uppercase();
        let existing = integrated_table::Entity::find()
            .filter(integrated_table::Column::TableName.eq(name.clone()))
            .one(db)
            .await?;

        match existing {
            Some(record) => {
                let mut active: integrated_table::ActiveModel = record.into();
                active.active = Set(true);
                active.update(db).await
            }
            None => {
                let active = integrated_table::ActiveModel {
                    table_name: Set(name),
                    active: Set(true),
                    created_at: Set(Utc::now()),
                    ..Default::default()
                };
                active.insert(db).await
            }
        }
    }

    pub async fn deactivate<C: ConnectionTrait>(db: &C, table_name: &str) -> Result<(), DbErr> {
        let existing = integrated_table::Entity::find()
            .filter(integrated_table::Column::TableName.eq(table_name.to_uppercase()))
            .one(db)
            .await?;

        if let Some(record) = existing {
            let mut active: integrated_table::ActiveModel = record.into();
            active.active = Set(false);
            active.update(db).await?;
        }
        Ok(())
    }

    pub async fn all_active<C: ConnectionTrait>(
        db: &C,
    ) -> Result<Vec<integrated_table::Model>, DbErr> {
        integrated_table::Entity::find()
            .filter(integrated_table::Column::Active.eq(true))
            .order_by_asc(integrated_table::Column::TableName)
            .all(db)
            .await
    }

    /// Receive-side gate: only registered active tables are applied.
    pub async fn is_integrated<C: ConnectionTrait>(
        db: &C,
        table_name: &str,
    ) -> Result<bool, DbErr> {
        let record = integrated_table::Entity::find()
            .filter(integrated_table::Column::TableName.eq(table_name.to_uppercase()))
            .filter(integrated_table::Column::Active.eq(true))
            .one(db)
            .await?;
        Ok(record.is_some())
    }
}
