use sea_orm::entity::prelude::*;

use crate::types::DestinationStatus;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_destinations")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub event_id: i64,
    pub node_id: String,
    pub status: DestinationStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::sync_event::Entity",
        from = "Column::EventId",
        to = "super::sync_event::Column::Id"
    )]
    SyncEvent,
}

impl Related<super::sync_event::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncEvent.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
