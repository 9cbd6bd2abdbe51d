use sea_orm::JsonValue;
use sea_orm::entity::prelude::*;

use crate::types::{EventStatus, Operation};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_events")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// 128-bit UUID rendered as 36-char text; capture triggers generate it
    /// in SQL, so the column stays plain text across drivers.
    pub event_id: String,
    pub table_name: String,
    pub operation: Operation,
    pub pk: JsonValue,
    pub payload: Option<JsonValue>,
    pub origin: String,
    pub status: EventStatus,
    pub attempts: i32,
    pub created_at: DateTimeUtc,
    pub last_sent_at: Option<DateTimeUtc>,
    pub last_error: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::sync_destination::Entity")]
    SyncDestination,
}

impl Related<super::sync_destination::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncDestination.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
