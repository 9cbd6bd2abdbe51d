use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, JsonValue, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde_json::Map;
use uuid::Uuid;

use crate::entities::sync_event;
use crate::events::SyncEnvelope;
use crate::types::{EventStatus, Operation};

pub struct SyncEvent;

impl SyncEvent {
    /// Appends a captured change to the outbox in status `Pending`.
    ///
    /// The trigger path inserts directly in SQL; this entry point serves the
    /// trace adapter and tests, and assigns the event id the same way the
    /// triggers do.
    pub async fn enqueue<C: ConnectionTrait>(
        db: &C,
        table_name: &str,
        operation: Operation,
        pk: Map<String, JsonValue>,
        payload: Option<Map<String, JsonValue>>,
        origin: &str,
    ) -> Result<sync_event::Model, DbErr> {
        let active = sync_event::ActiveModel {
            event_id: Set(Uuid::new_v4().to_string()),
            table_name: Set(table_name.to_uppercase()),
            operation: Set(operation),
            pk: Set(JsonValue::Object(pk)),
            payload: Set(payload.map(JsonValue::Object)),
            origin: Set(origin.to_string()),
            status: Set(EventStatus::Pending),
            attempts: Set(0),
            created_at: Set(Utc::now()),
            last_sent_at: Set(None),
            last_error: Set(None),
            ..Default::default()
        };
        active.insert(db).await
    }

    /// Oldest-first slice of events still waiting for fan-out.
    pub async fn fetch_pending<C: ConnectionTrait>(
        db: &C,
        limit: u64,
    ) -> Result<Vec<sync_event::Model>, DbErr> {
        sync_event::Entity::find()
            .filter(sync_event::Column::Status.eq(EventStatus::Pending))
            .order_by_asc(sync_event::Column::Id)
            .limit(limit)
            .all(db)
            .await
    }

    pub async fn mark_dispatched<C: ConnectionTrait>(db: &C, id: i64) -> Result<(), DbErr> {
        let record = sync_event::Entity::find_by_id(id)
            .one(db)
            .await?
            .ok_or(DbErr::RecordNotFound("sync event not found".to_string()))?;

        let mut active: sync_event::ActiveModel = record.into();
        active.status = Set(EventStatus::Dispatched);
        active.update(db).await?;
        Ok(())
    }

    /// True iff any outbox row already carries this event id. Retried sends
    /// are absorbed here before the apply transaction even starts.
    pub async fn is_duplicate<C: ConnectionTrait>(db: &C, event_id: &str) -> Result<bool, DbErr> {
        let count = sync_event::Entity::find()
            .filter(sync_event::Column::EventId.eq(event_id))
            .count(db)
            .await?;
        Ok(count > 0)
    }

    /// Writes the history row for a remotely produced event, already in
    /// status `Applied`. Runs inside the receiver's apply transaction.
    pub async fn record_applied<C: ConnectionTrait>(
        db: &C,
        envelope: &SyncEnvelope,
    ) -> Result<sync_event::Model, DbErr> {
        let active = sync_event::ActiveModel {
            event_id: Set(envelope.event_id.to_string()),
            table_name: Set(envelope.table.to_uppercase()),
            operation: Set(envelope.operation),
            pk: Set(JsonValue::Object(envelope.pk.clone())),
            payload: Set(envelope.data.clone().map(JsonValue::Object)),
            origin: Set(envelope.source_node.clone()),
            status: Set(EventStatus::Applied),
            attempts: Set(0),
            created_at: Set(Utc::now()),
            last_sent_at: Set(None),
            last_error: Set(None),
            ..Default::default()
        };
        active.insert(db).await
    }

    pub async fn find_by_event_id<C: ConnectionTrait>(
        db: &C,
        event_id: &str,
    ) -> Result<Option<sync_event::Model>, DbErr> {
        sync_event::Entity::find()
            .filter(sync_event::Column::EventId.eq(event_id))
            .one(db)
            .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::DBService;

    fn pk(id: i64) -> Map<String, JsonValue> {
        let mut map = Map::new();
        map.insert("ID".to_string(), json!(id));
        map
    }

    #[tokio::test]
    async fn enqueue_and_fetch_keeps_arrival_order() {
        let db = DBService::new_in_memory().await.unwrap();

        for id in [3_i64, 1, 2] {
            SyncEvent::enqueue(&db.pool, "customers", Operation::Insert, pk(id), None, "TRIGGER")
                .await
                .unwrap();
        }

        let pending = SyncEvent::fetch_pending(&db.pool, 10).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert!(pending.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(pending[0].table_name, "CUSTOMERS");
        assert_eq!(pending[0].status, EventStatus::Pending);
    }

    #[tokio::test]
    async fn fetch_pending_honors_the_batch_limit() {
        let db = DBService::new_in_memory().await.unwrap();

        for id in 0..5_i64 {
            SyncEvent::enqueue(&db.pool, "ITEMS", Operation::Update, pk(id), None, "TRIGGER")
                .await
                .unwrap();
        }

        let pending = SyncEvent::fetch_pending(&db.pool, 2).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].id < pending[1].id);
    }

    #[tokio::test]
    async fn dispatched_events_leave_the_pending_set() {
        let db = DBService::new_in_memory().await.unwrap();

        let event =
            SyncEvent::enqueue(&db.pool, "ITEMS", Operation::Insert, pk(1), None, "TRIGGER")
                .await
                .unwrap();
        SyncEvent::mark_dispatched(&db.pool, event.id).await.unwrap();

        assert!(SyncEvent::fetch_pending(&db.pool, 10).await.unwrap().is_empty());
        let reloaded = SyncEvent::find_by_event_id(&db.pool, &event.event_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.status, EventStatus::Dispatched);
    }

    #[tokio::test]
    async fn duplicate_detection_spans_all_statuses() {
        let db = DBService::new_in_memory().await.unwrap();

        let event =
            SyncEvent::enqueue(&db.pool, "ITEMS", Operation::Insert, pk(1), None, "TRIGGER")
                .await
                .unwrap();

        assert!(SyncEvent::is_duplicate(&db.pool, &event.event_id).await.unwrap());
        assert!(
            !SyncEvent::is_duplicate(&db.pool, &Uuid::new_v4().to_string())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn record_applied_preserves_the_remote_origin() {
        let db = DBService::new_in_memory().await.unwrap();

        let mut data = Map::new();
        data.insert("ID".to_string(), json!(7));
        data.insert("NAME".to_string(), json!("seven"));
        let envelope = SyncEnvelope {
            event_id: Uuid::new_v4().to_string(),
            table: "items".to_string(),
            operation: Operation::Insert,
            pk: pk(7),
            data: Some(data),
            source_node: "STORE_2".to_string(),
            timestamp: Utc::now(),
        };

        let model = SyncEvent::record_applied(&db.pool, &envelope).await.unwrap();
        assert_eq!(model.status, EventStatus::Applied);
        assert_eq!(model.origin, "STORE_2");
        assert_eq!(model.table_name, "ITEMS");
        // Applied history never shows up for dispatch.
        assert!(SyncEvent::fetch_pending(&db.pool, 10).await.unwrap().is_empty());
    }
}
