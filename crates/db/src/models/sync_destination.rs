use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};

use crate::entities::{sync_destination, sync_event};
use crate::models::sync_event::SyncEvent;
use crate::types::DestinationStatus;

pub struct SyncDestination;

impl SyncDestination {
    /// Fans one event out to every active peer except its origin and flips
    /// the event to `Dispatched`, all in a single transaction. The caller is
    /// expected to skip events entirely while no peers are known, so they
    /// stay `Pending` and are re-fanned once peers register.
    pub async fn create_for_event<C>(
        db: &C,
        event: &sync_event::Model,
        peer_ids: &[String],
    ) -> Result<usize, DbErr>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let txn = db.begin().await?;

        let mut created = 0;
        for peer_id in peer_ids {
            if *peer_id == event.origin {
                continue;
            }
            let active = sync_destination::ActiveModel {
                event_id: Set(event.id),
                node_id: Set(peer_id.clone()),
                status: Set(DestinationStatus::Pending),
                attempts: Set(0),
                last_error: Set(None),
                last_attempt_at: Set(None),
                ..Default::default()
            };
            active.insert(&txn).await?;
            created += 1;
        }

        SyncEvent::mark_dispatched(&txn, event.id).await?;
        txn.commit().await?;
        Ok(created)
    }

    /// Oldest-first batch of destinations still owed a delivery, joined with
    /// their event rows. Ascending destination id also means ascending event
    /// id per node, which is the per-node FIFO the sender relies on.
    pub async fn fetch_pending<C: ConnectionTrait>(
        db: &C,
        limit: u64,
    ) -> Result<Vec<(sync_destination::Model, sync_event::Model)>, DbErr> {
        let rows = sync_destination::Entity::find()
            .filter(
                sync_destination::Column::Status
                    .is_in([DestinationStatus::Pending, DestinationStatus::Retry]),
            )
            .order_by_asc(sync_destination::Column::Id)
            .limit(limit)
            .find_also_related(sync_event::Entity)
            .all(db)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(destination, event)| event.map(|event| (destination, event)))
            .collect())
    }

    /// Sets the new state, stamps the attempt and bumps the counter.
    pub async fn update_status<C: ConnectionTrait>(
        db: &C,
        id: i64,
        status: DestinationStatus,
        error: Option<&str>,
    ) -> Result<(), DbErr> {
        let record = sync_destination::Entity::find_by_id(id)
            .one(db)
            .await?
            .ok_or(DbErr::RecordNotFound("sync destination not found".to_string()))?;

        let attempts = record.attempts + 1;
        let mut active: sync_destination::ActiveModel = record.into();
        active.status = Set(status);
        active.attempts = Set(attempts);
        active.last_error = Set(error.map(str::to_string));
        active.last_attempt_at = Set(Some(Utc::now()));
        active.update(db).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::*;
    use crate::models::sync_node::SyncNode;
    use crate::types::{EventStatus, Operation};
    use crate::DBService;

    async fn captured_event(db: &DBService, origin: &str) -> sync_event::Model {
        let mut pk = Map::new();
        pk.insert("ID".to_string(), json!(1));
        SyncEvent::enqueue(&db.pool, "CUSTOMERS", Operation::Insert, pk, None, origin)
            .await
            .unwrap()
    }

    fn peer_ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[tokio::test]
    async fn fan_out_excludes_the_origin_node() {
        let db = DBService::new_in_memory().await.unwrap();
        let event = captured_event(&db, "STORE_A").await;

        let created = SyncDestination::create_for_event(
            &db.pool,
            &event,
            &peer_ids(&["STORE_A", "STORE_B", "STORE_C"]),
        )
        .await
        .unwrap();

        assert_eq!(created, 2);
        let pending = SyncDestination::fetch_pending(&db.pool, 10).await.unwrap();
        let nodes: Vec<&str> = pending.iter().map(|(d, _)| d.node_id.as_str()).collect();
        assert_eq!(nodes, vec!["STORE_B", "STORE_C"]);
        assert!(pending.iter().all(|(_, e)| e.status == EventStatus::Dispatched));
    }

    #[tokio::test]
    async fn fan_out_marks_the_event_dispatched_atomically() {
        let db = DBService::new_in_memory().await.unwrap();
        let event = captured_event(&db, "TRIGGER").await;

        SyncDestination::create_for_event(&db.pool, &event, &peer_ids(&["STORE_B"]))
            .await
            .unwrap();

        assert!(SyncEvent::fetch_pending(&db.pool, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_batch_joins_event_rows_oldest_first() {
        let db = DBService::new_in_memory().await.unwrap();
        SyncNode::register(&db.pool, "STORE_B", Some("http://b:8080/sync"))
            .await
            .unwrap();

        let first = captured_event(&db, "TRIGGER").await;
        let second = captured_event(&db, "TRIGGER").await;
        SyncDestination::create_for_event(&db.pool, &first, &peer_ids(&["STORE_B"]))
            .await
            .unwrap();
        SyncDestination::create_for_event(&db.pool, &second, &peer_ids(&["STORE_B"]))
            .await
            .unwrap();

        let batch = SyncDestination::fetch_pending(&db.pool, 10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].1.id, first.id);
        assert_eq!(batch[1].1.id, second.id);
    }

    #[tokio::test]
    async fn status_updates_count_attempts_and_keep_errors() {
        let db = DBService::new_in_memory().await.unwrap();
        let event = captured_event(&db, "TRIGGER").await;
        SyncDestination::create_for_event(&db.pool, &event, &peer_ids(&["STORE_B"]))
            .await
            .unwrap();
        let (destination, _) = SyncDestination::fetch_pending(&db.pool, 1)
            .await
            .unwrap()
            .remove(0);

        SyncDestination::update_status(
            &db.pool,
            destination.id,
            DestinationStatus::Retry,
            Some("connection refused"),
        )
        .await
        .unwrap();

        let (retried, _) = SyncDestination::fetch_pending(&db.pool, 1)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(retried.status, DestinationStatus::Retry);
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.last_error.as_deref(), Some("connection refused"));
        assert!(retried.last_attempt_at.is_some());

        SyncDestination::update_status(&db.pool, retried.id, DestinationStatus::Sent, None)
            .await
            .unwrap();
        assert!(SyncDestination::fetch_pending(&db.pool, 10).await.unwrap().is_empty());
    }
}
