use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder,
    Set,
};

use crate::entities::sync_node;

pub struct SyncNode;

impl SyncNode {
    /// Upserts a peer: refreshes `last_seen`, re-activates it, and records
    /// the URL when one is offered. A `None` URL never erases a known one,
    /// since the relay path has no TCP address to infer from.
    pub async fn register<C: ConnectionTrait>(
        db: &C,
        node_id: &str,
        remote_url: Option<&str>,
    ) -> Result<sync_node::Model, DbErr> {
        let existing = sync_node::Entity::find()
            .filter(sync_node::Column::NodeId.eq(node_id))
            .one(db)
            .await?;

        match existing {
            Some(record) => {
                let mut active: sync_node::ActiveModel = record.into();
                if let Some(url) = remote_url {
                    active.remote_url = Set(Some(url.to_string()));
                }
                active.last_seen = Set(Utc::now());
                active.active = Set(true);
                active.update(db).await
            }
            None => {
                let active = sync_node::ActiveModel {
                    node_id: Set(node_id.to_string()),
                    remote_url: Set(remote_url.map(str::to_string)),
                    last_seen: Set(Utc::now()),
                    active: Set(true),
                    ..Default::default()
                };
                active.insert(db).await
            }
        }
    }

    /// Snapshot of the peers eligible for fan-out, re-fetched each tick.
    pub async fn active_peers<C: ConnectionTrait>(db: &C) -> Result<Vec<sync_node::Model>, DbErr> {
        sync_node::Entity::find()
            .filter(sync_node::Column::Active.eq(true))
            .order_by_asc(sync_node::Column::NodeId)
            .all(db)
            .await
    }
}

#[cfg(test)]
mod tests {
    use sea_orm::ActiveModelTrait;

    use super::*;
    use crate::DBService;

    #[tokio::test]
    async fn register_inserts_then_updates_in_place() {
        let db = DBService::new_in_memory().await.unwrap();

        let first = SyncNode::register(&db.pool, "STORE_B", Some("http://b:8080/sync"))
            .await
            .unwrap();
        let second = SyncNode::register(&db.pool, "STORE_B", Some("http://b:9090/sync"))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.remote_url.as_deref(), Some("http://b:9090/sync"));
        assert!(second.last_seen >= first.last_seen);
        assert_eq!(SyncNode::active_peers(&db.pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_url_keeps_the_known_one() {
        let db = DBService::new_in_memory().await.unwrap();

        SyncNode::register(&db.pool, "STORE_B", Some("http://b:8080/sync"))
            .await
            .unwrap();
        let refreshed = SyncNode::register(&db.pool, "STORE_B", None).await.unwrap();

        assert_eq!(refreshed.remote_url.as_deref(), Some("http://b:8080/sync"));
    }

    #[tokio::test]
    async fn inactive_peers_are_left_out_of_the_snapshot() {
        let db = DBService::new_in_memory().await.unwrap();

        SyncNode::register(&db.pool, "STORE_B", None).await.unwrap();
        let record = SyncNode::register(&db.pool, "STORE_C", None).await.unwrap();

        let mut active: sync_node::ActiveModel = record.into();
        active.active = Set(false);
        active.update(&db.pool).await.unwrap();

        let peers = SyncNode::active_peers(&db.pool).await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].node_id, "STORE_B");

        // Re-registration revives a deactivated peer.
        SyncNode::register(&db.pool, "STORE_C", None).await.unwrap();
        assert_eq!(SyncNode::active_peers(&db.pool).await.unwrap().len(), 2);
    }
}
