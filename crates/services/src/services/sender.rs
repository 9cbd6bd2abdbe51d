use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use db::entities::{sync_destination, sync_event};
use db::events::{RelayFrame, SyncEnvelope};
use db::models::{sync_destination::SyncDestination, sync_node::SyncNode};
use db::types::DestinationStatus;
use db::{DBService, DbErr};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::services::config::Config;
use crate::services::relay::{RelayError, RelayHandle};
use crate::services::shutdown::wait_for_shutdown;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("remote returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("envelope serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Network seam of the sender: delivers one envelope to one peer URL.
/// Mocked in tests; the production implementation posts over HTTP.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn send(&self, url: &str, envelope: &SyncEnvelope) -> Result<(), TransportError>;
}

/// Direct delivery: `POST <peer-url>` with the shared token header.
pub struct HttpTransport {
    client: reqwest::Client,
    token: String,
}

impl HttpTransport {
    pub fn new(timeout: Duration, token: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| TransportError::Request(err.to_string()))?;
        Ok(Self {
            client,
            token: token.to_string(),
        })
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn send(&self, url: &str, envelope: &SyncEnvelope) -> Result<(), TransportError> {
        let response = self
            .client
            .post(url)
            .header("X-Sync-Token", &self.token)
            .json(envelope)
            .send()
            .await
            .map_err(|err| TransportError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Drains pending destinations, grouped by target node. Retries happen on
/// the tick cadence; there is no exponential backoff by design.
pub struct Sender<T: SyncTransport> {
    db: DBService,
    transport: T,
    relay: Option<RelayHandle>,
    node_id: String,
    batch_size: u64,
    retry_max: i32,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl<T: SyncTransport + 'static> Sender<T> {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

impl<T: SyncTransport> Sender<T> {
    pub fn new(
        db: DBService,
        config: &Config,
        transport: T,
        relay: Option<RelayHandle>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            transport,
            relay,
            node_id: config.node_id.clone(),
            batch_size: config.batch_size(),
            retry_max: config.integration.retry_max.max(1),
            interval: config.tick_interval(),
            shutdown,
        }
    }

    async fn run(mut self) {
        tracing::info!(interval_secs = self.interval.as_secs(), "sender started");
        loop {
            match self.tick().await {
                Ok(stats) if stats.sent > 0 || stats.failed > 0 => {
                    tracing::debug!(sent = stats.sent, failed = stats.failed, "send pass done");
                }
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "send tick failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = wait_for_shutdown(&mut self.shutdown) => {
                    tracing::info!("sender stopping");
                    return;
                }
            }
        }
    }

    /// One delivery pass over the pending/retry destinations.
    pub async fn tick(&self) -> Result<SendStats, DbErr> {
        let batch = SyncDestination::fetch_pending(&self.db.pool, self.batch_size).await?;
        if batch.is_empty() {
            return Ok(SendStats::default());
        }

        // Group per target; BTreeMap keeps node order deterministic and the
        // ascending fetch keeps per-node event order intact.
        let mut per_node: BTreeMap<String, Vec<(sync_destination::Model, sync_event::Model)>> =
            BTreeMap::new();
        for (destination, event) in batch {
            per_node.entry(destination.node_id.clone()).or_default().push((destination, event));
        }

        let peers = SyncNode::active_peers(&self.db.pool).await?;
        let urls: HashMap<String, Option<String>> = peers
            .into_iter()
            .map(|peer| (peer.node_id, peer.remote_url))
            .collect();

        let mut stats = SendStats::default();
        for (node_id, tasks) in per_node {
            let url = urls.get(&node_id).and_then(|u| u.clone()).filter(|u| !u.is_empty());
            if url.is_none() && self.relay.is_none() {
                // Unreachable for now; rows stay pending/retry untouched.
                tracing::debug!(node_id = %node_id, "no route to node, skipping");
                continue;
            }

            for (destination, event) in tasks {
                let envelope = SyncEnvelope::from_event(&event, &self.node_id);
                let result = match &url {
                    Some(url) => self.transport.send(url, &envelope).await,
                    None => self.send_via_relay(&node_id, &envelope),
                };

                match result {
                    Ok(()) => {
                        SyncDestination::update_status(
                            &self.db.pool,
                            destination.id,
                            DestinationStatus::Sent,
                            None,
                        )
                        .await?;
                        stats.sent += 1;
                    }
                    Err(err) => {
                        let error = err.to_string();
                        let exhausted = destination.attempts + 1 >= self.retry_max;
                        let status = if exhausted {
                            DestinationStatus::Failed
                        } else {
                            DestinationStatus::Retry
                        };
                        tracing::warn!(
                            node_id = %node_id,
                            destination_id = destination.id,
                            error = %error,
                            exhausted,
                            "delivery failed"
                        );
                        SyncDestination::update_status(
                            &self.db.pool,
                            destination.id,
                            status,
                            Some(&error),
                        )
                        .await?;
                        if exhausted {
                            stats.failed += 1;
                        } else {
                            stats.retried += 1;
                        }
                        // A stuck peer must not eat the rest of the batch,
                        // and skipping ahead would break per-node ordering.
                        break;
                    }
                }
            }
        }
        Ok(stats)
    }

    fn send_via_relay(&self, node_id: &str, envelope: &SyncEnvelope) -> Result<(), TransportError> {
        let relay = self.relay.as_ref().expect("relay route resolved without a relay");
        let frame = RelayFrame::sync(node_id, &self.node_id, envelope)?;
        relay.try_send(frame)?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SendStats {
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use db::models::sync_event::SyncEvent;
    use db::types::Operation;
    use serde_json::{json, Map};
    use tokio::sync::mpsc;

    use super::*;
    use crate::services::relay::RelayHandle;

    #[derive(Default)]
    struct MockTransport {
        delivered: Mutex<Vec<(String, String)>>,
        failing_urls: Mutex<Vec<String>>,
    }

    impl MockTransport {
        fn fail_url(&self, url: &str) {
            self.failing_urls.lock().unwrap().push(url.to_string());
        }

        fn deliveries(&self) -> Vec<(String, String)> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SyncTransport for Arc<MockTransport> {
        async fn send(&self, url: &str, envelope: &SyncEnvelope) -> Result<(), TransportError> {
            if self.failing_urls.lock().unwrap().iter().any(|u| u == url) {
                return Err(TransportError::Request("connection refused".to_string()));
            }
            self.delivered
                .lock()
                .unwrap()
                .push((url.to_string(), envelope.event_id.to_string()));
            Ok(())
        }
    }

    fn config(retry_max: i32) -> Config {
        let mut config: Config =
            serde_yaml::from_str("node_id: STORE_A\ndatabase:\n  dsn: \"sqlite::memory:\"\n").unwrap();
        config.integration.retry_max = retry_max;
        config
    }

    async fn seed_event(db: &DBService, node: &str) -> i64 {
        let mut pk = Map::new();
        pk.insert("ID".to_string(), json!(1));
        let event = SyncEvent::enqueue(&db.pool, "ITEMS", Operation::Insert, pk, None, "TRIGGER")
            .await
            .unwrap();
        SyncDestination::create_for_event(&db.pool, &event, &[node.to_string()])
            .await
            .unwrap();
        event.id
    }

    fn sender(
        db: &DBService,
        transport: &Arc<MockTransport>,
        relay: Option<RelayHandle>,
        retry_max: i32,
    ) -> Sender<Arc<MockTransport>> {
        let (_tx, rx) = watch::channel(false);
        Sender::new(db.clone(), &config(retry_max), transport.clone(), relay, rx)
    }

    async fn destination_states(db: &DBService) -> Vec<(String, DestinationStatus, i32)> {
        use sea_orm::{EntityTrait, QueryOrder};
        sync_destination::Entity::find()
            .order_by_asc(sync_destination::Column::Id)
            .all(&db.pool)
            .await
            .unwrap()
            .into_iter()
            .map(|d| (d.node_id, d.status, d.attempts))
            .collect()
    }

    #[tokio::test]
    async fn successful_delivery_marks_the_destination_sent() {
        let db = DBService::new_in_memory().await.unwrap();
        SyncNode::register(&db.pool, "STORE_B", Some("http://b:8080/sync")).await.unwrap();
        seed_event(&db, "STORE_B").await;

        let transport = Arc::new(MockTransport::default());
        let stats = sender(&db, &transport, None, 5).tick().await.unwrap();

        assert_eq!(stats.sent, 1);
        let deliveries = transport.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].0, "http://b:8080/sync");
        assert_eq!(
            destination_states(&db).await,
            vec![("STORE_B".to_string(), DestinationStatus::Sent, 1)]
        );
        // Nothing left for the next tick.
        assert!(SyncDestination::fetch_pending(&db.pool, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_stops_the_node_but_not_the_tick() {
        let db = DBService::new_in_memory().await.unwrap();
        SyncNode::register(&db.pool, "STORE_B", Some("http://b:8080/sync")).await.unwrap();
        SyncNode::register(&db.pool, "STORE_C", Some("http://c:8080/sync")).await.unwrap();

        // Two events for each node.
        for _ in 0..2 {
            let mut pk = Map::new();
            pk.insert("ID".to_string(), json!(1));
            let event =
                SyncEvent::enqueue(&db.pool, "ITEMS", Operation::Insert, pk, None, "TRIGGER")
                    .await
                    .unwrap();
            SyncDestination::create_for_event(
                &db.pool,
                &event,
                &["STORE_B".to_string(), "STORE_C".to_string()],
            )
            .await
            .unwrap();
        }

        let transport = Arc::new(MockTransport::default());
        transport.fail_url("http://b:8080/sync");
        let stats = sender(&db, &transport, None, 5).tick().await.unwrap();

        // B: first task failed, second never attempted. C: both delivered.
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.sent, 2);
        let states = destination_states(&db).await;
        let b_states: Vec<_> = states.iter().filter(|s| s.0 == "STORE_B").collect();
        assert_eq!(b_states[0].1, DestinationStatus::Retry);
        assert_eq!(b_states[0].2, 1);
        assert_eq!(b_states[1].1, DestinationStatus::Pending);
        assert_eq!(b_states[1].2, 0);
        assert!(states.iter().filter(|s| s.0 == "STORE_C").all(|s| s.1 == DestinationStatus::Sent));
    }

    #[tokio::test]
    async fn exhausted_retries_park_the_destination_as_failed() {
        let db = DBService::new_in_memory().await.unwrap();
        SyncNode::register(&db.pool, "STORE_B", Some("http://b:8080/sync")).await.unwrap();
        seed_event(&db, "STORE_B").await;

        let transport = Arc::new(MockTransport::default());
        transport.fail_url("http://b:8080/sync");
        let worker = sender(&db, &transport, None, 2);

        worker.tick().await.unwrap();
        assert_eq!(
            destination_states(&db).await,
            vec![("STORE_B".to_string(), DestinationStatus::Retry, 1)]
        );

        worker.tick().await.unwrap();
        assert_eq!(
            destination_states(&db).await,
            vec![("STORE_B".to_string(), DestinationStatus::Failed, 2)]
        );

        // Failed destinations are never offered again.
        let stats = worker.tick().await.unwrap();
        assert_eq!(stats.sent + stats.retried + stats.failed, 0);
    }

    #[tokio::test]
    async fn unreachable_nodes_cost_no_attempts() {
        let db = DBService::new_in_memory().await.unwrap();
        SyncNode::register(&db.pool, "STORE_B", None).await.unwrap();
        seed_event(&db, "STORE_B").await;

        let transport = Arc::new(MockTransport::default());
        let stats = sender(&db, &transport, None, 5).tick().await.unwrap();

        assert_eq!(stats.sent + stats.retried + stats.failed, 0);
        assert_eq!(
            destination_states(&db).await,
            vec![("STORE_B".to_string(), DestinationStatus::Pending, 0)]
        );
    }

    #[tokio::test]
    async fn relay_acceptance_counts_as_sent() {
        let db = DBService::new_in_memory().await.unwrap();
        SyncNode::register(&db.pool, "STORE_B", None).await.unwrap();
        seed_event(&db, "STORE_B").await;

        let (tx, mut rx) = mpsc::channel(4);
        let transport = Arc::new(MockTransport::default());
        let stats = sender(&db, &transport, Some(RelayHandle::new(tx)), 5)
            .tick()
            .await
            .unwrap();

        assert_eq!(stats.sent, 1);
        assert!(transport.deliveries().is_empty());
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.target, "STORE_B");
        assert_eq!(frame.source, "STORE_A");

        assert_eq!(
            destination_states(&db).await,
            vec![("STORE_B".to_string(), DestinationStatus::Sent, 1)]
        );
    }

    #[tokio::test]
    async fn a_full_relay_channel_is_back_pressure_not_loss() {
        let db = DBService::new_in_memory().await.unwrap();
        SyncNode::register(&db.pool, "STORE_B", None).await.unwrap();
        seed_event(&db, "STORE_B").await;

        let (tx, _rx) = mpsc::channel(1);
        // Fill the only slot so the sender's enqueue fails fast.
        tx.try_send(RelayFrame {
            target: "X".to_string(),
            source: "X".to_string(),
            payload: json!({}),
            frame_type: db::events::FrameType::Ping,
        })
        .unwrap();

        let transport = Arc::new(MockTransport::default());
        let stats = sender(&db, &transport, Some(RelayHandle::new(tx)), 5)
            .tick()
            .await
            .unwrap();

        assert_eq!(stats.retried, 1);
        let states = destination_states(&db).await;
        assert_eq!(states[0].1, DestinationStatus::Retry);
        assert!(states[0].2 > 0);
    }

    #[tokio::test]
    async fn direct_url_wins_over_the_relay() {
        let db = DBService::new_in_memory().await.unwrap();
        SyncNode::register(&db.pool, "STORE_B", Some("http://b:8080/sync")).await.unwrap();
        seed_event(&db, "STORE_B").await;

        let (tx, mut rx) = mpsc::channel(4);
        let transport = Arc::new(MockTransport::default());
        sender(&db, &transport, Some(RelayHandle::new(tx)), 5)
            .tick()
            .await
            .unwrap();

        assert_eq!(transport.deliveries().len(), 1);
        assert!(rx.try_recv().is_err());
    }
}
