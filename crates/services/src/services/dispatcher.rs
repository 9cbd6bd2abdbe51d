use std::time::Duration;

use db::models::{sync_destination::SyncDestination, sync_event::SyncEvent, sync_node::SyncNode};
use db::{DBService, DbErr};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::services::config::Config;
use crate::services::shutdown::wait_for_shutdown;

/// Expands pending outbox events into one destination row per active peer.
///
/// Runs on the shared tick interval; every tick is independent, so a failed
/// iteration is simply retried on the next one.
pub struct Dispatcher {
    db: DBService,
    batch_size: u64,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(db: DBService, config: &Config, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            db,
            batch_size: config.batch_size(),
            interval: config.tick_interval(),
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::info!(interval_secs = self.interval.as_secs(), "dispatcher started");
        loop {
            match self.tick().await {
                Ok(dispatched) if dispatched > 0 => {
                    tracing::debug!(dispatched, "events fanned out");
                }
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "dispatch tick failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = wait_for_shutdown(&mut self.shutdown) => {
                    tracing::info!("dispatcher stopping");
                    return;
                }
            }
        }
    }

    /// One fan-out pass. Events with no eligible peer (none known yet, or
    /// only their own origin) are left `Pending` so they are dispatched once
    /// peers register.
    pub async fn tick(&self) -> Result<usize, DbErr> {
        let events = SyncEvent::fetch_pending(&self.db.pool, self.batch_size).await?;
        if events.is_empty() {
            return Ok(0);
        }

        let peers = SyncNode::active_peers(&self.db.pool).await?;
        let peer_ids: Vec<String> = peers.into_iter().map(|p| p.node_id).collect();

        let mut dispatched = 0;
        for event in &events {
            if !peer_ids.iter().any(|id| *id != event.origin) {
                continue;
            }
            SyncDestination::create_for_event(&self.db.pool, event, &peer_ids).await?;
            dispatched += 1;
        }
        Ok(dispatched)
    }
}
