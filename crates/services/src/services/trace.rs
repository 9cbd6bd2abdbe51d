use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use db::models::{integrated_table::IntegratedTable, sync_event::SyncEvent};
use db::types::Operation;
use db::{DBService, DbErr};
use sea_orm::{ConnectionTrait, JsonValue, Statement};
use serde::Deserialize;
use serde_json::Map;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::services::apply::pk_predicate;
use crate::services::shutdown::wait_for_shutdown;
use crate::services::triggers::{self, TriggerError};

/// Parsed audit-feed record: which row changed and how. The raw-line parser
/// that produces these from a database trace is deliberately pluggable; this
/// adapter only trusts the tuple shape.
#[derive(Clone, Debug, Deserialize)]
pub struct TraceEvent {
    pub table: String,
    pub operation: Operation,
    pub pk: Map<String, JsonValue>,
}

pub trait TraceLineParser: Send + Sync {
    fn parse_line(&self, line: &str) -> Option<TraceEvent>;
}

/// Default feed format: one JSON object per line, already in tuple shape.
pub struct JsonLineParser;

impl TraceLineParser for JsonLineParser {
    fn parse_line(&self, line: &str) -> Option<TraceEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        match serde_json::from_str(trimmed) {
            Ok(event) => Some(event),
            Err(err) => {
                tracing::debug!(error = %err, "unparseable trace line skipped");
                None
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error(transparent)]
    Db(#[from] DbErr),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Tails the audit feed and turns committed changes into outbox events.
///
/// Best-effort capture for databases where triggers cannot be installed:
/// lines written while the agent is down are never replayed, which is why
/// the trigger path stays authoritative.
pub struct TraceListener {
    db: DBService,
    node_id: String,
    log_path: PathBuf,
    poll_interval: Duration,
    parser: Box<dyn TraceLineParser>,
    shutdown: watch::Receiver<bool>,
}

impl TraceListener {
    pub fn new(
        db: DBService,
        node_id: &str,
        log_path: PathBuf,
        poll_interval: Duration,
        parser: Box<dyn TraceLineParser>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            node_id: node_id.to_string(),
            log_path,
            poll_interval,
            parser,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        if let Err(err) = self.tail_loop().await {
            tracing::error!(error = %err, path = %self.log_path.display(), "trace listener stopped");
        }
    }

    async fn tail_loop(&mut self) -> Result<(), TraceError> {
        let file = tokio::fs::File::open(&self.log_path).await?;
        let mut reader = BufReader::new(file);
        // Only new entries matter; everything before startup is history.
        reader.seek(SeekFrom::End(0)).await?;
        tracing::info!(path = %self.log_path.display(), "trace listener tailing audit feed");

        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line).await?;
            if read == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => continue,
                    _ = wait_for_shutdown(&mut self.shutdown) => return Ok(()),
                }
            }

            let Some(event) = self.parser.parse_line(&line) else {
                continue;
            };
            match resolve_and_enqueue(&self.db, &self.node_id, &event).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(table = %event.table, "trace event skipped");
                }
                Err(err) => {
                    tracing::warn!(table = %event.table, error = %err, "trace capture failed");
                }
            }
        }
    }
}

/// Turns one trace tuple into an outbox event. Inserts and updates snapshot
/// the current row image by primary key; the snapshot is built by the
/// database itself so column types survive untouched.
pub async fn resolve_and_enqueue(
    db: &DBService,
    node_id: &str,
    event: &TraceEvent,
) -> Result<bool, TraceError> {
    if !IntegratedTable::is_integrated(&db.pool, &event.table).await? {
        return Ok(false);
    }
    if event.pk.is_empty() {
        return Ok(false);
    }

    if event.operation == Operation::Delete {
        SyncEvent::enqueue(
            &db.pool,
            &event.table,
            Operation::Delete,
            event.pk.clone(),
            None,
            node_id,
        )
        .await?;
        return Ok(true);
    }

    let Some(snapshot) = fetch_snapshot(db, event).await? else {
        // The row vanished between the trace line and our read.
        return Ok(false);
    };

    SyncEvent::enqueue(
        &db.pool,
        &event.table,
        event.operation,
        event.pk.clone(),
        Some(snapshot),
        node_id,
    )
    .await?;
    Ok(true)
}

async fn fetch_snapshot(
    db: &DBService,
    event: &TraceEvent,
) -> Result<Option<Map<String, JsonValue>>, TraceError> {
    let columns = triggers::table_columns(&db.pool, &event.table).await?;
    let pairs = columns
        .iter()
        .map(|c| format!("'{0}', \"{0}\"", c.name))
        .collect::<Vec<_>>()
        .join(", ");

    let (where_clause, values) = pk_predicate(&event.pk);
    let sql = format!(
        "SELECT json_object({pairs}) AS row_image FROM \"{}\" WHERE {}",
        event.table, where_clause
    );

    let row = db
        .pool
        .query_one(Statement::from_sql_and_values(
            db.pool.get_database_backend(),
            sql,
            values,
        ))
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let raw: String = row.try_get("", "row_image")?;
    let parsed: JsonValue = serde_json::from_str(&raw).unwrap_or(JsonValue::Null);
    Ok(parsed.as_object().cloned())
}
