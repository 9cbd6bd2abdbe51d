use std::net::IpAddr;

use db::events::SyncEnvelope;
use db::models::{integrated_table::IntegratedTable, sync_event::SyncEvent, sync_node::SyncNode};
use db::types::TRIGGER_ORIGIN;
use db::{DBService, DbErr, TransactionTrait};
use sea_orm::{ConnectionTrait, JsonValue, Statement, Value};
use serde_json::Map;
use thiserror::Error;

/// Port assumed for a peer's webhook when its URL has to be inferred from
/// the TCP remote address. A future envelope field carrying the sender's
/// canonical listen URL would make this obsolete.
const INFERRED_PEER_PORT: u16 = 8080;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Db(#[from] DbErr),
    #[error("table {0} is not integrated")]
    TableNotIntegrated(String),
    #[error("unsafe identifier: {0}")]
    UnsafeIdentifier(String),
    #[error("envelope {0} has an empty primary key")]
    EmptyPrimaryKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The event id was already in the outbox; the delivery was absorbed.
    Duplicate,
}

/// Applies inbound envelopes. Both the HTTP receiver and the relay reader
/// funnel through here, so deduplication and loop suppression behave the
/// same regardless of transport.
#[derive(Clone)]
pub struct ApplyService {
    db: DBService,
}

impl ApplyService {
    pub fn new(db: DBService) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &DBService {
        &self.db
    }

    /// Executes the receive algorithm: auto-register the sender, absorb
    /// duplicates, then apply the change and its history row in one
    /// transaction with the capture guard raised.
    pub async fn process_envelope(
        &self,
        envelope: &SyncEnvelope,
        peer_ip: Option<IpAddr>,
    ) -> Result<ApplyOutcome, ApplyError> {
        self.auto_register(envelope, peer_ip).await;

        let event_id = envelope.event_id.to_string();
        if SyncEvent::is_duplicate(&self.db.pool, &event_id).await? {
            tracing::debug!(event_id = %event_id, "duplicate delivery absorbed");
            return Ok(ApplyOutcome::Duplicate);
        }

        ensure_safe_identifier(&envelope.table)?;
        for column in envelope.pk.keys().chain(envelope.data.iter().flat_map(|d| d.keys())) {
            ensure_safe_identifier(column)?;
        }
        if envelope.pk.is_empty() {
            return Err(ApplyError::EmptyPrimaryKey(event_id));
        }
        if !IntegratedTable::is_integrated(&self.db.pool, &envelope.table).await? {
            return Err(ApplyError::TableNotIntegrated(envelope.table.clone()));
        }

        let txn = self.db.pool.begin().await?;
        // Raised guard keeps the capture triggers out of this transaction;
        // it is cleared before commit and rolls back with it on failure.
        txn.execute_unprepared("UPDATE sync_apply_guard SET suppressed = 1 WHERE id = 1")
            .await?;

        if envelope.operation == db::types::Operation::Delete {
            self.delete_row(&txn, envelope).await?;
        } else {
            self.upsert_row(&txn, envelope).await?;
        }

        SyncEvent::record_applied(&txn, envelope).await?;
        txn.execute_unprepared("UPDATE sync_apply_guard SET suppressed = 0 WHERE id = 1")
            .await?;
        txn.commit().await?;

        tracing::info!(
            event_id = %event_id,
            table = %envelope.table,
            operation = %envelope.operation,
            source = %envelope.source_node,
            "event applied"
        );
        Ok(ApplyOutcome::Applied)
    }

    /// Makes a previously unknown sender a future destination for local
    /// events. Best-effort: registration problems are logged, not fatal.
    async fn auto_register(&self, envelope: &SyncEnvelope, peer_ip: Option<IpAddr>) {
        let origin = envelope.source_node.trim();
        if origin.is_empty() || origin == TRIGGER_ORIGIN {
            return;
        }

        let inferred_url = peer_ip.map(|ip| {
            let host = match ip {
                IpAddr::V4(v4) => v4.to_string(),
                IpAddr::V6(v6) => format!("[{v6}]"),
            };
            format!("http://{host}:{INFERRED_PEER_PORT}/sync")
        });

        if let Err(err) =
            SyncNode::register(&self.db.pool, origin, inferred_url.as_deref()).await
        {
            tracing::warn!(node_id = origin, error = %err, "peer auto-registration failed");
        }
    }

    async fn delete_row<C: ConnectionTrait>(
        &self,
        conn: &C,
        envelope: &SyncEnvelope,
    ) -> Result<(), ApplyError> {
        let (where_clause, where_values) = pk_predicate(&envelope.pk);
        let sql = format!("DELETE FROM \"{}\" WHERE {}", envelope.table, where_clause);
        conn.execute(Statement::from_sql_and_values(
            conn.get_database_backend(),
            sql,
            where_values,
        ))
        .await?;
        Ok(())
    }

    /// Dialect equivalent of `UPDATE OR INSERT ... MATCHING (pk)`: an UPDATE
    /// keyed on the pk columns followed by an INSERT when no row matched,
    /// inside the caller's transaction.
    async fn upsert_row<C: ConnectionTrait>(
        &self,
        conn: &C,
        envelope: &SyncEnvelope,
    ) -> Result<(), ApplyError> {
        let backend = conn.get_database_backend();
        let mut merged: Map<String, JsonValue> = envelope.pk.clone();
        if let Some(data) = &envelope.data {
            for (column, value) in data {
                merged.insert(column.clone(), value.clone());
            }
        }

        let set_columns: Vec<&String> =
            merged.keys().filter(|c| !envelope.pk.contains_key(*c)).collect();
        let (where_clause, where_values) = pk_predicate(&envelope.pk);

        let rows_affected = if set_columns.is_empty() {
            // Pure-key row: probe for existence with a no-op assignment.
            let probe_column = envelope.pk.keys().next().expect("pk checked non-empty");
            let sql = format!(
                "UPDATE \"{}\" SET \"{probe_column}\" = \"{probe_column}\" WHERE {}",
                envelope.table, where_clause
            );
            conn.execute(Statement::from_sql_and_values(backend, sql, where_values.clone()))
                .await?
                .rows_affected()
        } else {
            let assignments = set_columns
                .iter()
                .map(|c| format!("\"{c}\" = ?"))
                .collect::<Vec<_>>()
                .join(", ");
            let mut values: Vec<Value> = set_columns
                .iter()
                .map(|c| bind_value(&merged[c.as_str()]))
                .collect();
            values.extend(where_values.clone());
            let sql = format!(
                "UPDATE \"{}\" SET {assignments} WHERE {}",
                envelope.table, where_clause
            );
            conn.execute(Statement::from_sql_and_values(backend, sql, values))
                .await?
                .rows_affected()
        };

        if rows_affected == 0 {
            let columns = merged
                .keys()
                .map(|c| format!("\"{c}\""))
                .collect::<Vec<_>>()
                .join(", ");
            let placeholders = vec!["?"; merged.len()].join(", ");
            let values: Vec<Value> = merged.values().map(bind_value).collect();
            let sql = format!(
                "INSERT INTO \"{}\" ({columns}) VALUES ({placeholders})",
                envelope.table
            );
            conn.execute(Statement::from_sql_and_values(backend, sql, values))
                .await?;
        }

        Ok(())
    }
}

pub(crate) fn pk_predicate(pk: &Map<String, JsonValue>) -> (String, Vec<Value>) {
    let clause = pk
        .keys()
        .map(|c| format!("\"{c}\" = ?"))
        .collect::<Vec<_>>()
        .join(" AND ");
    let values = pk.values().map(raw_bind_value).collect();
    (clause, values)
}

/// Bind for the value set of an upsert. Empty strings become NULL so numeric
/// and date columns accept payloads produced by text-building triggers.
fn bind_value(value: &JsonValue) -> Value {
    match value {
        JsonValue::String(s) if s.is_empty() => Value::String(None),
        other => raw_bind_value(other),
    }
}

fn raw_bind_value(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::String(None),
        JsonValue::Bool(b) => Value::Bool(Some(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::BigInt(Some(i))
            } else {
                Value::Double(n.as_f64())
            }
        }
        JsonValue::String(s) => Value::String(Some(Box::new(s.clone()))),
        // Nested structures are stored as their JSON text.
        other => Value::String(Some(Box::new(other.to_string()))),
    }
}

fn ensure_safe_identifier(name: &str) -> Result<(), ApplyError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.chars().next().is_some_and(|c| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(ApplyError::UnsafeIdentifier(name.to_string()))
    }
}
