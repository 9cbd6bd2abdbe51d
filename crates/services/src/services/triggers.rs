use db::models::integrated_table::IntegratedTable;
use db::{DbErr, DbPool};
use sea_orm::{ConnectionTrait, DbBackend, Statement};
use thiserror::Error;

/// SQL expression producing a fresh v4 UUID rendered as 36-char text, so the
/// trigger can stamp event ids without any application round-trip.
const UUID_SQL: &str = "lower(hex(randomblob(4))) || '-' || lower(hex(randomblob(2))) || '-4' \
                        || substr(lower(hex(randomblob(2))), 2) || '-' \
                        || substr('89ab', (abs(random()) % 4) + 1, 1) \
                        || substr(lower(hex(randomblob(2))), 2) || '-' \
                        || lower(hex(randomblob(6)))";

/// Every capture trigger bails out while the apply transaction holds the
/// guard, so replaying a remote change never re-enters the outbox.
const GUARD_CLEAR_SQL: &str = "(SELECT suppressed FROM sync_apply_guard WHERE id = 1) = 0";

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(transparent)]
    Db(#[from] DbErr),
    #[error("unsafe identifier: {0}")]
    UnsafeIdentifier(String),
    #[error("table {0} does not exist")]
    UnknownTable(String),
    #[error("table {0} has no primary key")]
    NoPrimaryKey(String),
}

#[derive(Clone, Debug)]
pub struct TableColumn {
    pub name: String,
    pub pk_position: i32,
}

/// Column catalog for one table, in declaration order. Errors when the table
/// is missing so callers surface a configuration problem instead of
/// installing empty triggers.
pub async fn table_columns<C: ConnectionTrait>(
    db: &C,
    table: &str,
) -> Result<Vec<TableColumn>, TriggerError> {
    ensure_safe_identifier(table)?;
    let stmt = Statement::from_string(
        DbBackend::Sqlite,
        format!("PRAGMA table_info(\"{table}\")"),
    );
    let rows = db.query_all(stmt).await?;
    if rows.is_empty() {
        return Err(TriggerError::UnknownTable(table.to_string()));
    }

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        columns.push(TableColumn {
            name: row.try_get::<String>("", "name")?,
            pk_position: row.try_get::<i32>("", "pk")?,
        });
    }
    Ok(columns)
}

/// Primary-key column names in key order.
pub fn pk_columns(columns: &[TableColumn]) -> Vec<&TableColumn> {
    let mut pks: Vec<&TableColumn> = columns.iter().filter(|c| c.pk_position > 0).collect();
    pks.sort_by_key(|c| c.pk_position);
    pks
}

fn ensure_safe_identifier(name: &str) -> Result<(), TriggerError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.chars().next().is_some_and(|c| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(TriggerError::UnsafeIdentifier(name.to_string()))
    }
}

/// Installs and removes the capture triggers that feed the outbox.
pub struct TriggerInstaller {
    db: DbPool,
    ignored_columns: Vec<String>,
}

impl TriggerInstaller {
    pub fn new(db: DbPool, ignored_columns: &[String]) -> Self {
        Self {
            db,
            ignored_columns: ignored_columns.iter().map(|c| c.to_uppercase()).collect(),
        }
    }

    fn is_ignored(&self, column: &str) -> bool {
        self.ignored_columns.iter().any(|c| c == &column.to_uppercase())
    }

    /// Installs triggers for every registered active table.
    pub async fn install_all(&self) -> Result<usize, TriggerError> {
        let tables = IntegratedTable::all_active(&self.db).await?;
        let mut installed = 0;
        for table in &tables {
            self.install_for_table(&table.table_name).await?;
            installed += 1;
        }
        Ok(installed)
    }

    pub async fn uninstall_all(&self) -> Result<(), TriggerError> {
        let tables = IntegratedTable::all_active(&self.db).await?;
        for table in &tables {
            self.uninstall_for_table(&table.table_name).await?;
        }
        Ok(())
    }

    /// Creates the insert/update/delete capture triggers for one table.
    /// `CREATE OR REPLACE` is not a SQLite concept, so install drops first
    /// and recreates, which also picks up column additions.
    pub async fn install_for_table(&self, table: &str) -> Result<(), TriggerError> {
        ensure_safe_identifier(table)?;
        let columns = table_columns(&self.db, table).await?;
        let pks = pk_columns(&columns);
        if pks.is_empty() {
            return Err(TriggerError::NoPrimaryKey(table.to_string()));
        }
        for column in &columns {
            ensure_safe_identifier(&column.name)?;
        }

        self.uninstall_for_table(table).await?;

        let payload_columns: Vec<&TableColumn> =
            columns.iter().filter(|c| !self.is_ignored(&c.name)).collect();
        let pk_new = json_object_expr(&pks, "NEW");
        let pk_old = json_object_expr(&pks, "OLD");
        let payload_new = json_object_expr(&payload_columns, "NEW");

        let insert_trigger = format!(
            "CREATE TRIGGER \"{name}\" AFTER INSERT ON \"{table}\"\n\
             WHEN {guard}\n\
             BEGIN\n\
             {body}\n\
             END;",
            name = trigger_name(table, "ins"),
            guard = GUARD_CLEAR_SQL,
            body = outbox_insert_sql(table, "I", &pk_new, &payload_new),
        );
        self.db.execute_unprepared(&insert_trigger).await?;

        // No update trigger when every column is ignored; nothing outside the
        // ignore set can ever change.
        if !payload_columns.is_empty() {
            let change_check = payload_columns
                .iter()
                .map(|c| format!("OLD.\"{0}\" IS NOT NEW.\"{0}\"", c.name))
                .collect::<Vec<_>>()
                .join(" OR ");
            let update_trigger = format!(
                "CREATE TRIGGER \"{name}\" AFTER UPDATE ON \"{table}\"\n\
                 WHEN {guard} AND ({change_check})\n\
                 BEGIN\n\
                 {body}\n\
                 END;",
                name = trigger_name(table, "upd"),
                guard = GUARD_CLEAR_SQL,
                body = outbox_insert_sql(table, "U", &pk_new, &payload_new),
            );
            self.db.execute_unprepared(&update_trigger).await?;
        }

        let delete_trigger = format!(
            "CREATE TRIGGER \"{name}\" AFTER DELETE ON \"{table}\"\n\
             WHEN {guard}\n\
             BEGIN\n\
             {body}\n\
             END;",
            name = trigger_name(table, "del"),
            guard = GUARD_CLEAR_SQL,
            body = outbox_insert_sql(table, "D", &pk_old, "NULL"),
        );
        self.db.execute_unprepared(&delete_trigger).await?;

        Ok(())
    }

    pub async fn uninstall_for_table(&self, table: &str) -> Result<(), TriggerError> {
        ensure_safe_identifier(table)?;
        for suffix in ["ins", "upd", "del"] {
            let sql = format!("DROP TRIGGER IF EXISTS \"{}\"", trigger_name(table, suffix));
            self.db.execute_unprepared(&sql).await?;
        }
        Ok(())
    }
}

fn trigger_name(table: &str, suffix: &str) -> String {
    format!("trg_sync_{}_{}", table.to_lowercase(), suffix)
}

fn json_object_expr(columns: &[&TableColumn], row: &str) -> String {
    let pairs = columns
        .iter()
        .map(|c| format!("'{0}', {row}.\"{0}\"", c.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!("json_object({pairs})")
}

fn outbox_insert_sql(table: &str, operation: &str, pk_expr: &str, payload_expr: &str) -> String {
    format!(
        "  INSERT INTO sync_events \
         (event_id, table_name, operation, pk, payload, origin, status, attempts, created_at) \
         VALUES ({UUID_SQL}, '{table}', '{operation}', {pk_expr}, {payload_expr}, \
         'TRIGGER', 'pending', 0, CURRENT_TIMESTAMP);"
    )
}
