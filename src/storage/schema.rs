//! Schema creation and additive migration.
//!
//! Older stores may predate the lineage columns, the cycle table or its
//! unconscious timestamps, the counter table, the pick table or the snapshot
//! table. Migration inspects what exists and only ever adds.

use sqlx::{Connection, Row, SqliteConnection};
use tracing::info;

use crate::error::{StorageError, StorageResult};

const CREATE_ANSWERS: &str = r#"
CREATE TABLE IF NOT EXISTS answers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    question_id TEXT NOT NULL,
    situation TEXT NOT NULL,
    value TEXT NOT NULL,
    answered_at TEXT NOT NULL,
    intent_id INTEGER,
    problem_id INTEGER,
    parent_id INTEGER,
    cycle_id INTEGER
)
"#;

const CREATE_CYCLES: &str = r#"
CREATE TABLE IF NOT EXISTS cycles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cycle_number INTEGER NOT NULL UNIQUE,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    unconscious_entered_at TEXT,
    unconscious_exited_at TEXT
)
"#;

const CREATE_TRANSITION_COUNTERS: &str = r#"
CREATE TABLE IF NOT EXISTS transition_counters (
    transition_key TEXT PRIMARY KEY,
    count INTEGER NOT NULL DEFAULT 0,
    last_reset_at TEXT,
    updated_at TEXT NOT NULL
)
"#;

const CREATE_CYCLE_PICKS: &str = r#"
CREATE TABLE IF NOT EXISTS cycle_picks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target_cycle_id INTEGER NOT NULL,
    source_cycle_id INTEGER,
    source_answer_id INTEGER NOT NULL,
    question_id TEXT NOT NULL,
    answer_text TEXT NOT NULL,
    situation TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (target_cycle_id, source_answer_id)
)
"#;

const CREATE_SNAPSHOTS: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL,
    situation TEXT NOT NULL,
    description TEXT,
    answer_count INTEGER NOT NULL,
    payload TEXT NOT NULL
)
"#;

const CREATE_INDEXES: [&str; 4] = [
    "CREATE INDEX IF NOT EXISTS idx_answers_situation ON answers (situation, cycle_id)",
    "CREATE INDEX IF NOT EXISTS idx_answers_question ON answers (question_id)",
    "CREATE INDEX IF NOT EXISTS idx_answers_intent ON answers (intent_id)",
    "CREATE INDEX IF NOT EXISTS idx_answers_problem ON answers (problem_id)",
];

/// Lineage columns added to pre-lineage answer tables.
const ANSWER_COLUMNS: [(&str, &str); 4] = [
    ("intent_id", "INTEGER"),
    ("problem_id", "INTEGER"),
    ("parent_id", "INTEGER"),
    ("cycle_id", "INTEGER"),
];

/// Columns added to cycle tables created before the unconscious state existed.
const CYCLE_COLUMNS: [(&str, &str); 2] = [
    ("unconscious_entered_at", "TEXT"),
    ("unconscious_exited_at", "TEXT"),
];

/// Every table holding store data.
pub(crate) const TABLES: [&str; 5] = [
    "answers",
    "cycles",
    "transition_counters",
    "cycle_picks",
    "snapshots",
];

/// Replace the contents of every data table with the rows of the same table
/// in the attached database `source`, in one transaction.
///
/// `sqlite_sequence` is left alone so discarded ids are never handed out again.
pub(crate) async fn copy_tables(conn: &mut SqliteConnection, source: &str) -> StorageResult<()> {
    let mut tx = conn.begin().await?;
    for table in TABLES {
        sqlx::query(&format!("DELETE FROM main.{}", table))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "INSERT INTO main.{table} SELECT * FROM {source}.{table}"
        ))
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

fn migration_error(step: &str, e: sqlx::Error) -> StorageError {
    StorageError::Migration {
        message: format!("{}: {}", step, e),
    }
}

/// Whether a table exists.
pub(crate) async fn table_exists(conn: &mut SqliteConnection, table: &str) -> StorageResult<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| migration_error("inspect tables", e))?;
    Ok(count > 0)
}

/// Column names of a table. Table names are internal constants.
pub(crate) async fn column_names(
    conn: &mut SqliteConnection,
    table: &str,
) -> StorageResult<Vec<String>> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", table))
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| migration_error("inspect columns", e))?;

    rows.iter()
        .map(|row| {
            row.try_get::<String, _>("name")
                .map_err(|e| migration_error("read column name", e))
        })
        .collect()
}

/// Create every table of a fresh store.
pub(crate) async fn create_schema(conn: &mut SqliteConnection) -> StorageResult<()> {
    for (step, sql) in [
        ("create answers", CREATE_ANSWERS),
        ("create cycles", CREATE_CYCLES),
        ("create transition_counters", CREATE_TRANSITION_COUNTERS),
        ("create cycle_picks", CREATE_CYCLE_PICKS),
        ("create snapshots", CREATE_SNAPSHOTS),
    ] {
        sqlx::query(sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| migration_error(step, e))?;
    }
    create_indexes(conn).await?;

    info!("Created answer store schema");
    Ok(())
}

async fn create_indexes(conn: &mut SqliteConnection) -> StorageResult<()> {
    for sql in CREATE_INDEXES {
        sqlx::query(sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| migration_error("create index", e))?;
    }
    Ok(())
}

async fn add_missing_columns(
    conn: &mut SqliteConnection,
    table: &str,
    wanted: &[(&str, &str)],
    applied: &mut Vec<String>,
) -> StorageResult<()> {
    let existing = column_names(conn, table).await?;
    for (column, sql_type) in wanted {
        if existing.iter().any(|c| c == column) {
            continue;
        }
        let step = format!("add {}.{}", table, column);
        sqlx::query(&format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            table, column, sql_type
        ))
        .execute(&mut *conn)
        .await
        .map_err(|e| migration_error(&step, e))?;
        applied.push(step);
    }
    Ok(())
}

async fn create_missing_table(
    conn: &mut SqliteConnection,
    table: &str,
    sql: &str,
    applied: &mut Vec<String>,
) -> StorageResult<()> {
    if table_exists(conn, table).await? {
        return Ok(());
    }
    let step = format!("create {}", table);
    sqlx::query(sql)
        .execute(&mut *conn)
        .await
        .map_err(|e| migration_error(&step, e))?;
    applied.push(step);
    Ok(())
}

/// Bring an existing store up to the current schema.
///
/// Returns the applied steps; an empty list means the schema was current.
pub(crate) async fn migrate(conn: &mut SqliteConnection) -> StorageResult<Vec<String>> {
    let mut applied = Vec::new();

    create_missing_table(conn, "answers", CREATE_ANSWERS, &mut applied).await?;
    add_missing_columns(conn, "answers", &ANSWER_COLUMNS, &mut applied).await?;

    create_missing_table(
        conn,
        "transition_counters",
        CREATE_TRANSITION_COUNTERS,
        &mut applied,
    )
    .await?;

    create_missing_table(conn, "cycles", CREATE_CYCLES, &mut applied).await?;
    add_missing_columns(conn, "cycles", &CYCLE_COLUMNS, &mut applied).await?;

    create_missing_table(conn, "cycle_picks", CREATE_CYCLE_PICKS, &mut applied).await?;
    create_missing_table(conn, "snapshots", CREATE_SNAPSHOTS, &mut applied).await?;

    create_indexes(conn).await?;

    if applied.is_empty() {
        info!("Answer store schema is current");
    } else {
        info!(steps = ?applied, "Migrated answer store schema");
    }
    Ok(applied)
}
