use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::SqliteConnection;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::schema;
use super::{
    Answer, AnswerStore, Cycle, CyclePick, NewAnswer, SnapshotSummary,
    TransitionCounter,
};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::situations::{self, DEFINING_INTENT, INTENT_MARKER, PROBLEM_MARKER, SELECTING_PROBLEM};
use crate::transport::{ByteStore, MemoryByteStore};

const ANSWER_COLUMNS: &str =
    "id, question_id, situation, value, answered_at, intent_id, problem_id, parent_id, cycle_id";

const CYCLE_COLUMNS: &str = "id, cycle_number, started_at, completed_at, status, \
     unconscious_entered_at, unconscious_exited_at";

const PICK_COLUMNS: &str = "id, target_cycle_id, source_cycle_id, source_answer_id, \
     question_id, answer_text, situation, created_at";

const SNAPSHOT_COLUMNS: &str = "id, situation, description, created_at, answer_count";

/// Format a timestamp the way it is stored. Fixed width keeps text ordering chronological.
pub(crate) fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization {
            message: format!("Invalid stored timestamp '{}': {}", s, e),
        })
}

fn parse_optional_timestamp(s: Option<String>) -> StorageResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_timestamp).transpose()
}

struct StoreInner {
    pool: SqlitePool,
    scratch_dir: PathBuf,
    transport: Arc<dyn ByteStore>,
    cache: Arc<dyn ByteStore>,
    /// Held from the start of a mutation until its export has been written.
    /// Guards the last image that reached a byte store.
    write_lock: Mutex<Option<Vec<u8>>>,
    ready: AtomicBool,
    /// Working directory of an ephemeral store, removed on drop.
    _ephemeral: Option<TempDir>,
}

/// SQLite-backed answer store persisted through a byte-store transport
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<StoreInner>,
}

impl SqliteStore {
    /// Open the store: pull the blob from the transport (or the local cache
    /// when the transport is unreachable), then initialize the schema.
    pub async fn open(
        config: &DatabaseConfig,
        transport: Arc<dyn ByteStore>,
        cache: Arc<dyn ByteStore>,
    ) -> StorageResult<Self> {
        let blob = load_blob(transport.as_ref(), cache.as_ref()).await?;

        // Ensure parent directory exists
        let scratch_dir = match config.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                    message: format!("Failed to create database directory: {}", e),
                })?;
                parent.to_path_buf()
            }
            _ => PathBuf::from("."),
        };

        write_working_copy(&config.path, blob.as_deref()).await?;
        let pool = connect_file(&config.path, config.max_connections).await?;

        let store = Self::from_parts(pool, scratch_dir, transport, cache, None);
        store.initialize().await?;

        info!(path = %config.path.display(), "Answer store opened");
        Ok(store)
    }

    /// Fresh ephemeral store persisting to in-memory transports.
    pub async fn new_in_memory() -> StorageResult<Self> {
        Self::new_in_memory_with(
            Arc::new(MemoryByteStore::new()),
            Arc::new(MemoryByteStore::new()),
        )
        .await
    }

    /// Fresh ephemeral store persisting to the given transports.
    ///
    /// The working database lives in a private temporary directory that is
    /// removed when the last handle drops. `sqlite::memory:` cannot be used:
    /// `VACUUM INTO` from a memory database never reaches the disk.
    /// Existing blobs are not loaded; use [`SqliteStore::open`] for that.
    pub async fn new_in_memory_with(
        transport: Arc<dyn ByteStore>,
        cache: Arc<dyn ByteStore>,
    ) -> StorageResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("devflow-")
            .tempdir()
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to create scratch directory: {}", e),
            })?;
        let pool = connect_file(&dir.path().join("devflow.db"), 1).await?;

        let scratch_dir = dir.path().to_path_buf();
        let store = Self::from_parts(pool, scratch_dir, transport, cache, Some(dir));
        store.initialize().await?;
        Ok(store)
    }

    fn from_parts(
        pool: SqlitePool,
        scratch_dir: PathBuf,
        transport: Arc<dyn ByteStore>,
        cache: Arc<dyn ByteStore>,
        ephemeral: Option<TempDir>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                pool,
                scratch_dir,
                transport,
                cache,
                write_lock: Mutex::new(None),
                ready: AtomicBool::new(false),
                _ephemeral: ephemeral,
            }),
        }
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    /// The primary byte-store transport.
    pub fn transport(&self) -> &Arc<dyn ByteStore> {
        &self.inner.transport
    }

    /// Whether the schema is initialized and writes are accepted.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Export the whole store as one SQLite database image.
    pub async fn export(&self) -> StorageResult<Vec<u8>> {
        let path = self
            .inner
            .scratch_dir
            .join(format!(".devflow-export-{}.db", Uuid::new_v4()));

        let target = path.display().to_string().replace('\'', "''");
        sqlx::query(&format!("VACUUM INTO '{}'", target))
            .execute(&self.inner.pool)
            .await?;

        let bytes = tokio::fs::read(&path).await.map_err(|e| StorageError::Query {
            message: format!("Failed to read export: {}", e),
        });
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!(error = %e, path = %path.display(), "Failed to remove export scratch file");
        }
        bytes
    }

    /// Write the current export through the transport.
    ///
    /// Callers hold the write lock.
    async fn persist_locked(&self) -> StorageResult<Vec<u8>> {
        let bytes = self.export().await?;
        let inner = &self.inner;

        if inner.transport.probe().await {
            inner.transport.write(&bytes).await?;
            if let Err(e) = inner.cache.write(&bytes).await {
                warn!(error = %e, "Failed to mirror store to local cache");
            }
            debug!(bytes = bytes.len(), "Store persisted");
            return Ok(bytes);
        }

        if let Some(location) = inner.transport.configured_location().await? {
            return Err(StorageError::Unavailable {
                message: format!(
                    "transport unreachable and location '{}' is authoritative",
                    location
                ),
            });
        }

        warn!(
            bytes = bytes.len(),
            "Transport unreachable; persisting to local cache only"
        );
        inner.cache.write(&bytes).await?;
        Ok(bytes)
    }

    /// Put every table back to the contents of `image`.
    ///
    /// Callers hold the write lock.
    async fn roll_back_locked(&self, image: &[u8]) -> StorageResult<()> {
        let path = self
            .inner
            .scratch_dir
            .join(format!(".devflow-rollback-{}.db", Uuid::new_v4()));
        tokio::fs::write(&path, image)
            .await
            .map_err(|e| StorageError::Query {
                message: format!("Failed to stage rollback image: {}", e),
            })?;

        let result = self.copy_tables_from(&path).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!(error = %e, path = %path.display(), "Failed to remove rollback scratch file");
        }
        result
    }

    async fn copy_tables_from(&self, path: &Path) -> StorageResult<()> {
        let mut conn = self.inner.pool.acquire().await?;
        let source = path.display().to_string().replace('\'', "''");
        sqlx::query(&format!("ATTACH DATABASE '{}' AS image", source))
            .execute(&mut *conn)
            .await?;

        let copied = schema::copy_tables(&mut conn, "image").await;

        sqlx::query("DETACH DATABASE image")
            .execute(&mut *conn)
            .await?;
        copied
    }

    fn ensure_ready(&self) -> StorageResult<()> {
        if !self.is_ready() {
            return Err(StorageError::NotInitialized);
        }
        Ok(())
    }

    /// Run a mutation and persist it as one critical section. A change that
    /// cannot be persisted is rolled back to the last persisted image.
    ///
    /// The work runs on its own task so it completes even if the caller
    /// stops awaiting.
    async fn mutate<T, F, Fut>(&self, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(SqliteStore) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<T>> + Send + 'static,
    {
        let store = self.clone();
        tokio::spawn(async move {
            let mut persisted = store.inner.write_lock.lock().await;
            store.ensure_ready()?;
            let value = op(store.clone()).await?;

            match store.persist_locked().await {
                Ok(image) => {
                    *persisted = Some(image);
                    Ok(value)
                }
                Err(e) => {
                    // Nobody saw this change durably; take it back.
                    match persisted.as_deref() {
                        Some(image) => {
                            if let Err(rollback) = store.roll_back_locked(image).await {
                                error!(error = %rollback, "Failed to roll back unpersisted change");
                            } else {
                                warn!(error = %e, "Change rolled back after persist failure");
                            }
                        }
                        None => error!(error = %e, "No persisted image to roll back to"),
                    }
                    Err(e)
                }
            }
        })
        .await
        .map_err(|e| StorageError::Query {
            message: format!("Write task failed: {}", e),
        })?
    }

    async fn fetch_answers(&self, sql: &str, bind: Option<i64>) -> StorageResult<Vec<Answer>> {
        let mut query = sqlx::query_as::<_, AnswerRow>(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.inner.pool).await?;
        rows.into_iter().map(Answer::try_from).collect()
    }

    async fn save_answer_locked(&self, answer: NewAnswer) -> StorageResult<i64> {
        let current_intent = self
            .latest_marked_answer(DEFINING_INTENT, INTENT_MARKER)
            .await?
            .map(|a| a.id);
        let current_problem = self
            .latest_marked_answer(SELECTING_PROBLEM, PROBLEM_MARKER)
            .await?
            .map(|a| a.id);

        let (intent_id, problem_id) =
            if situations::is_intent_answer(&answer.situation, &answer.question_id) {
                (None, None)
            } else if situations::is_problem_answer(&answer.situation, &answer.question_id) {
                (answer.intent_id.unwrap_or(current_intent), None)
            } else {
                (
                    answer.intent_id.unwrap_or(current_intent),
                    answer.problem_id.unwrap_or(current_problem),
                )
            };

        let cycle_id = match answer.cycle_id {
            Some(explicit) => explicit,
            None => self.active_cycle().await?.map(|c| c.id),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO answers (question_id, situation, value, answered_at, intent_id, problem_id, parent_id, cycle_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&answer.question_id)
        .bind(&answer.situation)
        .bind(&answer.value)
        .bind(format_timestamp(&answer.answered_at))
        .bind(intent_id)
        .bind(problem_id)
        .bind(answer.parent_id)
        .bind(cycle_id)
        .execute(&self.inner.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(
            answer_id = id,
            question_id = %answer.question_id,
            situation = %answer.situation,
            intent_id = ?intent_id,
            problem_id = ?problem_id,
            cycle_id = ?cycle_id,
            "Answer saved"
        );
        Ok(id)
    }

    async fn create_cycle_locked(&self) -> StorageResult<Cycle> {
        let now = format_timestamp(&Utc::now());
        let mut tx = self.inner.pool.begin().await?;

        let next_number: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(cycle_number), 0) + 1 FROM cycles")
                .fetch_one(&mut *tx)
                .await?;

        complete_active_cycles(&mut tx, None, &now).await?;

        let result = sqlx::query(
            "INSERT INTO cycles (cycle_number, started_at, status) VALUES (?, ?, 'active')",
        )
        .bind(next_number)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        let id = result.last_insert_rowid();

        let row: CycleRow = sqlx::query_as(&format!(
            "SELECT {} FROM cycles WHERE id = ?",
            CYCLE_COLUMNS
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(cycle_id = id, cycle_number = next_number, "Cycle started");
        row.try_into()
    }

    async fn activate_cycle_locked(&self, id: i64) -> StorageResult<()> {
        let now = format_timestamp(&Utc::now());
        let mut tx = self.inner.pool.begin().await?;

        let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cycles WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        if exists == 0 {
            return Err(StorageError::CycleNotFound { cycle_id: id });
        }

        complete_active_cycles(&mut tx, Some(id), &now).await?;

        sqlx::query("UPDATE cycles SET status = 'active', completed_at = NULL WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(cycle_id = id, "Cycle activated");
        Ok(())
    }

    async fn update_cycle(&self, sql: &str, id: i64) -> StorageResult<()> {
        let result = sqlx::query(sql)
            .bind(format_timestamp(&Utc::now()))
            .bind(id)
            .execute(&self.inner.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::CycleNotFound { cycle_id: id });
        }
        Ok(())
    }

    async fn add_cycle_pick_locked(
        &self,
        target_cycle_id: i64,
        source_answer_id: i64,
    ) -> StorageResult<Option<CyclePick>> {
        if self.get_cycle(target_cycle_id).await?.is_none() {
            return Err(StorageError::CycleNotFound {
                cycle_id: target_cycle_id,
            });
        }
        let source = self
            .get_answer(source_answer_id)
            .await?
            .ok_or(StorageError::AnswerNotFound {
                answer_id: source_answer_id,
            })?;

        let result = sqlx::query(
            r#"
            INSERT INTO cycle_picks (target_cycle_id, source_cycle_id, source_answer_id, question_id, answer_text, situation, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (target_cycle_id, source_answer_id) DO NOTHING
            "#,
        )
        .bind(target_cycle_id)
        .bind(source.cycle_id)
        .bind(source.id)
        .bind(&source.question_id)
        .bind(&source.value)
        .bind(&source.situation)
        .bind(format_timestamp(&Utc::now()))
        .execute(&self.inner.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(
                target_cycle_id,
                source_answer_id, "Answer already picked for this cycle"
            );
            return Ok(None);
        }

        let row: PickRow = sqlx::query_as(&format!(
            "SELECT {} FROM cycle_picks WHERE id = ?",
            PICK_COLUMNS
        ))
        .bind(result.last_insert_rowid())
        .fetch_one(&self.inner.pool)
        .await?;

        Ok(Some(row.try_into()?))
    }

    async fn save_snapshot_locked(
        &self,
        situation: String,
        description: Option<String>,
    ) -> StorageResult<i64> {
        let answers = self.all_answers().await?;
        let payload = serde_json::to_string(&answers).map_err(|e| StorageError::Serialization {
            message: format!("Failed to serialize snapshot: {}", e),
        })?;

        let result = sqlx::query(
            r#"
            INSERT INTO snapshots (created_at, situation, description, answer_count, payload)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(format_timestamp(&Utc::now()))
        .bind(&situation)
        .bind(&description)
        .bind(answers.len() as i64)
        .bind(&payload)
        .execute(&self.inner.pool)
        .await?;

        let id = result.last_insert_rowid();
        info!(
            snapshot_id = id,
            answers = answers.len(),
            situation = %situation,
            "Snapshot saved"
        );
        Ok(id)
    }

    async fn restore_snapshot_locked(&self, id: i64) -> StorageResult<String> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT situation, payload FROM snapshots WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.inner.pool)
                .await?;
        let (situation, payload) = row.ok_or(StorageError::SnapshotNotFound { snapshot_id: id })?;

        let answers: Vec<Answer> =
            serde_json::from_str(&payload).map_err(|e| StorageError::Serialization {
                message: format!("Corrupt snapshot {}: {}", id, e),
            })?;

        let mut tx = self.inner.pool.begin().await?;
        sqlx::query("DELETE FROM answers").execute(&mut *tx).await?;
        for answer in &answers {
            sqlx::query(&format!(
                "INSERT INTO answers ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                ANSWER_COLUMNS
            ))
            .bind(answer.id)
            .bind(&answer.question_id)
            .bind(&answer.situation)
            .bind(&answer.value)
            .bind(format_timestamp(&answer.answered_at))
            .bind(answer.intent_id)
            .bind(answer.problem_id)
            .bind(answer.parent_id)
            .bind(answer.cycle_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        info!(
            snapshot_id = id,
            answers = answers.len(),
            situation = %situation,
            "Snapshot restored"
        );
        Ok(situation)
    }

    async fn clear_all_locked(&self) -> StorageResult<()> {
        let mut tx = self.inner.pool.begin().await?;
        for table in ["answers", "cycle_picks", "transition_counters", "cycles"] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        warn!("Cleared all answers, cycles, counters and picks");
        Ok(())
    }
}

/// Pull the persisted blob: transport first, local cache only when the
/// transport is unreachable and no location makes it authoritative.
async fn connect_file(path: &Path, max_connections: u32) -> StorageResult<SqlitePool> {
    let database_url = format!("sqlite://{}?mode=rwc", path.display());
    let options = SqliteConnectOptions::from_str(&database_url)
        .map_err(|e| StorageError::Connection {
            message: format!("Invalid database URL: {}", e),
        })?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete);

    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await
        .map_err(|e| StorageError::Connection {
            message: format!("Failed to connect to database: {}", e),
        })
}

async fn load_blob(
    transport: &dyn ByteStore,
    cache: &dyn ByteStore,
) -> StorageResult<Option<Vec<u8>>> {
    if transport.probe().await {
        let blob = transport.read().await?;
        debug!(bytes = blob.as_ref().map(|b| b.len()), "Loaded store from transport");
        return Ok(blob);
    }

    if let Some(location) = transport.configured_location().await? {
        return Err(StorageError::Unavailable {
            message: format!(
                "transport unreachable and location '{}' is configured",
                location
            ),
        });
    }

    match cache.read().await {
        Ok(Some(bytes)) => {
            warn!(bytes = bytes.len(), "Transport unreachable; loading local cache");
            Ok(Some(bytes))
        }
        Ok(None) => Err(StorageError::Unavailable {
            message: "transport unreachable and no local cache".to_string(),
        }),
        Err(e) => Err(StorageError::Unavailable {
            message: format!("transport unreachable and local cache unreadable: {}", e),
        }),
    }
}

async fn write_working_copy(path: &Path, blob: Option<&[u8]>) -> StorageResult<()> {
    let result = match blob {
        Some(bytes) => tokio::fs::write(path, bytes).await,
        None => match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        },
    };
    result.map_err(|e| StorageError::Connection {
        message: format!("Failed to prepare working copy: {}", e),
    })
}

async fn complete_active_cycles(
    conn: &mut SqliteConnection,
    except: Option<i64>,
    now: &str,
) -> StorageResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE cycles
        SET status = 'completed', completed_at = ?
        WHERE status = 'active' AND (? IS NULL OR id != ?)
        "#,
    )
    .bind(now)
    .bind(except)
    .bind(except)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() > 0 {
        debug!(
            completed = result.rows_affected(),
            "Completed previously active cycles"
        );
    }
    Ok(())
}

#[async_trait]
impl AnswerStore for SqliteStore {
    async fn initialize(&self) -> StorageResult<()> {
        let mut persisted = self.inner.write_lock.lock().await;
        self.inner.ready.store(false, Ordering::SeqCst);

        let mut tx = self.inner.pool.begin().await.map_err(|e| StorageError::Migration {
            message: format!("Failed to begin schema transaction: {}", e),
        })?;

        let changed = if schema::table_exists(&mut tx, "answers").await? {
            !schema::migrate(&mut tx).await?.is_empty()
        } else {
            schema::create_schema(&mut tx).await?;
            true
        };

        tx.commit().await.map_err(|e| StorageError::Migration {
            message: format!("Failed to commit schema: {}", e),
        })?;
        self.inner.ready.store(true, Ordering::SeqCst);

        *persisted = Some(if changed {
            self.persist_locked().await?
        } else {
            self.export().await?
        });
        Ok(())
    }

    async fn migrate(&self) -> StorageResult<Vec<String>> {
        let mut persisted = self.inner.write_lock.lock().await;

        let mut tx = self.inner.pool.begin().await.map_err(|e| StorageError::Migration {
            message: format!("Failed to begin migration: {}", e),
        })?;
        let applied = match schema::migrate(&mut tx).await {
            Ok(applied) => applied,
            Err(e) => {
                self.inner.ready.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        tx.commit().await.map_err(|e| {
            self.inner.ready.store(false, Ordering::SeqCst);
            StorageError::Migration {
                message: format!("Failed to commit migration: {}", e),
            }
        })?;
        self.inner.ready.store(true, Ordering::SeqCst);

        if !applied.is_empty() {
            *persisted = Some(self.persist_locked().await?);
        }
        Ok(applied)
    }

    async fn save_answer(&self, answer: &NewAnswer) -> StorageResult<i64> {
        let answer = answer.clone();
        self.mutate(move |store| async move { store.save_answer_locked(answer).await })
            .await
    }

    async fn get_answer(&self, id: i64) -> StorageResult<Option<Answer>> {
        let row: Option<AnswerRow> = sqlx::query_as(&format!(
            "SELECT {} FROM answers WHERE id = ?",
            ANSWER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.inner.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn latest_answer_by_question(
        &self,
        question_id: &str,
    ) -> StorageResult<Option<Answer>> {
        let row: Option<AnswerRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM answers
            WHERE question_id = ?
            ORDER BY answered_at DESC, id DESC
            LIMIT 1
            "#,
            ANSWER_COLUMNS
        ))
        .bind(question_id)
        .fetch_optional(&self.inner.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn answers_by_question(&self, question_id: &str) -> StorageResult<Vec<Answer>> {
        let rows: Vec<AnswerRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM answers
            WHERE question_id = ?
            ORDER BY answered_at DESC, id DESC
            "#,
            ANSWER_COLUMNS
        ))
        .bind(question_id)
        .fetch_all(&self.inner.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn answers_by_situation(
        &self,
        situation: &str,
        cycle_id: Option<i64>,
    ) -> StorageResult<Vec<Answer>> {
        let rows: Vec<AnswerRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM answers
            WHERE situation = ? AND (? IS NULL OR cycle_id = ?)
            ORDER BY answered_at DESC, id DESC
            "#,
            ANSWER_COLUMNS
        ))
        .bind(situation)
        .bind(cycle_id)
        .bind(cycle_id)
        .fetch_all(&self.inner.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn latest_marked_answer(
        &self,
        situation: &str,
        marker: &str,
    ) -> StorageResult<Option<Answer>> {
        let row: Option<AnswerRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM answers
            WHERE situation = ? AND instr(question_id, ?) > 0
            ORDER BY answered_at DESC, id DESC
            LIMIT 1
            "#,
            ANSWER_COLUMNS
        ))
        .bind(situation)
        .bind(marker)
        .fetch_optional(&self.inner.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn answers_by_intent(&self, intent_id: i64) -> StorageResult<Vec<Answer>> {
        self.fetch_answers(
            &format!(
                "SELECT {} FROM answers WHERE intent_id = ? ORDER BY answered_at ASC, id ASC",
                ANSWER_COLUMNS
            ),
            Some(intent_id),
        )
        .await
    }

    async fn answers_by_problem(&self, problem_id: i64) -> StorageResult<Vec<Answer>> {
        self.fetch_answers(
            &format!(
                "SELECT {} FROM answers WHERE problem_id = ? ORDER BY answered_at ASC, id ASC",
                ANSWER_COLUMNS
            ),
            Some(problem_id),
        )
        .await
    }

    async fn answers_by_cycle(&self, cycle_id: i64) -> StorageResult<Vec<Answer>> {
        self.fetch_answers(
            &format!(
                "SELECT {} FROM answers WHERE cycle_id = ? ORDER BY answered_at ASC, id ASC",
                ANSWER_COLUMNS
            ),
            Some(cycle_id),
        )
        .await
    }

    async fn all_answers(&self) -> StorageResult<Vec<Answer>> {
        self.fetch_answers(
            &format!("SELECT {} FROM answers ORDER BY id ASC", ANSWER_COLUMNS),
            None,
        )
        .await
    }

    async fn clear_all(&self) -> StorageResult<()> {
        self.mutate(|store| async move { store.clear_all_locked().await })
            .await
    }

    async fn create_cycle(&self) -> StorageResult<Cycle> {
        self.mutate(|store| async move { store.create_cycle_locked().await })
            .await
    }

    async fn get_cycle(&self, id: i64) -> StorageResult<Option<Cycle>> {
        let row: Option<CycleRow> = sqlx::query_as(&format!(
            "SELECT {} FROM cycles WHERE id = ?",
            CYCLE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.inner.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn active_cycle(&self) -> StorageResult<Option<Cycle>> {
        let row: Option<CycleRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM cycles
            WHERE status = 'active'
            ORDER BY cycle_number DESC
            LIMIT 1
            "#,
            CYCLE_COLUMNS
        ))
        .fetch_optional(&self.inner.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list_cycles(&self) -> StorageResult<Vec<Cycle>> {
        let rows: Vec<CycleRow> = sqlx::query_as(&format!(
            "SELECT {} FROM cycles ORDER BY cycle_number ASC",
            CYCLE_COLUMNS
        ))
        .fetch_all(&self.inner.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn latest_completed_cycle(&self) -> StorageResult<Option<Cycle>> {
        let row: Option<CycleRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM cycles
            WHERE status = 'completed'
            ORDER BY cycle_number DESC
            LIMIT 1
            "#,
            CYCLE_COLUMNS
        ))
        .fetch_optional(&self.inner.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn complete_cycle(&self, id: i64) -> StorageResult<()> {
        self.mutate(move |store| async move {
            store
                .update_cycle(
                    "UPDATE cycles SET status = 'completed', completed_at = COALESCE(completed_at, ?) WHERE id = ?",
                    id,
                )
                .await?;
            info!(cycle_id = id, "Cycle completed");
            Ok(())
        })
        .await
    }

    async fn activate_cycle(&self, id: i64) -> StorageResult<()> {
        self.mutate(move |store| async move { store.activate_cycle_locked(id).await })
            .await
    }

    async fn record_unconscious_entry(&self, id: i64) -> StorageResult<()> {
        self.mutate(move |store| async move {
            store
                .update_cycle(
                    "UPDATE cycles SET unconscious_entered_at = ?, unconscious_exited_at = NULL WHERE id = ?",
                    id,
                )
                .await?;
            info!(cycle_id = id, "Cycle entered unconscious state");
            Ok(())
        })
        .await
    }

    async fn record_unconscious_exit(&self, id: i64) -> StorageResult<()> {
        self.mutate(move |store| async move {
            store
                .update_cycle(
                    "UPDATE cycles SET unconscious_exited_at = ? WHERE id = ?",
                    id,
                )
                .await?;
            info!(cycle_id = id, "Cycle left unconscious state");
            Ok(())
        })
        .await
    }

    async fn get_counter(&self, key: &str) -> StorageResult<Option<TransitionCounter>> {
        let row: Option<CounterRow> = sqlx::query_as(
            r#"
            SELECT transition_key, count, last_reset_at, updated_at
            FROM transition_counters
            WHERE transition_key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&self.inner.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn increment_counter(&self, key: &str) -> StorageResult<i64> {
        let key = key.to_string();
        self.mutate(move |store| async move {
            let count: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO transition_counters (transition_key, count, updated_at)
                VALUES (?, 1, ?)
                ON CONFLICT (transition_key) DO UPDATE
                SET count = count + 1, updated_at = excluded.updated_at
                RETURNING count
                "#,
            )
            .bind(&key)
            .bind(format_timestamp(&Utc::now()))
            .fetch_one(store.pool())
            .await?;

            debug!(key = %key, count, "Transition counter incremented");
            Ok(count)
        })
        .await
    }

    async fn reset_counter(&self, key: &str) -> StorageResult<()> {
        let key = key.to_string();
        self.mutate(move |store| async move {
            let now = format_timestamp(&Utc::now());
            sqlx::query(
                r#"
                INSERT INTO transition_counters (transition_key, count, last_reset_at, updated_at)
                VALUES (?, 0, ?, ?)
                ON CONFLICT (transition_key) DO UPDATE
                SET count = 0, last_reset_at = excluded.last_reset_at, updated_at = excluded.updated_at
                "#,
            )
            .bind(&key)
            .bind(&now)
            .bind(&now)
            .execute(store.pool())
            .await?;

            debug!(key = %key, "Transition counter reset");
            Ok(())
        })
        .await
    }

    async fn add_cycle_pick(
        &self,
        target_cycle_id: i64,
        source_answer_id: i64,
    ) -> StorageResult<Option<CyclePick>> {
        self.mutate(move |store| async move {
            store
                .add_cycle_pick_locked(target_cycle_id, source_answer_id)
                .await
        })
        .await
    }

    async fn cycle_picks(&self, target_cycle_id: i64) -> StorageResult<Vec<CyclePick>> {
        let rows: Vec<PickRow> = sqlx::query_as(&format!(
            "SELECT {} FROM cycle_picks WHERE target_cycle_id = ? ORDER BY id ASC",
            PICK_COLUMNS
        ))
        .bind(target_cycle_id)
        .fetch_all(&self.inner.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn remove_cycle_pick(&self, id: i64) -> StorageResult<bool> {
        self.mutate(move |store| async move {
            let result = sqlx::query("DELETE FROM cycle_picks WHERE id = ?")
                .bind(id)
                .execute(store.pool())
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn clear_cycle_picks(&self, target_cycle_id: i64) -> StorageResult<u64> {
        self.mutate(move |store| async move {
            let result = sqlx::query("DELETE FROM cycle_picks WHERE target_cycle_id = ?")
                .bind(target_cycle_id)
                .execute(store.pool())
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn save_snapshot(
        &self,
        situation: &str,
        description: Option<&str>,
    ) -> StorageResult<i64> {
        let situation = situation.to_string();
        let description = description.map(str::to_string);
        self.mutate(move |store| async move {
            store.save_snapshot_locked(situation, description).await
        })
        .await
    }

    async fn restore_snapshot(&self, id: i64) -> StorageResult<String> {
        self.mutate(move |store| async move { store.restore_snapshot_locked(id).await })
            .await
    }

    async fn list_snapshots(&self) -> StorageResult<Vec<SnapshotSummary>> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(&format!(
            "SELECT {} FROM snapshots ORDER BY created_at DESC, id DESC",
            SNAPSHOT_COLUMNS
        ))
        .fetch_all(&self.inner.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn delete_snapshot(&self, id: i64) -> StorageResult<bool> {
        self.mutate(move |store| async move {
            let result = sqlx::query("DELETE FROM snapshots WHERE id = ?")
                .bind(id)
                .execute(store.pool())
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn snapshot_details(&self, id: i64) -> StorageResult<Option<SnapshotSummary>> {
        let row: Option<SnapshotRow> = sqlx::query_as(&format!(
            "SELECT {} FROM snapshots WHERE id = ?",
            SNAPSHOT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.inner.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct AnswerRow {
    id: i64,
    question_id: String,
    situation: String,
    value: String,
    answered_at: String,
    intent_id: Option<i64>,
    problem_id: Option<i64>,
    parent_id: Option<i64>,
    cycle_id: Option<i64>,
}

impl TryFrom<AnswerRow> for Answer {
    type Error = StorageError;

    fn try_from(row: AnswerRow) -> StorageResult<Self> {
        Ok(Self {
            id: row.id,
            question_id: row.question_id,
            situation: row.situation,
            value: row.value,
            answered_at: parse_timestamp(&row.answered_at)?,
            intent_id: row.intent_id,
            problem_id: row.problem_id,
            parent_id: row.parent_id,
            cycle_id: row.cycle_id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CycleRow {
    id: i64,
    cycle_number: i64,
    started_at: String,
    completed_at: Option<String>,
    status: String,
    unconscious_entered_at: Option<String>,
    unconscious_exited_at: Option<String>,
}

impl TryFrom<CycleRow> for Cycle {
    type Error = StorageError;

    fn try_from(row: CycleRow) -> StorageResult<Self> {
        Ok(Self {
            id: row.id,
            cycle_number: row.cycle_number,
            started_at: parse_timestamp(&row.started_at)?,
            completed_at: parse_optional_timestamp(row.completed_at)?,
            status: row
                .status
                .parse()
                .map_err(|message| StorageError::Serialization { message })?,
            unconscious_entered_at: parse_optional_timestamp(row.unconscious_entered_at)?,
            unconscious_exited_at: parse_optional_timestamp(row.unconscious_exited_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CounterRow {
    transition_key: String,
    count: i64,
    last_reset_at: Option<String>,
    updated_at: String,
}

impl TryFrom<CounterRow> for TransitionCounter {
    type Error = StorageError;

    fn try_from(row: CounterRow) -> StorageResult<Self> {
        Ok(Self {
            key: row.transition_key,
            count: row.count,
            last_reset_at: parse_optional_timestamp(row.last_reset_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PickRow {
    id: i64,
    target_cycle_id: i64,
    source_cycle_id: Option<i64>,
    source_answer_id: i64,
    question_id: String,
    answer_text: String,
    situation: String,
    created_at: String,
}

impl TryFrom<PickRow> for CyclePick {
    type Error = StorageError;

    fn try_from(row: PickRow) -> StorageResult<Self> {
        Ok(Self {
            id: row.id,
            target_cycle_id: row.target_cycle_id,
            source_cycle_id: row.source_cycle_id,
            source_answer_id: row.source_answer_id,
            question_id: row.question_id,
            answer_text: row.answer_text,
            situation: row.situation,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    id: i64,
    situation: String,
    description: Option<String>,
    created_at: String,
    answer_count: i64,
}

impl TryFrom<SnapshotRow> for SnapshotSummary {
    type Error = StorageError;

    fn try_from(row: SnapshotRow) -> StorageResult<Self> {
        Ok(Self {
            id: row.id,
            situation: row.situation,
            description: row.description,
            created_at: parse_timestamp(&row.created_at)?,
            answer_count: row.answer_count,
        })
    }
}
