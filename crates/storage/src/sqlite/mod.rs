use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};

use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, StorageError,
    StorageResult,
};
use super::ids::{MessageId, SessionId};
use super::types::{MessageRecord, MessageRole, NewMessage, NewSession, SessionRecord};
use super::{BoxFuture, MessageStore, SessionStore};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // One connection serializes every write; it must also outlive idle
        // periods so in-memory databases keep their contents.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "sqlite conversation store ready");

        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    async fn begin(&self, stage: &'static str) -> StorageResult<Transaction<'static, Sqlite>> {
        self.pool.begin().await.context(SqliteQuerySnafu { stage })
    }
}

impl SessionStore for SqliteStorage {
    fn create_session(&self, input: NewSession) -> BoxFuture<'_, StorageResult<SessionRecord>> {
        Box::pin(async move {
            let mut tx = self.begin("session-create-begin").await?;
            let now = next_touch_millis(&mut tx, "session-create-touch").await?;
            let session_id = SessionId::new_v7();

            sqlx::query("INSERT INTO sessions (id, title, created_at, updated_at) VALUES (?, ?, ?, ?)")
                .bind(session_id.to_string())
                .bind(input.title.as_str())
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|source| {
                    insert_error(source, "session", session_id.to_string(), "session-create-insert")
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "session-create-commit",
            })?;

            let now = i64_to_u64(now, "session-create-timestamp")?;
            Ok(SessionRecord {
                id: session_id,
                title: input.title,
                created_at_unix_millis: now,
                updated_at_unix_millis: now,
            })
        })
    }

    fn save_session(&self, session: SessionRecord) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let created_at = u64_to_i64(session.created_at_unix_millis, "session-save-created-at")?;
            let updated_at = u64_to_i64(session.updated_at_unix_millis, "session-save-updated-at")?;

            sqlx::query(
                "INSERT INTO sessions (id, title, created_at, updated_at) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET title = excluded.title, \
                 updated_at = MAX(sessions.updated_at, excluded.updated_at)",
            )
            .bind(session.id.to_string())
            .bind(session.title)
            .bind(created_at)
            .bind(updated_at)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-save-upsert",
            })?;

            Ok(())
        })
    }

    fn get_session(
        &self,
        session_id: SessionId,
    ) -> BoxFuture<'_, StorageResult<Option<SessionRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, SessionRow>(
                "SELECT id, title, created_at, updated_at FROM sessions WHERE id = ?",
            )
            .bind(session_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-get-query",
            })?;

            row.map(session_row_to_record).transpose()
        })
    }

    fn list_sessions(&self) -> BoxFuture<'_, StorageResult<Vec<SessionRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, SessionRow>(
                "SELECT id, title, created_at, updated_at FROM sessions ORDER BY updated_at DESC, id DESC",
            )
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-list-query",
            })?;

            rows.into_iter().map(session_row_to_record).collect()
        })
    }

    fn delete_session(&self, session_id: SessionId) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
                .bind(session_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "session-delete-apply",
                })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "session-delete-missing",
                    entity: "session",
                    id: session_id.to_string(),
                }
                .fail();
            }

            Ok(())
        })
    }

    fn update_session_title(
        &self,
        session_id: SessionId,
        title: String,
    ) -> BoxFuture<'_, StorageResult<SessionRecord>> {
        Box::pin(async move {
            let mut tx = self.begin("session-title-begin").await?;
            let now = next_touch_millis(&mut tx, "session-title-touch").await?;

            let update_result =
                sqlx::query("UPDATE sessions SET title = ?, updated_at = ? WHERE id = ?")
                    .bind(title)
                    .bind(now)
                    .bind(session_id.to_string())
                    .execute(&mut *tx)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "session-title-apply",
                    })?;

            if update_result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "session-title-missing",
                    entity: "session",
                    id: session_id.to_string(),
                }
                .fail();
            }

            let row = sqlx::query_as::<_, SessionRow>(
                "SELECT id, title, created_at, updated_at FROM sessions WHERE id = ?",
            )
            .bind(session_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-title-load",
            })?
            .context(NotFoundSnafu {
                stage: "session-title-load-missing",
                entity: "session",
                id: session_id.to_string(),
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "session-title-commit",
            })?;

            session_row_to_record(row)
        })
    }
}

impl MessageStore for SqliteStorage {
    fn save_message(
        &self,
        session_id: SessionId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let timestamp = u64_to_i64(input.timestamp_unix_millis, "message-save-timestamp")?;
            let mut tx = self.begin("message-save-begin").await?;
            let now = next_touch_millis(&mut tx, "message-save-touch").await?;

            // Touch first: a missing session fails here instead of on the FK.
            let touched = sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(session_id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-save-touch-session",
                })?;

            if touched.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "message-save-session-missing",
                    entity: "session",
                    id: session_id.to_string(),
                }
                .fail();
            }

            sqlx::query(
                "INSERT INTO messages (id, session_id, role, content, timestamp) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(input.id.to_string())
            .bind(session_id.to_string())
            .bind(role_to_sql(input.role))
            .bind(input.content.as_str())
            .bind(timestamp)
            .execute(&mut *tx)
            .await
            .map_err(|source| {
                insert_error(source, "message", input.id.to_string(), "message-save-insert")
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-save-commit",
            })?;

            Ok(MessageRecord {
                id: input.id,
                session_id,
                role: input.role,
                content: input.content,
                timestamp_unix_millis: input.timestamp_unix_millis,
            })
        })
    }

    fn get_messages(
        &self,
        session_id: SessionId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            self.ensure_session_exists(session_id, "message-list-session-missing")
                .await?;

            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, session_id, role, content, timestamp FROM messages WHERE session_id = ? ORDER BY timestamp ASC, id ASC",
            )
            .bind(session_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }

    fn clear_messages(&self, session_id: SessionId) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            self.ensure_session_exists(session_id, "message-clear-session-missing")
                .await?;

            let result = sqlx::query("DELETE FROM messages WHERE session_id = ?")
                .bind(session_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-clear-apply",
                })?;

            Ok(result.rows_affected())
        })
    }
}

impl SqliteStorage {
    async fn ensure_session_exists(
        &self,
        session_id: SessionId,
        stage: &'static str,
    ) -> StorageResult<()> {
        let existing = sqlx::query_scalar::<_, i64>("SELECT 1 FROM sessions WHERE id = ? LIMIT 1")
            .bind(session_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "session-exists-query",
            })?;

        if existing.is_none() {
            return NotFoundSnafu {
                stage,
                entity: "session",
                id: session_id.to_string(),
            }
            .fail();
        }

        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    title: String,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    session_id: String,
    role: String,
    content: String,
    timestamp: i64,
}

fn session_row_to_record(row: SessionRow) -> StorageResult<SessionRecord> {
    Ok(SessionRecord {
        id: SessionId::parse(&row.id)?,
        title: row.title,
        created_at_unix_millis: i64_to_u64(row.created_at, "session-row-created-at")?,
        updated_at_unix_millis: i64_to_u64(row.updated_at, "session-row-updated-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        session_id: SessionId::parse(&row.session_id)?,
        role: role_from_sql(&row.role)?,
        content: row.content,
        timestamp_unix_millis: i64_to_u64(row.timestamp, "message-row-timestamp")?,
    })
}

/// Next `updated_at` value: wall-clock millis, pushed past every stored
/// value so the last touched session always sorts first.
async fn next_touch_millis(
    tx: &mut Transaction<'_, Sqlite>,
    stage: &'static str,
) -> StorageResult<i64> {
    let latest = sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(updated_at) FROM sessions")
        .fetch_one(&mut **tx)
        .await
        .context(SqliteQuerySnafu { stage })?;

    let now = unix_timestamp_millis();
    Ok(match latest {
        Some(latest) if latest >= now => latest + 1,
        _ => now,
    })
}

fn insert_error(
    source: sqlx::Error,
    entity: &'static str,
    id: String,
    stage: &'static str,
) -> StorageError {
    match &source {
        sqlx::Error::Database(database_error) if database_error.is_unique_violation() => {
            StorageError::Conflict {
                stage,
                entity,
                details: format!("id '{id}' already exists"),
            }
        }
        _ => StorageError::SqliteQuery { stage, source },
    }
}

fn role_to_sql(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "system" => Ok(MessageRole::System),
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| {
            i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
        })
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
