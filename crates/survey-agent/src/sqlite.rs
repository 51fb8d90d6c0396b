//! SQLite-backed session, transcript and task storage.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;
use survey_agent_core::store::{
    Message, NewMessage, NewTask, NewToolRun, Role, Session, SessionStore,
    StoreError, Task, TaskStatus, TaskStep, TaskStepStatus, TaskStore,
    ToolRun, ToolRunStatus, ToolRunUpdate,
};
use uuid::Uuid;

/// A store over one SQLite connection.
///
/// Every operation runs under the connection lock, and task claims are
/// conditional updates, so concurrent confirmations can't both win.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens, and if needed initializes, the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend)?;
        Self::init(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(include_str!("sqlite/schema.sql"))
            .map_err(backend)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// The latest `limit` messages matching `filter`, oldest first.
    fn latest_messages(
        &self,
        session_id: &str,
        limit: usize,
        filter: &str,
    ) -> Result<Vec<Message>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT * FROM (SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE session_id = ?1 {filter} \
                     ORDER BY seq DESC LIMIT ?2) \
                     ORDER BY seq ASC"
                ))
                .map_err(backend)?;
            let messages = stmt
                .query_map(params![session_id, limit], message_from_row)
                .map_err(backend)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(backend)?;
            Ok(messages)
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| {
            StoreError::Backend("connection lock poisoned".to_owned())
        })?;
        f(&mut conn)
    }
}

fn backend(err: rusqlite::Error) -> StoreError {
    match err {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        err => StoreError::Backend(err.to_string()),
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

#[derive(Debug, thiserror::Error)]
#[error("unknown value `{0}`")]
struct UnknownValue(String);

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| conversion_error(idx, err))
}

fn opt_time_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|text| {
        DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|err| conversion_error(idx, err))
    })
    .transpose()
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|text| {
        serde_json::from_str(&text).map_err(|err| conversion_error(idx, err))
    })
    .transpose()
}

fn enum_column<T>(
    row: &Row<'_>,
    idx: usize,
    parse: impl FnOnce(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    parse(&text).ok_or_else(|| conversion_error(idx, UnknownValue(text)))
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn parse_role(s: &str) -> Option<Role> {
    Some(match s {
        "user" => Role::User,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        _ => return None,
    })
}

fn tool_run_status_str(status: ToolRunStatus) -> &'static str {
    match status {
        ToolRunStatus::Running => "running",
        ToolRunStatus::Succeeded => "succeeded",
        ToolRunStatus::Failed => "failed",
    }
}

fn parse_tool_run_status(s: &str) -> Option<ToolRunStatus> {
    Some(match s {
        "running" => ToolRunStatus::Running,
        "succeeded" => ToolRunStatus::Succeeded,
        "failed" => ToolRunStatus::Failed,
        _ => return None,
    })
}

const SESSION_COLUMNS: &str = "id, user_id, created_at, last_activity_at";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        user_id: row.get(1)?,
        created_at: time_column(row, 2)?,
        last_activity_at: time_column(row, 3)?,
    })
}

const MESSAGE_COLUMNS: &str = "seq, id, session_id, role, content, tool_name, \
     tool_input, tool_output, tokens_in, tokens_out, latency_ms, created_at";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(1)?,
        session_id: row.get(2)?,
        role: enum_column(row, 3, parse_role)?,
        content: row.get(4)?,
        tool_name: row.get(5)?,
        tool_input: json_column(row, 6)?,
        tool_output: json_column(row, 7)?,
        tokens_in: row.get(8)?,
        tokens_out: row.get(9)?,
        latency_ms: row.get(10)?,
        created_at: time_column(row, 11)?,
    })
}

const TOOL_RUN_COLUMNS: &str = "id, session_id, tool_name, input, status, \
     output, started_at, completed_at, latency_ms";

fn tool_run_from_row(row: &Row<'_>) -> rusqlite::Result<ToolRun> {
    Ok(ToolRun {
        id: row.get(0)?,
        session_id: row.get(1)?,
        tool_name: row.get(2)?,
        input: json_column(row, 3)?.unwrap_or(Value::Null),
        status: enum_column(row, 4, parse_tool_run_status)?,
        output: json_column(row, 5)?,
        started_at: time_column(row, 6)?,
        completed_at: opt_time_column(row, 7)?,
        latency_ms: row.get(8)?,
    })
}

const TASK_COLUMNS: &str = "id, session_id, creator_id, title, status, \
     metadata, created_at, updated_at";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        session_id: row.get(1)?,
        creator_id: row.get(2)?,
        title: row.get(3)?,
        status: enum_column(row, 4, TaskStatus::parse)?,
        metadata: json_column(row, 5)?,
        created_at: time_column(row, 6)?,
        updated_at: time_column(row, 7)?,
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<TaskStep> {
    Ok(TaskStep {
        id: row.get(0)?,
        task_id: row.get(1)?,
        position: row.get(2)?,
        tool_name: row.get(3)?,
        input: json_column(row, 4)?.unwrap_or(Value::Null),
        status: enum_column(row, 5, TaskStepStatus::parse)?,
        error: row.get(6)?,
    })
}

/// Fails with `NotFound` when an update touched nothing.
fn expect_changed(changed: usize) -> Result<(), StoreError> {
    if changed == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn get_or_create_session(
        &self,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<Session, StoreError> {
        self.with_conn(|conn| {
            if let Some(session_id) = session_id {
                return conn
                    .query_row(
                        &format!(
                            "SELECT {SESSION_COLUMNS} FROM sessions \
                             WHERE id = ?1 AND user_id = ?2"
                        ),
                        params![session_id, user_id],
                        session_from_row,
                    )
                    .map_err(backend);
            }

            let now = Utc::now();
            let session = Session {
                id: new_id(),
                user_id: user_id.to_owned(),
                created_at: now,
                last_activity_at: now,
            };
            conn.execute(
                "INSERT INTO sessions (id, user_id, created_at, last_activity_at) \
                 VALUES (?1, ?2, ?3, ?3)",
                params![session.id, session.user_id, now.to_rfc3339()],
            )
            .map_err(backend)?;
            Ok(session)
        })
    }

    async fn session_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        self.latest_messages(session_id, limit, "")
    }

    async fn dialogue_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        self.latest_messages(session_id, limit, "AND role != 'tool'")
    }

    async fn log_message(
        &self,
        message: NewMessage,
    ) -> Result<String, StoreError> {
        self.with_conn(|conn| {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM sessions WHERE id = ?1",
                    params![message.session_id],
                    |_| Ok(()),
                )
                .optional()
                .map_err(backend)?;
            if exists.is_none() {
                return Err(StoreError::NotFound);
            }

            let id = new_id();
            conn.execute(
                "INSERT INTO messages (id, session_id, role, content, \
                 tool_name, tool_input, tool_output, tokens_in, tokens_out, \
                 latency_ms, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    id,
                    message.session_id,
                    role_str(message.role),
                    message.content,
                    message.tool_name,
                    message.tool_input.map(|v| v.to_string()),
                    message.tool_output.map(|v| v.to_string()),
                    message.tokens_in,
                    message.tokens_out,
                    message.latency_ms,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(backend)?;
            Ok(id)
        })
    }

    async fn log_tool_run(&self, run: NewToolRun) -> Result<String, StoreError> {
        self.with_conn(|conn| {
            let id = new_id();
            conn.execute(
                "INSERT INTO tool_runs (id, session_id, tool_name, input, \
                 status, started_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    run.session_id,
                    run.tool_name,
                    run.input.to_string(),
                    tool_run_status_str(ToolRunStatus::Running),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(backend)?;
            Ok(id)
        })
    }

    async fn update_tool_run(
        &self,
        id: &str,
        update: ToolRunUpdate,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE tool_runs SET status = ?2, output = ?3, \
                     completed_at = ?4, latency_ms = ?5 WHERE id = ?1",
                    params![
                        id,
                        tool_run_status_str(update.status),
                        update.output.map(|v| v.to_string()),
                        update.completed_at.to_rfc3339(),
                        update.latency_ms,
                    ],
                )
                .map_err(backend)?;
            expect_changed(changed)
        })
    }

    async fn tool_runs(
        &self,
        session_id: &str,
    ) -> Result<Vec<ToolRun>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TOOL_RUN_COLUMNS} FROM tool_runs \
                     WHERE session_id = ?1 ORDER BY seq"
                ))
                .map_err(backend)?;
            let runs = stmt
                .query_map(params![session_id], tool_run_from_row)
                .map_err(backend)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(backend)?;
            Ok(runs)
        })
    }

    async fn update_session_activity(
        &self,
        session_id: &str,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE sessions SET last_activity_at = ?2 WHERE id = ?1",
                    params![session_id, Utc::now().to_rfc3339()],
                )
                .map_err(backend)?;
            expect_changed(changed)
        })
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn create_task(&self, task: NewTask) -> Result<Task, StoreError> {
        self.with_conn(|conn| {
            let now = Utc::now();
            let created = Task {
                id: new_id(),
                session_id: task.session_id,
                creator_id: task.creator_id,
                title: task.title,
                status: TaskStatus::Pending,
                metadata: task.metadata,
                created_at: now,
                updated_at: now,
            };

            let tx = conn.transaction().map_err(backend)?;
            tx.execute(
                "INSERT INTO tasks (id, session_id, creator_id, title, status, \
                 metadata, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    created.id,
                    created.session_id,
                    created.creator_id,
                    created.title,
                    created.status.as_str(),
                    created.metadata.as_ref().map(|v| v.to_string()),
                    now.to_rfc3339(),
                ],
            )
            .map_err(backend)?;
            tx.execute(
                "INSERT INTO task_steps (id, task_id, position, tool_name, \
                 input, status) VALUES (?1, ?2, 0, ?3, ?4, ?5)",
                params![
                    new_id(),
                    created.id,
                    task.tool_name,
                    task.input.to_string(),
                    TaskStepStatus::Pending.as_str(),
                ],
            )
            .map_err(backend)?;
            tx.commit().map_err(backend)?;
            Ok(created)
        })
    }

    async fn task(&self, id: &str) -> Result<Task, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                task_from_row,
            )
            .map_err(backend)
        })
    }

    async fn task_steps(
        &self,
        task_id: &str,
    ) -> Result<Vec<TaskStep>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, task_id, position, tool_name, input, status, \
                     error FROM task_steps WHERE task_id = ?1 ORDER BY position",
                )
                .map_err(backend)?;
            let steps = stmt
                .query_map(params![task_id], step_from_row)
                .map_err(backend)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(backend)?;
            Ok(steps)
        })
    }

    async fn claim_task(
        &self,
        id: &str,
        next: TaskStatus,
    ) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE tasks SET status = ?2, updated_at = ?3 \
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, next.as_str(), Utc::now().to_rfc3339()],
                )
                .map_err(backend)?;
            if changed == 1 {
                return Ok(true);
            }
            conn.query_row(
                "SELECT 1 FROM tasks WHERE id = ?1",
                params![id],
                |_| Ok(false),
            )
            .map_err(backend)
        })
    }

    async fn set_task_status(
        &self,
        id: &str,
        status: TaskStatus,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE tasks SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, status.as_str(), Utc::now().to_rfc3339()],
                )
                .map_err(backend)?;
            expect_changed(changed)
        })
    }

    async fn set_step_status(
        &self,
        step_id: &str,
        status: TaskStepStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE task_steps SET status = ?2, error = ?3 WHERE id = ?1",
                    params![step_id, status.as_str(), error],
                )
                .map_err(backend)?;
            expect_changed(changed)
        })
    }

    async fn skip_steps(&self, task_id: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE task_steps SET status = ?2 WHERE task_id = ?1",
                params![task_id, TaskStepStatus::Skipped.as_str()],
            )
            .map_err(backend)?;
            Ok(())
        })
    }

    async fn session_tasks(
        &self,
        session_id: &str,
    ) -> Result<Vec<Task>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE session_id = ?1 ORDER BY seq"
                ))
                .map_err(backend)?;
            let tasks = stmt
                .query_map(params![session_id], task_from_row)
                .map_err(backend)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(backend)?;
            Ok(tasks)
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use survey_agent_core::gate::{ActionRegistry, ConfirmationGate, GateError};
    use survey_agent_core::Locale;
    use tempfile::TempDir;

    use super::*;

    fn new_task(session_id: &str) -> NewTask {
        NewTask {
            session_id: session_id.to_owned(),
            creator_id: "hr-1".to_owned(),
            title: "Close survey “Engagement 2024”".to_owned(),
            tool_name: "close_survey".to_owned(),
            input: json!({ "survey": "s-engagement" }),
            metadata: Some(json!({ "respondents": 3 })),
        }
    }

    #[tokio::test]
    async fn test_transcript_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.db");

        let session_id = {
            let store = SqliteStore::open(&path).unwrap();
            let session =
                store.get_or_create_session("hr-1", None).await.unwrap();
            for i in 0..4 {
                store
                    .log_message(NewMessage::user(&session.id, format!("m{i}")))
                    .await
                    .unwrap();
            }
            store
                .log_message(NewMessage {
                    tokens_in: Some(120),
                    tokens_out: Some(30),
                    latency_ms: Some(850),
                    ..NewMessage::assistant(&session.id, "done")
                })
                .await
                .unwrap();
            session.id
        };

        let store = SqliteStore::open(&path).unwrap();
        let session = store
            .get_or_create_session("hr-1", Some(&session_id))
            .await
            .unwrap();
        let window = store.session_messages(&session.id, 3).await.unwrap();
        let contents: Vec<_> = window
            .iter()
            .map(|msg| msg.content.as_deref().unwrap())
            .collect();
        assert_eq!(contents, ["m2", "m3", "done"]);
        assert_eq!(window[2].role, Role::Assistant);
        assert_eq!(window[2].tokens_in, Some(120));

        let err = store
            .get_or_create_session("hr-2", Some(&session_id))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_dialogue_skips_tool_messages() {
        let store = SqliteStore::open_in_memory().unwrap();
        let session = store.get_or_create_session("hr-1", None).await.unwrap();
        store
            .log_message(NewMessage::user(&session.id, "who answered?"))
            .await
            .unwrap();
        for _ in 0..3 {
            store
                .log_message(NewMessage::tool(
                    &session.id,
                    "get_survey_progress",
                    json!({ "survey": "s-engagement" }),
                    json!({ "responded": 3 }),
                ))
                .await
                .unwrap();
        }
        store
            .log_message(NewMessage::assistant(&session.id, "3 of 40"))
            .await
            .unwrap();

        let window = store.dialogue_messages(&session.id, 2).await.unwrap();
        let contents: Vec<_> = window
            .iter()
            .map(|msg| msg.content.as_deref().unwrap())
            .collect();
        assert_eq!(contents, ["who answered?", "3 of 40"]);

        let all = store.session_messages(&session.id, 2).await.unwrap();
        assert_eq!(all[0].role, Role::Tool);
    }

    #[tokio::test]
    async fn test_message_needs_session() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .log_message(NewMessage::user("missing", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_tool_runs() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store
            .log_tool_run(NewToolRun {
                session_id: "s".to_owned(),
                tool_name: "list_surveys".to_owned(),
                input: json!({}),
            })
            .await
            .unwrap();
        store
            .update_tool_run(&id, ToolRunUpdate {
                status: ToolRunStatus::Succeeded,
                output: Some(json!([])),
                completed_at: Utc::now(),
                latency_ms: 4,
            })
            .await
            .unwrap();

        let runs = store.tool_runs("s").await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, ToolRunStatus::Succeeded);
        assert_eq!(runs[0].output, Some(json!([])));
        assert_eq!(runs[0].latency_ms, Some(4));

        let err = store
            .update_tool_run("missing", ToolRunUpdate {
                status: ToolRunStatus::Failed,
                output: None,
                completed_at: Utc::now(),
                latency_ms: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_claim_is_conditional() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = store.create_task(new_task("s")).await.unwrap();

        let steps = store.task_steps(&task.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].position, 0);
        assert_eq!(steps[0].input, json!({ "survey": "s-engagement" }));

        assert!(store.claim_task(&task.id, TaskStatus::Canceled).await.unwrap());
        assert!(
            !store
                .claim_task(&task.id, TaskStatus::InProgress)
                .await
                .unwrap()
        );
        assert!(matches!(
            store.claim_task("missing", TaskStatus::Canceled).await,
            Err(StoreError::NotFound)
        ));

        store.skip_steps(&task.id).await.unwrap();
        let task = store.task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert_eq!(task.metadata, Some(json!({ "respondents": 3 })));
        let steps = store.task_steps(&task.id).await.unwrap();
        assert_eq!(steps[0].status, TaskStepStatus::Skipped);
        assert_eq!(store.session_tasks("s").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_gate_over_sqlite() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let gate = ConfirmationGate::new(store.clone(), ActionRegistry::new());
        let task = store.create_task(new_task("s")).await.unwrap();

        // Cancelling needs no action routine.
        let message = gate
            .resolve(&task.id, "hr-1", false, Locale::En)
            .await
            .unwrap();
        assert_eq!(message, Locale::En.cancellation_message());

        let err = gate
            .resolve(&task.id, "hr-1", true, Locale::En)
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::Conflict { .. }));
    }
}
