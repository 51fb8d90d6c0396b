//! Records the agent persists, and the store contracts it needs.
//!
//! The agent only ever appends messages and tool runs, and moves tasks
//! through their state machine with single store operations. Anything
//! that reads and then writes must go through a conditional update such
//! as [`TaskStore::claim_task`].

mod memory;

use std::fmt::{self, Display};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use memory::MemoryStore;

/// Errors raised by a store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The record doesn't exist, or isn't visible to the caller.
    #[error("record not found")]
    NotFound,
    /// The backend failed.
    #[error("store backend failed: {0}")]
    Backend(String),
}

/// One conversation thread.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Author of a transcript message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// A persisted transcript message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<Value>,
    pub tool_output: Option<Value>,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub latency_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// A message about to be appended.
#[derive(Clone, Debug, PartialEq)]
pub struct NewMessage {
    pub session_id: String,
    pub role: Role,
    pub content: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<Value>,
    pub tool_output: Option<Value>,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub latency_ms: Option<u64>,
}

impl NewMessage {
    fn new(session_id: &str, role: Role) -> Self {
        Self {
            session_id: session_id.to_owned(),
            role,
            content: None,
            tool_name: None,
            tool_input: None,
            tool_output: None,
            tokens_in: None,
            tokens_out: None,
            latency_ms: None,
        }
    }

    /// A user message.
    pub fn user(session_id: &str, content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::new(session_id, Role::User)
        }
    }

    /// A final assistant answer.
    pub fn assistant(session_id: &str, content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::new(session_id, Role::Assistant)
        }
    }

    /// The result of one tool call.
    pub fn tool(
        session_id: &str,
        tool_name: impl Into<String>,
        input: Value,
        output: Value,
    ) -> Self {
        Self {
            tool_name: Some(tool_name.into()),
            tool_input: Some(input),
            tool_output: Some(output),
            ..Self::new(session_id, Role::Tool)
        }
    }
}

/// Lifecycle of a tool run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolRunStatus {
    Running,
    Succeeded,
    Failed,
}

/// A tool run about to be logged, in the `running` state.
#[derive(Clone, Debug, PartialEq)]
pub struct NewToolRun {
    pub session_id: String,
    pub tool_name: String,
    pub input: Value,
}

/// The resolution of a tool run.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolRunUpdate {
    pub status: ToolRunStatus,
    pub output: Option<Value>,
    pub completed_at: DateTime<Utc>,
    pub latency_ms: u64,
}

/// A logged tool run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolRun {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub input: Value,
    pub status: ToolRunStatus,
    pub output: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
}

/// Lifecycle of a task.
///
/// `pending` moves to `canceled`, or to `in_progress` and then to
/// `completed` or `failed`. Nothing re-enters `pending`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// The stored representation.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    /// Parses the stored representation.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => TaskStatus::Pending,
            "in_progress" => TaskStatus::InProgress,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "canceled" => TaskStatus::Canceled,
            _ => return None,
        })
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a task step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStepStatus {
    /// The stored representation.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStepStatus::Pending => "pending",
            TaskStepStatus::InProgress => "in_progress",
            TaskStepStatus::Completed => "completed",
            TaskStepStatus::Failed => "failed",
            TaskStepStatus::Skipped => "skipped",
        }
    }

    /// Parses the stored representation.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => TaskStepStatus::Pending,
            "in_progress" => TaskStepStatus::InProgress,
            "completed" => TaskStepStatus::Completed,
            "failed" => TaskStepStatus::Failed,
            "skipped" => TaskStepStatus::Skipped,
            _ => return None,
        })
    }
}

/// A task about to be created, together with its single step.
#[derive(Clone, Debug, PartialEq)]
pub struct NewTask {
    pub session_id: String,
    pub creator_id: String,
    pub title: String,
    pub tool_name: String,
    pub input: Value,
    pub metadata: Option<Value>,
}

/// A confirmable unit of work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub session_id: String,
    pub creator_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The replayable instruction behind a task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub id: String,
    pub task_id: String,
    pub position: u32,
    pub tool_name: String,
    pub input: Value,
    pub status: TaskStepStatus,
    pub error: Option<String>,
}

/// Sessions, transcripts and tool runs.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns the session `session_id` if it belongs to `user_id`, or
    /// creates a new one when no id is given.
    ///
    /// An id that doesn't exist or belongs to someone else is
    /// [`StoreError::NotFound`].
    async fn get_or_create_session(
        &self,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<Session, StoreError>;

    /// Returns the latest `limit` messages, oldest first.
    async fn session_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Returns the latest `limit` user and assistant messages, oldest
    /// first. Tool messages are skipped and don't count towards `limit`.
    async fn dialogue_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Appends a message and returns its id.
    async fn log_message(&self, message: NewMessage)
    -> Result<String, StoreError>;

    /// Logs a tool run in the `running` state and returns its id.
    async fn log_tool_run(&self, run: NewToolRun)
    -> Result<String, StoreError>;

    /// Resolves a running tool run.
    async fn update_tool_run(
        &self,
        id: &str,
        update: ToolRunUpdate,
    ) -> Result<(), StoreError>;

    /// Returns the tool runs of a session in the order they started.
    async fn tool_runs(&self, session_id: &str)
    -> Result<Vec<ToolRun>, StoreError>;

    /// Bumps the last activity timestamp.
    async fn update_session_activity(
        &self,
        session_id: &str,
    ) -> Result<(), StoreError>;
}

/// Confirmable tasks and their steps.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Creates a pending task and its pending step in one operation.
    async fn create_task(&self, task: NewTask) -> Result<Task, StoreError>;

    /// Looks up a task.
    async fn task(&self, id: &str) -> Result<Task, StoreError>;

    /// Returns the steps of a task ordered by position.
    async fn task_steps(
        &self,
        task_id: &str,
    ) -> Result<Vec<TaskStep>, StoreError>;

    /// Moves a task out of `pending` if, and only if, it is still pending.
    ///
    /// Returns `false` when the task was in any other state. Two concurrent
    /// claims on the same task never both succeed.
    async fn claim_task(
        &self,
        id: &str,
        next: TaskStatus,
    ) -> Result<bool, StoreError>;

    /// Sets the status of a task that was already claimed.
    async fn set_task_status(
        &self,
        id: &str,
        status: TaskStatus,
    ) -> Result<(), StoreError>;

    /// Sets the status of one step, and its error text.
    async fn set_step_status(
        &self,
        step_id: &str,
        status: TaskStepStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Marks every step of a task as skipped.
    async fn skip_steps(&self, task_id: &str) -> Result<(), StoreError>;

    /// Returns the tasks of a session, oldest first.
    async fn session_tasks(
        &self,
        session_id: &str,
    ) -> Result<Vec<Task>, StoreError>;
}
