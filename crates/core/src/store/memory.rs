use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::*;

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    messages: Vec<Message>,
    tool_runs: Vec<ToolRun>,
    tasks: Vec<Task>,
    steps: Vec<TaskStep>,
}

/// A store that keeps everything in process memory.
///
/// Every operation holds one lock for its whole duration, which makes each
/// of them atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions held, over all users.
    pub fn session_count(&self) -> usize {
        self.inner.lock().map_or(0, |inner| inner.sessions.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_owned()))
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get_or_create_session(
        &self,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<Session, StoreError> {
        let mut inner = self.lock()?;
        if let Some(session_id) = session_id {
            return inner
                .sessions
                .get(session_id)
                .filter(|session| session.user_id == user_id)
                .cloned()
                .ok_or(StoreError::NotFound);
        }

        let now = Utc::now();
        let session = Session {
            id: new_id(),
            user_id: user_id.to_owned(),
            created_at: now,
            last_activity_at: now,
        };
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn session_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.lock()?;
        let mut messages: Vec<_> = inner
            .messages
            .iter()
            .rev()
            .filter(|msg| msg.session_id == session_id)
            .take(limit)
            .cloned()
            .collect();
        messages.reverse();
        Ok(messages)
    }

    async fn dialogue_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.lock()?;
        let mut messages: Vec<_> = inner
            .messages
            .iter()
            .rev()
            .filter(|msg| msg.session_id == session_id && msg.role != Role::Tool)
            .take(limit)
            .cloned()
            .collect();
        messages.reverse();
        Ok(messages)
    }

    async fn log_message(
        &self,
        message: NewMessage,
    ) -> Result<String, StoreError> {
        let mut inner = self.lock()?;
        if !inner.sessions.contains_key(&message.session_id) {
            return Err(StoreError::NotFound);
        }
        let id = new_id();
        inner.messages.push(Message {
            id: id.clone(),
            session_id: message.session_id,
            role: message.role,
            content: message.content,
            tool_name: message.tool_name,
            tool_input: message.tool_input,
            tool_output: message.tool_output,
            tokens_in: message.tokens_in,
            tokens_out: message.tokens_out,
            latency_ms: message.latency_ms,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn log_tool_run(&self, run: NewToolRun) -> Result<String, StoreError> {
        let mut inner = self.lock()?;
        let id = new_id();
        inner.tool_runs.push(ToolRun {
            id: id.clone(),
            session_id: run.session_id,
            tool_name: run.tool_name,
            input: run.input,
            status: ToolRunStatus::Running,
            output: None,
            started_at: Utc::now(),
            completed_at: None,
            latency_ms: None,
        });
        Ok(id)
    }

    async fn update_tool_run(
        &self,
        id: &str,
        update: ToolRunUpdate,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let run = inner
            .tool_runs
            .iter_mut()
            .find(|run| run.id == id)
            .ok_or(StoreError::NotFound)?;
        run.status = update.status;
        run.output = update.output;
        run.completed_at = Some(update.completed_at);
        run.latency_ms = Some(update.latency_ms);
        Ok(())
    }

    async fn tool_runs(
        &self,
        session_id: &str,
    ) -> Result<Vec<ToolRun>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .tool_runs
            .iter()
            .filter(|run| run.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn update_session_activity(
        &self,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or(StoreError::NotFound)?;
        session.last_activity_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_task(&self, task: NewTask) -> Result<Task, StoreError> {
        let mut inner = self.lock()?;
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
        inner.steps.push(TaskStep {
            id: new_id(),
            task_id: created.id.clone(),
            position: 0,
            tool_name: task.tool_name,
            input: task.input,
            status: TaskStepStatus::Pending,
            error: None,
        });
        inner.tasks.push(created.clone());
        Ok(created)
    }

    async fn task(&self, id: &str) -> Result<Task, StoreError> {
        let inner = self.lock()?;
        inner
            .tasks
            .iter()
            .find(|task| task.id == id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn task_steps(
        &self,
        task_id: &str,
    ) -> Result<Vec<TaskStep>, StoreError> {
        let inner = self.lock()?;
        let mut steps: Vec<_> = inner
            .steps
            .iter()
            .filter(|step| step.task_id == task_id)
            .cloned()
            .collect();
        steps.sort_by_key(|step| step.position);
        Ok(steps)
    }

    async fn claim_task(
        &self,
        id: &str,
        next: TaskStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let task = inner
            .tasks
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or(StoreError::NotFound)?;
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        task.status = next;
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_task_status(
        &self,
        id: &str,
        status: TaskStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let task = inner
            .tasks
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or(StoreError::NotFound)?;
        task.status = status;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn set_step_status(
        &self,
        step_id: &str,
        status: TaskStepStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let step = inner
            .steps
            .iter_mut()
            .find(|step| step.id == step_id)
            .ok_or(StoreError::NotFound)?;
        step.status = status;
        step.error = error.map(ToOwned::to_owned);
        Ok(())
    }

    async fn skip_steps(&self, task_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        for step in inner.steps.iter_mut().filter(|s| s.task_id == task_id) {
            step.status = TaskStepStatus::Skipped;
        }
        Ok(())
    }

    async fn session_tasks(
        &self,
        session_id: &str,
    ) -> Result<Vec<Task>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .tasks
            .iter()
            .filter(|task| task.session_id == session_id)
            .cloned()
            .collect())
    }
}
