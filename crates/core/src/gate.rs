//! Two-phase execution of mutating actions.
//!
//! A confirmable tool never mutates anything when the model calls it. It
//! records a pending [`Task`] through [`ConfirmationGate::create_pending_task`]
//! and hands the task id to the client. A later, independent request
//! resolves the task with [`ConfirmationGate::resolve`], which runs the
//! [`ConfirmedAction`] registered for the tool at most once.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::Locale;
use crate::store::{
    NewTask, StoreError, Task, TaskStatus, TaskStepStatus, TaskStore,
};
use crate::tool::Error as ToolError;

/// Errors raised while proposing or resolving a task.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// The task doesn't exist or belongs to someone else.
    #[error("action not found")]
    NotFound,
    /// The task was already resolved.
    #[error("action is already {status}")]
    Conflict {
        /// The status the task is in.
        status: TaskStatus,
    },
    /// No confirmed action is registered for the tool.
    #[error("unsupported action: {0}")]
    UnsupportedTool(String),
    /// The confirmed action failed.
    #[error("{0}")]
    Execution(String),
    /// The store failed.
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for GateError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => GateError::NotFound,
            err => GateError::Store(err),
        }
    }
}

/// Who resolves a task, and in which language they want the answer.
#[derive(Clone, Debug)]
pub struct ActionContext {
    /// The identity that created the task.
    pub user_id: String,
    /// The session the task was proposed in.
    pub session_id: String,
    /// The language of the success message.
    pub locale: Locale,
}

/// The routine that actually performs a confirmed mutation.
#[async_trait]
pub trait ConfirmedAction: Send + Sync {
    /// Performs the action and returns a message for the user.
    async fn execute(
        &self,
        input: Value,
        ctx: &ActionContext,
    ) -> Result<String, ToolError>;
}

/// Maps confirmable tool names to the routines that execute them.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn ConfirmedAction>>,
}

impl ActionRegistry {
    /// Creates an empty registry.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the routine for `tool_name`.
    #[inline]
    pub fn with_action<A: ConfirmedAction + 'static>(
        mut self,
        tool_name: impl Into<String>,
        action: A,
    ) -> Self {
        self.actions.insert(tool_name.into(), Arc::new(action));
        self
    }

    #[inline]
    fn get(&self, tool_name: &str) -> Option<&Arc<dyn ConfirmedAction>> {
        self.actions.get(tool_name)
    }
}

impl Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.actions.keys()).finish()
    }
}

/// A mutating action a tool wants to propose.
#[derive(Clone, Debug)]
pub struct TaskProposal {
    pub session_id: String,
    pub creator_id: String,
    /// Human-readable goal of the task.
    pub title: String,
    pub tool_name: String,
    /// The validated tool input to replay on confirmation.
    pub input: Value,
    pub metadata: Option<Value>,
}

/// Turns proposals into durable tasks and resolves them exactly once.
pub struct ConfirmationGate {
    store: Arc<dyn TaskStore>,
    actions: ActionRegistry,
}

impl ConfirmationGate {
    /// Creates a gate over `store`.
    pub fn new(store: Arc<dyn TaskStore>, actions: ActionRegistry) -> Self {
        Self { store, actions }
    }

    /// Creates one pending task with one pending step, and returns the
    /// task id.
    pub async fn create_pending_task(
        &self,
        proposal: TaskProposal,
    ) -> Result<String, GateError> {
        if self.actions.get(&proposal.tool_name).is_none() {
            return Err(GateError::UnsupportedTool(proposal.tool_name));
        }

        let task = self
            .store
            .create_task(NewTask {
                session_id: proposal.session_id,
                creator_id: proposal.creator_id,
                title: proposal.title,
                tool_name: proposal.tool_name,
                input: proposal.input,
                metadata: proposal.metadata,
            })
            .await
            .map_err(GateError::Store)?;
        debug!("created pending task {}", task.id);
        Ok(task.id)
    }

    /// Confirms or cancels a task on behalf of `user_id`.
    ///
    /// Only the creator can see a task. A task leaves `pending` through a
    /// conditional claim, so of two concurrent confirmations exactly one
    /// runs the action and the other gets [`GateError::Conflict`].
    /// Canceling twice returns the same message both times.
    pub async fn resolve(
        &self,
        task_id: &str,
        user_id: &str,
        confirmed: bool,
        locale: Locale,
    ) -> Result<String, GateError> {
        let task = self.store.task(task_id).await?;
        if task.creator_id != user_id {
            warn!("task {task_id} requested by a non-owner");
            return Err(GateError::NotFound);
        }

        if confirmed {
            self.confirm(task, locale).await
        } else {
            self.cancel(task, locale).await
        }
    }

    async fn cancel(
        &self,
        task: Task,
        locale: Locale,
    ) -> Result<String, GateError> {
        if task.status != TaskStatus::Canceled
            && !self.store.claim_task(&task.id, TaskStatus::Canceled).await?
        {
            // Someone else moved it first; only another cancel is fine.
            let current = self.store.task(&task.id).await?.status;
            if current != TaskStatus::Canceled {
                return Err(GateError::Conflict { status: current });
            }
        }
        self.store.skip_steps(&task.id).await?;
        info!("task {} canceled", task.id);
        Ok(locale.cancellation_message().to_owned())
    }

    async fn confirm(
        &self,
        task: Task,
        locale: Locale,
    ) -> Result<String, GateError> {
        if task.status != TaskStatus::Pending {
            return Err(GateError::Conflict {
                status: task.status,
            });
        }

        let steps = self.store.task_steps(&task.id).await?;
        let Some(step) = steps.into_iter().next() else {
            return Err(GateError::Execution(format!(
                "task {} has no steps",
                task.id
            )));
        };
        let Some(action) = self.actions.get(&step.tool_name).cloned() else {
            return Err(GateError::UnsupportedTool(step.tool_name));
        };

        if !self.store.claim_task(&task.id, TaskStatus::InProgress).await? {
            let current = self.store.task(&task.id).await?.status;
            return Err(GateError::Conflict { status: current });
        }
        if let Err(err) = self
            .store
            .set_step_status(&step.id, TaskStepStatus::InProgress, None)
            .await
        {
            // A claimed task can't go back to pending, so end it here.
            if let Err(err) =
                self.store.set_task_status(&task.id, TaskStatus::Failed).await
            {
                error!("failed to resolve task {}: {err}", task.id);
            }
            return Err(err.into());
        }

        let ctx = ActionContext {
            user_id: task.creator_id.clone(),
            session_id: task.session_id.clone(),
            locale,
        };
        info!("executing {} for task {}", step.tool_name, task.id);
        match action.execute(step.input, &ctx).await {
            Ok(message) => {
                self.store
                    .set_step_status(&step.id, TaskStepStatus::Completed, None)
                    .await?;
                self.store
                    .set_task_status(&task.id, TaskStatus::Completed)
                    .await?;
                Ok(message)
            }
            Err(err) => {
                let reason = err.reason().into_owned();
                warn!("task {} failed: {reason}", task.id);
                self.store
                    .set_step_status(
                        &step.id,
                        TaskStepStatus::Failed,
                        Some(&reason),
                    )
                    .await?;
                self.store
                    .set_task_status(&task.id, TaskStatus::Failed)
                    .await?;
                Err(GateError::Execution(reason))
            }
        }
    }
}

impl Debug for ConfirmationGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfirmationGate")
            .field("actions", &self.actions)
            .finish_non_exhaustive()
    }
}
